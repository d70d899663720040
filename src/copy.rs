//! Copying a walked tree
//!
//! Regular files become [`FileCopy`] tasks for the dispatcher. Directories
//! and symlinks are cheap metadata operations, so [`TreeCopy`] makes them
//! directly on its own session as the entries arrive. Entries come from the
//! walker in discovery order, so a directory is always handled before any
//! entry inside it.
//!
//! An existing destination is kept when [`DirTreeEntry::can_skip_copy`]
//! allows it and it is of the same kind as the source. Otherwise a regular
//! file is overwritten in place by the copy's rename, and anything else
//! standing in the way is removed first.

use crate::backend::{join_path, EntryType, Session};
use crate::dispatch::FileCopy;
use crate::engine::Engine;
use crate::error::{BackendError, BackendErrorKind, BackendResult};
use crate::walker::DirTreeEntry;
use tracing::{debug, info, warn};

/// Mode of a destination root created for a directory source
const ROOT_DIR_MODE: u32 = 0o755;

/// How existing destinations are treated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyPolicy {
    /// Keep a destination only when size and mtime match exactly
    pub force: bool,

    /// Let the copy worker compare again and tolerate concurrent creators
    pub skip_existing: bool,

    /// Leave the destination untouched; files still go to the (simulating)
    /// dispatcher
    pub simulate: bool,
}

/// Work done outside the dispatcher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeCopyStats {
    pub dirs_created: u64,
    pub symlinks_created: u64,
    /// Files and links left alone because the destination was up to date
    pub skipped: u64,
    pub skipped_bytes: u64,
    /// Directories, links or obstructing entries that could not be handled
    pub failures: u64,
}

/// Mirrors directories and symlinks and plans file copies for one tree
pub struct TreeCopy {
    session: Box<dyn Session>,
    src_root: String,
    dst_root: String,
    policy: CopyPolicy,
    stats: TreeCopyStats,
}

impl TreeCopy {
    /// Open a session and resolve where the source root lands
    ///
    /// A directory source maps onto `dst_root`, which is created when
    /// missing. A file source copied onto an existing directory lands inside
    /// it under its own name; otherwise it is copied to `dst_root` itself.
    pub fn new(
        engine: &Engine,
        src_root: &str,
        dst_root: &str,
        policy: CopyPolicy,
    ) -> BackendResult<Self> {
        let session = engine.connector().connect()?;
        let mut tree = Self {
            session,
            src_root: src_root.to_string(),
            dst_root: dst_root.to_string(),
            policy,
            stats: TreeCopyStats::default(),
        };
        tree.dst_root = tree.resolve_root(dst_root)?;
        Ok(tree)
    }

    fn resolve_root(&mut self, dst_root: &str) -> BackendResult<String> {
        let src = self.session.stat_path(&self.src_root)?;
        let dst = match self.session.stat_path(dst_root) {
            Ok(stat) => Some(stat),
            Err(e) if e.kind == BackendErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };

        if !src.is_dir() {
            return Ok(match dst {
                Some(d) if d.is_dir() => join_path(dst_root, basename(&self.src_root)),
                _ => dst_root.to_string(),
            });
        }

        match dst {
            Some(d) if d.is_dir() => {}
            Some(_) => {
                return Err(BackendError::new(BackendErrorKind::NotADirectory, "mkdir", dst_root))
            }
            None if self.policy.simulate => {}
            None => {
                self.session.mkdir(dst_root, ROOT_DIR_MODE)?;
                info!(path = %dst_root, "Created destination directory");
            }
        }
        Ok(dst_root.to_string())
    }

    /// Destination path the source root maps to
    pub fn dst_root(&self) -> &str {
        &self.dst_root
    }

    pub fn stats(&self) -> TreeCopyStats {
        self.stats
    }

    /// Handle one walked entry
    ///
    /// Returns the copy to dispatch when the entry is a regular file that
    /// needs one.
    pub fn prepare(&mut self, entry: &DirTreeEntry) -> Option<FileCopy> {
        let dst = entry.path_under(&self.dst_root);
        match entry.src.entry_type {
            EntryType::File => self.plan_file(entry, dst),
            EntryType::Directory => {
                self.make_dir(entry, &dst);
                None
            }
            EntryType::Symlink => {
                self.copy_symlink(entry, &dst);
                None
            }
            other => {
                warn!(path = %dst, kind = %other, "Cannot copy (unsupported type)");
                None
            }
        }
    }

    fn plan_file(&mut self, entry: &DirTreeEntry, dst: String) -> Option<FileCopy> {
        if let Some(existing) = &entry.dst {
            if existing.entry_type.is_file() {
                if entry.can_skip_copy(self.policy.force) {
                    info!(path = %dst, "skip: already exists");
                    self.stats.skipped += 1;
                    self.stats.skipped_bytes += entry.src.size;
                    return None;
                }
            } else if !self.policy.simulate && !self.remove_obstruction(entry, &dst) {
                return None;
            }
        }

        let src = entry.path_under(&self.src_root);
        Some(FileCopy::new(src, dst, entry.src.size).skip_existing(self.policy.skip_existing))
    }

    fn make_dir(&mut self, entry: &DirTreeEntry, dst: &str) {
        if self.policy.simulate {
            return;
        }
        if let Some(existing) = &entry.dst {
            if existing.entry_type.is_dir() {
                return;
            }
            if !self.remove_obstruction(entry, dst) {
                return;
            }
        }
        match self.session.mkdir(dst, entry.src.mode & 0o7777) {
            Ok(()) => {
                self.stats.dirs_created += 1;
                debug!(path = %dst, "mkdir");
            }
            Err(e) if e.kind == BackendErrorKind::AlreadyExists => {}
            Err(e) => {
                warn!(error = %e, "Cannot create directory");
                self.stats.failures += 1;
            }
        }
    }

    fn copy_symlink(&mut self, entry: &DirTreeEntry, dst: &str) {
        if let Some(existing) = &entry.dst {
            if existing.entry_type.is_symlink() && entry.can_skip_copy(self.policy.force) {
                info!(path = %dst, "skip: symlink already exists");
                self.stats.skipped += 1;
                return;
            }
            if !self.policy.simulate && !self.remove_obstruction(entry, dst) {
                return;
            }
        }
        if self.policy.simulate {
            return;
        }

        let src = entry.path_under(&self.src_root);
        let linked = self
            .session
            .read_link(&src)
            .and_then(|target| self.session.symlink(&target, dst).map(|()| target));
        match linked {
            Ok(target) => {
                self.stats.symlinks_created += 1;
                debug!(path = %dst, target = %target, "symlink");
            }
            Err(e) if self.policy.skip_existing && e.kind == BackendErrorKind::AlreadyExists => {
                debug!(path = %dst, "symlink created concurrently");
            }
            Err(e) => {
                warn!(error = %e, "Cannot copy symlink");
                self.stats.failures += 1;
                return;
            }
        }

        let mtime = entry.src.mtime;
        match self.session.set_link_times(dst, mtime, mtime) {
            Ok(()) => {}
            Err(e) if e.kind == BackendErrorKind::Unsupported => {
                debug!(error = %e, "Symlink mtime not kept")
            }
            Err(e) => {
                warn!(error = %e, "Cannot set symlink mtime");
                self.stats.failures += 1;
            }
        }
    }

    /// Remove whatever is at `dst` so an entry of another kind can take its
    /// place; false when it could not be removed
    fn remove_obstruction(&mut self, entry: &DirTreeEntry, dst: &str) -> bool {
        let Some(existing) = &entry.dst else {
            return true;
        };
        let removed = if existing.entry_type.is_dir() {
            self.session.rmdir(dst)
        } else {
            self.session.unlink(dst)
        };
        match removed {
            Ok(()) => {
                debug!(path = %dst, kind = %existing.entry_type, "Removed to overwrite");
                true
            }
            Err(e) if e.kind == BackendErrorKind::NotFound => true,
            Err(e) => {
                warn!(error = %e, "Cannot overwrite");
                self.stats.failures += 1;
                false
            }
        }
    }
}

/// Last path component, ignoring trailing separators
fn basename(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[test]
    fn test_basename() {
        assert_eq!(basename("/data/f1"), "f1");
        assert_eq!(basename("/data/dir/"), "dir");
        assert_eq!(basename("f"), "f");
    }

    #[test]
    fn test_file_into_existing_directory_keeps_name() {
        let backend = MemoryBackend::new();
        backend.add_file("/a/f1", 8);
        backend.mkdir_all("/b");
        let engine = Engine::new(backend.connector());

        let tree = TreeCopy::new(&engine, "/a/f1", "/b", CopyPolicy::default()).unwrap();
        assert_eq!(tree.dst_root(), "/b/f1");

        let tree = TreeCopy::new(&engine, "/a/f1", "/b/renamed", CopyPolicy::default()).unwrap();
        assert_eq!(tree.dst_root(), "/b/renamed");
    }

    #[test]
    fn test_directory_root_created_unless_simulating() {
        let backend = MemoryBackend::new();
        backend.add_file("/a/f1", 8);
        backend.add_file("/file", 1);
        let engine = Engine::new(backend.connector());

        let simulate = CopyPolicy {
            simulate: true,
            ..CopyPolicy::default()
        };
        TreeCopy::new(&engine, "/a", "/b", simulate).unwrap();
        assert!(!backend.exists("/b"));

        TreeCopy::new(&engine, "/a", "/b", CopyPolicy::default()).unwrap();
        assert!(backend.stat("/b").unwrap().is_dir());

        let err = TreeCopy::new(&engine, "/a", "/file", CopyPolicy::default()).err().unwrap();
        assert_eq!(err.kind, BackendErrorKind::NotADirectory);
    }
}
