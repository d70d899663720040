//! Resolved tree entries

use crate::backend::{join_path, EntryType, FileStat, Timespec};

/// Source side of an entry, from the listing plus replica lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub mtime: Timespec,
    pub mode: u32,
    pub nlink: u64,
    pub entry_type: EntryType,
    pub size: u64,
    /// Hosts holding a replica (regular files only)
    pub replicas: Vec<String>,
}

impl SourceInfo {
    pub fn from_stat(stat: &FileStat) -> Self {
        Self {
            mtime: stat.mtime,
            mode: stat.mode,
            nlink: stat.nlink,
            entry_type: stat.entry_type(),
            size: stat.size,
            replicas: Vec::new(),
        }
    }
}

/// Destination side of an entry, present when the destination path exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestInfo {
    pub mtime: Timespec,
    pub entry_type: EntryType,
    pub size: u64,
    pub replicas: Vec<String>,
}

/// One walked path with its source and destination metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirTreeEntry {
    /// Path relative to the walk roots; empty for a single-file root
    pub subpath: String,

    pub src: SourceInfo,

    /// `None` when no destination root was given or the path is absent
    pub dst: Option<DestInfo>,

    /// Times the consumer has put this entry back with `requeue_last`
    pub n_pending: u32,
}

impl DirTreeEntry {
    pub(crate) fn listed(subpath: String, stat: &FileStat) -> Self {
        Self {
            subpath,
            src: SourceInfo::from_stat(stat),
            dst: None,
            n_pending: 0,
        }
    }

    pub fn is_file(&self) -> bool {
        self.src.entry_type.is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.src.entry_type.is_dir()
    }

    /// Whether an existing destination can be left as it is
    ///
    /// Normally any destination at least as new as the source is kept. With
    /// `force`, only one with the same size and mtime seconds is. Entry types
    /// are not compared; callers check that the destination is of the kind
    /// they would create.
    pub fn can_skip_copy(&self, force: bool) -> bool {
        match &self.dst {
            None => false,
            Some(dst) if force => dst.size == self.src.size && dst.mtime.sec == self.src.mtime.sec,
            Some(dst) => self.src.mtime.sec <= dst.mtime.sec,
        }
    }

    /// Full path of this entry under `root`
    pub fn path_under(&self, root: &str) -> String {
        join_path(root, &self.subpath)
    }
}

/// Subpath of `name` inside the directory at `parent`
pub(crate) fn child_subpath(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_stat(size: u64, mtime: i64) -> FileStat {
        FileStat {
            mode: EntryType::File.mode_bits() | 0o644,
            nlink: 1,
            size,
            atime: Timespec::default(),
            mtime: Timespec::new(mtime, 0),
        }
    }

    #[test]
    fn test_child_subpath() {
        assert_eq!(child_subpath("", "a"), "a");
        assert_eq!(child_subpath("a/b", "c"), "a/b/c");
    }

    fn with_dst(entry: &DirTreeEntry, size: u64, mtime: i64) -> DirTreeEntry {
        let mut entry = entry.clone();
        entry.dst = Some(DestInfo {
            mtime: Timespec::new(mtime, 999),
            entry_type: EntryType::File,
            size,
            replicas: Vec::new(),
        });
        entry
    }

    #[test]
    fn test_can_skip_copy() {
        let entry = DirTreeEntry::listed("f".into(), &file_stat(10, 100));
        assert!(!entry.can_skip_copy(false));
        assert!(!entry.can_skip_copy(true));

        // a newer destination is kept unless forced
        let newer = with_dst(&entry, 3, 200);
        assert!(newer.can_skip_copy(false));
        assert!(!newer.can_skip_copy(true));

        let older = with_dst(&entry, 10, 99);
        assert!(!older.can_skip_copy(false));
        assert!(!older.can_skip_copy(true));

        let same = with_dst(&entry, 10, 100);
        assert!(same.can_skip_copy(false));
        assert!(same.can_skip_copy(true));
        assert!(!with_dst(&entry, 11, 100).can_skip_copy(true));
    }

    #[test]
    fn test_path_under() {
        let entry = DirTreeEntry::listed(String::new(), &file_stat(1, 0));
        assert_eq!(entry.path_under("/data/file"), "/data/file");
        let entry = DirTreeEntry::listed("x/y".into(), &file_stat(1, 0));
        assert_eq!(entry.path_under("/data"), "/data/x/y");
    }
}
