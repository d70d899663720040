//! Parallel directory tree walker
//!
//! Enumerates a source tree with a worker pool and emits one fully resolved
//! [`DirTreeEntry`] per path: the source lstat plus replica hosts and, when a
//! destination root is given, the destination's metadata.
//!
//! # Architecture
//!
//! ```text
//!                ┌─────────────────────────────────┐
//!                │  Traversal (pool handler)       │
//!                │  pending_dirs  pending_entries  │
//!                └────────────────┬────────────────┘
//!          LIST_DIR / FILE_INFO  │  one coordinator per worker
//!       ┌────────────────────────┼────────────────────────┐
//! ┌─────▼─────┐            ┌─────▼─────┐            ┌─────▼─────┐
//! │  Worker 0 │            │  Worker 1 │            │  Worker N │
//! │  session  │            │  session  │            │  session  │
//! └───────────┘            └───────────┘            └───────────┘
//!                                │ resolved entries
//!                         ┌──────▼──────┐
//!                         │   results   │ ──▶ next() / peek_next()
//!                         └─────────────┘
//! ```
//!
//! Entries arrive in info-fetch completion order, not tree order. The root
//! directory itself is not reported; a root that is not a directory is
//! reported alone with an empty subpath. Symlinks are reported and never
//! followed.

mod coordinator;
mod entry;
mod protocol;
mod worker;

pub use coordinator::{WalkCounters, WalkStats};
pub use entry::{DestInfo, DirTreeEntry, SourceInfo};

use crate::backend::trim_root;
use crate::engine::Engine;
use crate::error::Result;
use crate::pool::{PoolController, WorkerMain, WorkerPool};
use crate::queue::{BoundedQueue, Readiness};
use coordinator::Traversal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use worker::WalkContext;

/// How long [`DirTreeWalker::close`] lets workers finish before abandoning them
pub const CLOSE_TIMEOUT: Duration = Duration::from_millis(10_000);

/// A running or finished tree walk
pub struct DirTreeWalker {
    traversal: Arc<Traversal>,
    pool: WorkerPool<Traversal>,
    src_root: String,
    dst_root: Option<String>,
    closed: bool,
}

impl DirTreeWalker {
    /// Spawn the walker's workers; no traversal I/O happens until
    /// [`start`](Self::start)
    pub fn open(
        engine: &Engine,
        src_root: &str,
        dst_root: Option<&str>,
        parallelism: usize,
        capacity: usize,
        recursive: bool,
    ) -> Result<Self> {
        let src_root = trim_root(src_root);
        let dst_root = dst_root.map(trim_root);

        let results = BoundedQueue::new(capacity)?;
        let traversal = Arc::new(Traversal::new(parallelism, recursive, results));

        let ctx = Arc::new(WalkContext {
            connector: engine.connector(),
            src_root: src_root.clone(),
            dst_root: dst_root.clone(),
        });
        let main: WorkerMain = Arc::new(move |ep| worker::run(&ctx, ep));
        let pool = WorkerPool::new(engine, "walk", parallelism, main, Arc::clone(&traversal))?;

        debug!(src = %src_root, dst = ?dst_root, parallelism, recursive, "Walker opened");
        Ok(Self {
            traversal,
            pool,
            src_root,
            dst_root,
            closed: false,
        })
    }

    /// Begin the traversal
    pub fn start(&mut self) -> Result<()> {
        info!(src = %self.src_root, workers = self.pool.size(), "Starting tree walk");
        self.pool.start()?;
        Ok(())
    }

    pub fn src_root(&self) -> &str {
        &self.src_root
    }

    pub fn dst_root(&self) -> Option<&str> {
        self.dst_root.as_deref()
    }

    /// Next entry, blocking until one is resolved; `None` once the walk is
    /// complete
    pub fn next(&self) -> Option<DirTreeEntry> {
        self.traversal.results.dequeue().ok()
    }

    /// Copy of the next entry without removing it
    pub fn peek_next(&self) -> Option<DirTreeEntry> {
        self.traversal.results.peek().ok()
    }

    /// Whether an entry can be taken without blocking
    pub fn can_get(&self) -> Readiness {
        self.traversal.results.can_get()
    }

    /// Put the entry just peeked behind the ones queued after it
    ///
    /// Used when the consumer cannot act on an entry yet (for example every
    /// destination host is busy). The entry's `n_pending` count goes up.
    pub fn requeue_last(&self) {
        self.traversal.results.pending_with(|e| e.n_pending += 1);
    }

    /// Counters so far
    pub fn stats(&self) -> WalkStats {
        self.traversal.counters.snapshot()
    }

    /// Handle for stopping the walk from another thread
    pub fn controller(&self) -> PoolController {
        self.pool.controller()
    }

    /// Collect every remaining entry, then close the walker
    pub fn drain_to_vec(&mut self) -> Result<Vec<DirTreeEntry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next() {
            entries.push(entry);
        }
        self.close()?;
        Ok(entries)
    }

    /// Stop the walk if still running, discard undelivered entries and tear
    /// down the pool
    ///
    /// Returns the first fatal error the pool hit, if any.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.traversal.results.can_get() != Readiness::Finished {
            self.pool.terminate(CLOSE_TIMEOUT);
        }
        self.discard_results();
        self.pool.join()?;

        let stats = self.stats();
        info!(
            dirs = stats.dirs_listed,
            entries = stats.entries,
            skipped = stats.skipped,
            errors = stats.errors,
            "Tree walk closed"
        );
        Ok(())
    }

    /// Consume until end-of-stream so the pool's end rendezvous completes
    fn discard_results(&self) {
        if !self.pool.is_started() {
            return;
        }
        while self.traversal.results.dequeue().is_ok() {}
    }
}

impl Drop for DirTreeWalker {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::error::BackendErrorKind;

    fn tree() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.add_file("/src/a", 10);
        backend.add_file("/src/b", 0);
        backend.add_file("/src/d1/c", 5);
        backend.add_file("/src/d1/d2/e", 7);
        backend.mkdir_all("/src/empty");
        backend.add_symlink("/src/link", "a");
        backend
    }

    fn walk(backend: &MemoryBackend, root: &str, recursive: bool) -> Vec<DirTreeEntry> {
        let engine = Engine::new(backend.connector());
        let mut walker = DirTreeWalker::open(&engine, root, None, 3, 4, recursive).unwrap();
        walker.start().unwrap();
        let mut entries = walker.drain_to_vec().unwrap();
        entries.sort_by(|a, b| a.subpath.cmp(&b.subpath));
        entries
    }

    fn subpaths(entries: &[DirTreeEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.subpath.as_str()).collect()
    }

    #[test]
    fn test_recursive_walk_reports_every_path_once() {
        let entries = walk(&tree(), "/src/", true);
        assert_eq!(
            subpaths(&entries),
            vec!["a", "b", "d1", "d1/c", "d1/d2", "d1/d2/e", "empty", "link"]
        );
        let a = &entries[0];
        assert!(a.is_file());
        assert_eq!(a.src.size, 10);
        assert!(a.dst.is_none());
        assert!(entries[7].src.entry_type.is_symlink());
    }

    #[test]
    fn test_non_recursive_walk() {
        let entries = walk(&tree(), "/src", false);
        assert_eq!(subpaths(&entries), vec!["a", "b", "d1", "empty", "link"]);
    }

    #[test]
    fn test_single_file_root() {
        let entries = walk(&tree(), "/src/d1/c", true);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].subpath, "");
        assert_eq!(entries[0].src.size, 5);
    }

    #[test]
    fn test_destination_metadata_resolved() {
        let backend = MemoryBackend::new();
        backend.add_replicated_file("/src/f", 4, &["h1", "h2"]);
        backend.add_file("/src/new", 1);
        backend.add_replicated_file("/dst/f", 4, &["h3"]);

        let engine = Engine::new(backend.connector());
        let mut walker = DirTreeWalker::open(&engine, "/src", Some("/dst"), 2, 8, true).unwrap();
        walker.start().unwrap();
        let mut entries = walker.drain_to_vec().unwrap();
        entries.sort_by(|a, b| a.subpath.cmp(&b.subpath));

        assert_eq!(entries[0].src.replicas, vec!["h1", "h2"]);
        let dst = entries[0].dst.as_ref().unwrap();
        assert_eq!(dst.replicas, vec!["h3"]);
        assert!(entries[0].can_skip_copy(true));
        assert!(entries[1].dst.is_none());
    }

    #[test]
    fn test_unreadable_directory_is_skipped() {
        let backend = tree();
        backend.inject_fault("list_directory", Some("/src/d1"), BackendErrorKind::Other, 1);

        let engine = Engine::new(backend.connector());
        let mut walker = DirTreeWalker::open(&engine, "/src", None, 2, 4, true).unwrap();
        walker.start().unwrap();
        let mut count = 0;
        while walker.next().is_some() {
            count += 1;
        }
        let stats = walker.stats();
        walker.close().unwrap();

        // d1 itself is still reported; its children are not
        assert_eq!(count, 5);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn test_requeue_last_counts_pending() {
        let backend = MemoryBackend::new();
        backend.add_file("/src/only", 1);

        let engine = Engine::new(backend.connector());
        let mut walker = DirTreeWalker::open(&engine, "/src", None, 1, 4, true).unwrap();
        walker.start().unwrap();
        assert_eq!(walker.peek_next().unwrap().n_pending, 0);
        walker.requeue_last();
        walker.requeue_last();
        let entry = walker.next().unwrap();
        assert_eq!(entry.n_pending, 2);
        assert!(walker.next().is_none());
        walker.close().unwrap();
    }

    #[test]
    fn test_close_mid_walk() {
        let backend = MemoryBackend::new();
        for i in 0..200 {
            backend.add_file(&format!("/src/f{}", i), 1);
        }
        let engine = Engine::new(backend.connector());
        let mut walker = DirTreeWalker::open(&engine, "/src", None, 2, 2, true).unwrap();
        walker.start().unwrap();
        assert!(walker.next().is_some());
        walker.close().unwrap();
        assert_eq!(engine.live_pools(), 0);
    }
}
