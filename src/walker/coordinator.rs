//! Walk coordinator - the pool handler that schedules the traversal
//!
//! Every coordinator thread asks [`Traversal::send`] what its worker should
//! do next. Pending entries go first (bounding how much listed-but-unresolved
//! state piles up), then directory listings, but only while no info-fetch is
//! in flight. Once both FIFOs are empty and every coordinator is idle the
//! walk is complete and each worker is told to terminate.

use super::entry::{DestInfo, DirTreeEntry};
use super::protocol::*;
use crate::backend::{EntryType, FileStat, Timespec};
use crate::error::{PoolError, PoolResult, QueueError, WireError};
use crate::pool::{Frame, PoolHandler, Step, WorkerLink};
use crate::queue::BoundedQueue;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, warn};

/// Walk statistics
#[derive(Debug, Default)]
pub struct WalkCounters {
    /// Directories listed
    pub dirs_listed: AtomicU64,

    /// Entries delivered to the results queue
    pub entries: AtomicU64,

    /// Regular files among them
    pub files: AtomicU64,

    /// Bytes in those files
    pub bytes: AtomicU64,

    /// Directories that could not be read
    pub skipped: AtomicU64,

    /// Entries that could not be resolved
    pub errors: AtomicU64,
}

impl WalkCounters {
    fn record_dir(&self) {
        self.dirs_listed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_entry(&self, entry: &DirTreeEntry) {
        self.entries.fetch_add(1, Ordering::Relaxed);
        if entry.is_file() {
            self.files.fetch_add(1, Ordering::Relaxed);
            self.bytes.fetch_add(entry.src.size, Ordering::Relaxed);
        }
    }

    fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WalkStats {
        WalkStats {
            dirs_listed: self.dirs_listed.load(Ordering::Relaxed),
            entries: self.entries.load(Ordering::Relaxed),
            files: self.files.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`WalkCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub dirs_listed: u64,
    pub entries: u64,
    pub files: u64,
    pub bytes: u64,
    pub skipped: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
struct WalkState {
    pending_dirs: VecDeque<String>,
    pending_entries: VecDeque<DirTreeEntry>,
    /// Info-fetches sent and not yet answered
    fetching: usize,
    /// Coordinators waiting with nothing to dispatch
    idle: usize,
    /// Every coordinator was idle at once; the walk is over
    done: bool,
    /// Stop or terminate was requested
    stopping: bool,
}

enum Request {
    ListDir(String),
    FileInfo(DirTreeEntry),
    Terminate,
}

/// Shared traversal state; the pool handler for the walker
pub(crate) struct Traversal {
    state: Mutex<WalkState>,
    /// Signalled when new work arrives or the walk ends
    idle_cv: Condvar,
    /// Signalled when an info-fetch completes
    fetched_cv: Condvar,
    parallelism: usize,
    recursive: bool,
    pub results: BoundedQueue<DirTreeEntry>,
    pub counters: WalkCounters,
}

impl Traversal {
    pub fn new(parallelism: usize, recursive: bool, results: BoundedQueue<DirTreeEntry>) -> Self {
        let mut state = WalkState::default();
        // the root itself is listed first
        state.pending_dirs.push_back(String::new());
        Self {
            state: Mutex::new(state),
            idle_cv: Condvar::new(),
            fetched_cv: Condvar::new(),
            parallelism,
            recursive,
            results,
            counters: WalkCounters::default(),
        }
    }

    fn wake_all(&self) {
        self.idle_cv.notify_all();
        self.fetched_cv.notify_all();
    }

    /// Pick the next request for a ready worker, blocking as needed
    fn next_request(&self, stop: bool) -> Request {
        let mut st = self.state.lock();
        loop {
            if stop || st.stopping || st.done {
                st.stopping |= stop;
                self.wake_all();
                return Request::Terminate;
            }

            if let Some(entry) = st.pending_entries.pop_front() {
                st.fetching += 1;
                return Request::FileInfo(entry);
            }

            if st.fetching > 0 {
                self.fetched_cv.wait(&mut st);
                continue;
            }

            if let Some(dir) = st.pending_dirs.pop_front() {
                return Request::ListDir(dir);
            }

            st.idle += 1;
            if st.idle >= self.parallelism {
                debug!("All walker coordinators idle; walk complete");
                st.done = true;
                self.wake_all();
                return Request::Terminate;
            }
            while !st.done
                && !st.stopping
                && st.pending_entries.is_empty()
                && st.pending_dirs.is_empty()
            {
                self.idle_cv.wait(&mut st);
            }
            st.idle -= 1;
        }
    }

    /// Queue a listing's entries and, when recursive, its subdirectories
    fn add_listing(&self, listed: Vec<DirTreeEntry>) {
        let mut st = self.state.lock();
        for entry in listed {
            if self.recursive && entry.is_dir() && !entry.subpath.is_empty() {
                st.pending_dirs.push_back(entry.subpath.clone());
            }
            st.pending_entries.push_back(entry);
        }
        drop(st);
        self.wake_all();
    }

    /// Deliver a resolved entry (if any) and count the fetch as complete
    fn finish_fetch(&self, resolved: Option<DirTreeEntry>) {
        if let Some(entry) = resolved {
            self.counters.record_entry(&entry);
            match self.results.enter(entry) {
                Ok(()) => {}
                Err(QueueError::Finishing) => debug!("Results closed; entry dropped"),
                Err(e) => error!(error = %e, "Failed to queue walk result"),
            }
        }

        let mut st = self.state.lock();
        st.fetching = st.fetching.saturating_sub(1);
        drop(st);
        self.fetched_cv.notify_all();
    }

    /// Lengths of the pending directory and entry FIFOs
    #[cfg(test)]
    fn pending(&self) -> (usize, usize) {
        let st = self.state.lock();
        (st.pending_dirs.len(), st.pending_entries.len())
    }
}

fn read_stat_record(link: &mut WorkerLink<DirTreeEntry>) -> PoolResult<(String, FileStat)> {
    let subpath = link.read_string()?;
    let sec = link.read_i64()?;
    let nsec = link.read_i32()?;
    let mode = link.read_i32()?;
    let nlink = link.read_i64()?;
    let entry_type = EntryType::from_wire(link.read_i32()?);
    let size = link.read_i64()?;
    // mode carries permissions; the type travels separately
    let mode = entry_type.mode_bits() | ((mode as u32) & 0o7777);
    Ok((
        subpath,
        FileStat {
            mode,
            nlink: nlink.max(0) as u64,
            size: size.max(0) as u64,
            atime: Timespec::default(),
            mtime: Timespec::new(sec, nsec.max(0) as u32),
        },
    ))
}

fn read_listing(link: &mut WorkerLink<DirTreeEntry>) -> PoolResult<Vec<DirTreeEntry>> {
    let mut listed = Vec::new();
    loop {
        match link.read_i32()? {
            TAG_NAME => {
                let (subpath, stat) = read_stat_record(link)?;
                listed.push(DirTreeEntry::listed(subpath, &stat));
            }
            TAG_ENTRY_END => return Ok(listed),
            tag => {
                return Err(PoolError::fatal(
                    link.id(),
                    WireError::UnexpectedTag {
                        what: "listing",
                        tag,
                    },
                ))
            }
        }
    }
}

fn read_file_info(
    link: &mut WorkerLink<DirTreeEntry>,
    mut entry: DirTreeEntry,
) -> PoolResult<DirTreeEntry> {
    entry.src.replicas = link.read_strings()?;
    if link.read_bool()? {
        let sec = link.read_i64()?;
        let nsec = link.read_i32()?;
        let entry_type = EntryType::from_wire(link.read_i32()?);
        let size = link.read_i64()?;
        let replicas = link.read_strings()?;
        entry.dst = Some(DestInfo {
            mtime: Timespec::new(sec, nsec.max(0) as u32),
            entry_type,
            size: size.max(0) as u64,
            replicas,
        });
    }
    Ok(entry)
}

impl PoolHandler for Traversal {
    type Data = DirTreeEntry;

    fn send(&self, link: &mut WorkerLink<DirTreeEntry>, stop: bool) -> PoolResult<Step> {
        let mut frame = Frame::new();
        match self.next_request(stop) {
            Request::FileInfo(entry) => {
                frame
                    .put_i32(OP_FILE_INFO)
                    .put_str(&entry.subpath)
                    .put_bool(entry.is_file());
                link.set_data(entry);
            }
            Request::ListDir(subpath) => {
                frame.put_i32(OP_LIST_DIR).put_str(&subpath);
            }
            Request::Terminate => {
                frame.put_i32(OP_TERMINATE);
            }
        }
        link.send(&frame)?;
        Ok(Step::Next)
    }

    fn recv(&self, link: &mut WorkerLink<DirTreeEntry>) -> PoolResult<Step> {
        match link.read_i32()? {
            ST_DENTS_OK => {
                let listed = read_listing(link)?;
                self.counters.record_dir();
                self.add_listing(listed);
            }
            ST_FINFO_OK => {
                let entry = link
                    .take_data()
                    .ok_or_else(|| PoolError::fatal(link.id(), "file info without a request"))?;
                let entry = read_file_info(link, entry)?;
                self.finish_fetch(Some(entry));
            }
            ST_IGNORE => {
                let message = link.read_string()?;
                self.counters.record_skip();
                warn!(worker = link.id(), "Directory skipped: {}", message);
            }
            ST_NG => {
                let message = link.read_string()?;
                self.counters.record_error();
                error!(worker = link.id(), "Entry failed: {}", message);
                if link.take_data().is_some() {
                    self.finish_fetch(None);
                }
            }
            ST_END => return Ok(Step::End),
            tag => {
                return Err(PoolError::fatal(
                    link.id(),
                    WireError::UnexpectedTag {
                        what: "walker status",
                        tag,
                    },
                ))
            }
        }
        Ok(Step::Next)
    }

    fn end(&self) {
        self.results.finish_and_wait();
    }

    fn interrupted(&self) {
        self.state.lock().stopping = true;
        self.wake_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(subpath: &str) -> DirTreeEntry {
        DirTreeEntry::listed(
            subpath.to_string(),
            &FileStat {
                mode: EntryType::File.mode_bits() | 0o644,
                ..FileStat::default()
            },
        )
    }

    fn dir(subpath: &str) -> DirTreeEntry {
        DirTreeEntry::listed(
            subpath.to_string(),
            &FileStat {
                mode: EntryType::Directory.mode_bits() | 0o755,
                ..FileStat::default()
            },
        )
    }

    fn traversal(parallelism: usize, recursive: bool) -> Traversal {
        Traversal::new(parallelism, recursive, BoundedQueue::new(16).unwrap())
    }

    #[test]
    fn test_root_listed_first() {
        let t = traversal(1, true);
        assert!(matches!(t.next_request(false), Request::ListDir(ref s) if s.is_empty()));
    }

    #[test]
    fn test_entries_before_directories() {
        let t = traversal(2, true);
        let _root = t.next_request(false);
        t.add_listing(vec![dir("d"), file("f")]);
        assert_eq!(t.pending(), (1, 2));

        assert!(matches!(t.next_request(false), Request::FileInfo(ref e) if e.subpath == "d"));
        assert!(matches!(t.next_request(false), Request::FileInfo(ref e) if e.subpath == "f"));
        t.finish_fetch(None);
        t.finish_fetch(None);
        assert!(matches!(t.next_request(false), Request::ListDir(ref s) if s == "d"));
    }

    #[test]
    fn test_non_recursive_queues_no_directories() {
        let t = traversal(1, false);
        let _root = t.next_request(false);
        t.add_listing(vec![dir("d"), file("f")]);
        assert_eq!(t.pending(), (0, 2));
    }

    #[test]
    fn test_single_idle_coordinator_terminates() {
        let t = traversal(1, true);
        let _root = t.next_request(false);
        t.add_listing(Vec::new());
        assert!(matches!(t.next_request(false), Request::Terminate));
        // later callers see the finished walk too
        assert!(matches!(t.next_request(false), Request::Terminate));
    }

    #[test]
    fn test_stop_discards_pending_work() {
        let t = traversal(1, true);
        assert!(matches!(t.next_request(true), Request::Terminate));
        assert_eq!(t.pending(), (1, 0));
    }
}
