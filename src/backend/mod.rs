//! Collaborator interfaces the workers call
//!
//! The engine never talks to a filesystem or metadata service directly. Each
//! worker opens its own [`Session`] through the engine's [`Connector`] and
//! keeps it for its lifetime; sessions are never shared between threads, so
//! backends with non-thread-safe clients need no locking.
//!
//! Every call returns a [`BackendError`] classified by kind. Connection
//! errors get exactly one retry after reconnecting, through
//! [`WorkerSession::call`]; everything else goes straight back to the caller.

pub mod local;
pub mod memory;
pub mod types;

pub use local::LocalBackend;
pub use memory::{MemoryBackend, MemoryConnector};
pub use types::{join_path, trim_root, DirEntry, EntryType, FileStat, Timespec};

use crate::error::{BackendError, BackendResult};
use crate::pool::WorkerLog;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Metadata service operations
pub trait MetadataClient {
    /// Names and lstat results of a directory's children
    fn list_directory(&mut self, path: &str) -> BackendResult<Vec<DirEntry>>;

    /// lstat a single path
    fn stat_path(&mut self, path: &str) -> BackendResult<FileStat>;

    /// Hosts holding a replica of a regular file
    fn replica_hosts(&mut self, path: &str) -> BackendResult<Vec<String>>;

    /// Hosts eligible for placement, optionally narrowed to a domain
    fn schedule_hosts(&mut self, domain: Option<&str>) -> BackendResult<Vec<String>>;
}

/// A writable file being created by a copy
pub trait FileSink: Write {
    /// Flush data to stable storage
    fn sync(&mut self) -> io::Result<()>;
}

/// Storage operations
pub trait StorageBackend {
    /// Create a replica of `path` on `dst_host`, reading from `src_host`
    /// if given
    fn replicate(&mut self, path: &str, src_host: Option<&str>, dst_host: &str)
        -> BackendResult<()>;

    /// Delete the replica of `path` held by `host`
    fn remove_replica(&mut self, path: &str, host: &str) -> BackendResult<()>;

    /// Free bytes on `host`
    fn disk_avail(&mut self, host: &str) -> BackendResult<u64>;

    /// Open a file for reading, optionally from a specific host
    fn open_read(&mut self, path: &str, host: Option<&str>) -> BackendResult<Box<dyn Read>>;

    /// Create a file for writing; `exclusive` fails with AlreadyExists
    fn create(
        &mut self,
        path: &str,
        mode: u32,
        exclusive: bool,
        host: Option<&str>,
    ) -> BackendResult<Box<dyn FileSink>>;

    /// Set access and modification times
    fn set_times(&mut self, path: &str, atime: Timespec, mtime: Timespec) -> BackendResult<()>;

    fn rename(&mut self, from: &str, to: &str) -> BackendResult<()>;

    fn unlink(&mut self, path: &str) -> BackendResult<()>;

    /// Create one directory; AlreadyExists when the path is taken
    fn mkdir(&mut self, path: &str, mode: u32) -> BackendResult<()>;

    /// Remove an empty directory
    fn rmdir(&mut self, path: &str) -> BackendResult<()>;

    /// Target of a symbolic link
    fn read_link(&mut self, path: &str) -> BackendResult<String>;

    /// Create a symbolic link at `path` pointing to `target`
    fn symlink(&mut self, target: &str, path: &str) -> BackendResult<()>;

    /// Set the times of a symbolic link itself, not its target
    fn set_link_times(&mut self, path: &str, atime: Timespec, mtime: Timespec)
        -> BackendResult<()>;
}

/// Everything a worker needs from one backend connection
pub trait Session: MetadataClient + StorageBackend {}

impl<T: MetadataClient + StorageBackend> Session for T {}

/// Opens sessions; shared by every worker of every pool in an engine
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BackendResult<Box<dyn Session>>;
}

/// A worker's session plus the reconnect-once retry policy
pub struct WorkerSession {
    connector: Arc<dyn Connector>,
    session: Box<dyn Session>,
    reconnects: u64,
}

impl WorkerSession {
    /// Connect a new session
    pub fn open(connector: Arc<dyn Connector>) -> BackendResult<Self> {
        let session = connector.connect()?;
        Ok(Self {
            connector,
            session,
            reconnects: 0,
        })
    }

    /// Run `op`, reconnecting and retrying once on a connection error
    ///
    /// Each call has its own retry budget; a second failure is returned.
    pub fn call<T>(
        &mut self,
        log: &mut WorkerLog,
        mut op: impl FnMut(&mut dyn Session) -> BackendResult<T>,
    ) -> BackendResult<T> {
        match op(self.session.as_mut()) {
            Err(e) if e.is_retryable() => {
                log.warn(format_args!("{}: reconnecting", e));
                self.reconnect()?;
                let retried = op(self.session.as_mut());
                match &retried {
                    Ok(_) => log.info(format_args!("{}({}): retry OK", e.op, e.path)),
                    Err(again) => log.debug(format_args!("retry failed: {}", again)),
                }
                retried
            }
            other => other,
        }
    }

    /// The raw session, without retry
    pub fn session(&mut self) -> &mut dyn Session {
        self.session.as_mut()
    }

    /// Replace the session with a fresh connection
    pub fn reconnect(&mut self) -> BackendResult<()> {
        self.session = self.connector.connect()?;
        self.reconnects += 1;
        Ok(())
    }

    /// Number of reconnects so far
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }
}

/// Map a std I/O error from a sink or reader into a backend error
pub(crate) fn io_error(op: &'static str, path: &str, err: &io::Error) -> BackendError {
    BackendError::from_io(op, path, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendErrorKind;
    use crate::pool::pipe;

    fn log() -> (WorkerLog, crate::pool::PipeReader) {
        let (w, r) = pipe();
        (WorkerLog::new(w), r)
    }

    #[test]
    fn test_call_retries_connection_error_once() {
        let backend = MemoryBackend::new();
        backend.add_file("/f", 3);
        backend.inject_fault("stat_path", Some("/f"), BackendErrorKind::ConnectionError, 1);

        let (mut log, _r) = log();
        let mut session = WorkerSession::open(Arc::new(backend.connector())).unwrap();
        let stat = session.call(&mut log, |s| s.stat_path("/f")).unwrap();
        assert_eq!(stat.size, 3);
        assert_eq!(session.reconnects(), 1);
        assert_eq!(backend.connections(), 2);
    }

    #[test]
    fn test_call_surfaces_second_connection_error() {
        let backend = MemoryBackend::new();
        backend.add_file("/f", 3);
        backend.inject_fault("stat_path", Some("/f"), BackendErrorKind::ConnectionError, 2);

        let (mut log, _r) = log();
        let mut session = WorkerSession::open(Arc::new(backend.connector())).unwrap();
        let err = session.call(&mut log, |s| s.stat_path("/f")).unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::ConnectionError);
        assert_eq!(session.reconnects(), 1);
    }

    #[test]
    fn test_call_does_not_retry_other_errors() {
        let backend = MemoryBackend::new();
        let (mut log, _r) = log();
        let mut session = WorkerSession::open(Arc::new(backend.connector())).unwrap();
        let err = session.call(&mut log, |s| s.stat_path("/missing")).unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::NotFound);
        assert_eq!(session.reconnects(), 0);
    }
}
