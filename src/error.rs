//! Error types for bulkmove
//!
//! This module defines the error hierarchy for the engine:
//! - Queue and worker pool errors (fatal at the layer that sees them)
//! - Wire framing errors across the worker boundary
//! - Backend errors, classified so workers can decide whether to retry
//! - Configuration and CLI errors
//!
//! Ordinary per-file outcomes (skipped, busy, insufficient replicas) are not
//! errors at the engine level; they travel as [`crate::dispatch::TaskStatus`]
//! values or walker skip counts.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the bulkmove engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Bounded queue errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Worker pool errors
    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    /// Wire framing errors
    #[error("Wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// Backend errors surfaced outside a worker
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors (thread spawn, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bounded queue errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Capacity must be positive
    #[error("Invalid queue capacity {0}: must be at least 1")]
    InvalidCapacity(usize),

    /// Could not reserve storage for the requested capacity
    #[error("Out of memory allocating queue of capacity {capacity}")]
    OutOfMemory { capacity: usize },

    /// The producer side has declared it is finished
    #[error("Queue is finishing: no further items accepted")]
    Finishing,

    /// Finishing and drained; no more items will arrive
    #[error("End of stream")]
    EndOfStream,
}

/// Worker pool errors
#[derive(Error, Debug, Clone)]
pub enum PoolError {
    /// Too many live pools in this engine
    #[error("Too many open worker pools: limit is {max}")]
    TooManyPools { max: usize },

    /// Invalid pool size
    #[error("Invalid worker count {count}: must be at least 1")]
    InvalidWorkerCount { count: usize },

    /// Failed to spawn a worker or coordinator thread
    #[error("Failed to spawn {what}: {reason}")]
    Spawn { what: String, reason: String },

    /// A worker's streams broke or it sent something unparseable
    #[error("Worker {worker} failed: {reason}")]
    Fatal { worker: usize, reason: String },

    /// start() called twice
    #[error("Worker pool already started")]
    AlreadyStarted,

    /// A pool thread panicked
    #[error("{what} panicked")]
    Panicked { what: String },
}

impl PoolError {
    pub(crate) fn fatal(worker: usize, reason: impl fmt::Display) -> Self {
        PoolError::Fatal {
            worker,
            reason: reason.to_string(),
        }
    }
}

/// Errors decoding or encoding frames on a worker stream
#[derive(Error, Debug)]
pub enum WireError {
    /// The peer closed the stream mid-frame
    #[error("Stream closed unexpectedly")]
    UnexpectedEof,

    /// A string length prefix was negative
    #[error("Negative length prefix {0}")]
    NegativeLength(i32),

    /// A string length prefix exceeded the frame limit
    #[error("Length prefix {len} exceeds limit {max}")]
    TooLong { len: usize, max: usize },

    /// String bytes were not UTF-8
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    /// Unknown opcode or status tag
    #[error("Unexpected {what} tag {tag}")]
    UnexpectedTag { what: &'static str, tag: i32 },

    /// Underlying stream I/O failed
    #[error("Stream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification of a collaborator (backend) failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendErrorKind {
    /// Lost connection to a service; retryable once after reconnecting
    ConnectionError,
    NotFound,
    AlreadyExists,
    /// Target busy, e.g. a replica is being written
    Busy,
    /// Removal would leave fewer than the minimum replica count
    InsufficientReplicas,
    QuotaExceeded,
    NoSpace,
    /// A directory stands where a file was expected
    IsADirectory,
    /// A path component is not a directory
    NotADirectory,
    /// The backend does not implement this operation
    Unsupported,
    Other,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendErrorKind::ConnectionError => "connection error",
            BackendErrorKind::NotFound => "no such file or directory",
            BackendErrorKind::AlreadyExists => "already exists",
            BackendErrorKind::Busy => "resource busy",
            BackendErrorKind::InsufficientReplicas => "insufficient number of replicas",
            BackendErrorKind::QuotaExceeded => "quota exceeded",
            BackendErrorKind::NoSpace => "no space",
            BackendErrorKind::IsADirectory => "is a directory",
            BackendErrorKind::NotADirectory => "not a directory",
            BackendErrorKind::Unsupported => "operation not supported",
            BackendErrorKind::Other => "error",
        };
        f.write_str(s)
    }
}

/// A failed backend call, attributed to the path/host that produced it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{op}({path}{}): {kind}{}", host_suffix(.host), message_suffix(.message))]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub op: &'static str,
    pub path: String,
    pub host: Option<String>,
    pub message: String,
}

fn host_suffix(host: &Option<String>) -> String {
    match host {
        Some(h) => format!(" @{}", h),
        None => String::new(),
    }
}

fn message_suffix(message: &str) -> String {
    if message.is_empty() {
        String::new()
    } else {
        format!(": {}", message)
    }
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, op: &'static str, path: impl Into<String>) -> Self {
        Self {
            kind,
            op,
            path: path.into(),
            host: None,
            message: String::new(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Map a std I/O error into a backend error
    pub fn from_io(op: &'static str, path: impl Into<String>, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::NotFound => BackendErrorKind::NotFound,
            ErrorKind::AlreadyExists => BackendErrorKind::AlreadyExists,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe => BackendErrorKind::ConnectionError,
            _ => match err.raw_os_error() {
                Some(code) if code == ENOSPC => BackendErrorKind::NoSpace,
                Some(code) if code == EDQUOT => BackendErrorKind::QuotaExceeded,
                Some(code) if code == EBUSY => BackendErrorKind::Busy,
                Some(code) if code == EISDIR => BackendErrorKind::IsADirectory,
                Some(code) if code == ENOTDIR => BackendErrorKind::NotADirectory,
                _ => BackendErrorKind::Other,
            },
        };
        Self::new(kind, op, path).with_message(err.to_string())
    }

    /// Whether a worker should reconnect its session and retry once
    pub fn is_retryable(&self) -> bool {
        self.kind == BackendErrorKind::ConnectionError
    }

    /// Whether the task-level retry loop may try this operation again
    pub fn is_retried_by_task(&self) -> bool {
        !matches!(
            self.kind,
            BackendErrorKind::QuotaExceeded
                | BackendErrorKind::NoSpace
                | BackendErrorKind::AlreadyExists
                | BackendErrorKind::NotFound
                | BackendErrorKind::Unsupported
                | BackendErrorKind::InsufficientReplicas
                | BackendErrorKind::IsADirectory
                | BackendErrorKind::NotADirectory
        )
    }
}

// Linux errno values
const EBUSY: i32 = 16;
const ENOTDIR: i32 = 20;
const EISDIR: i32 = 21;
const ENOSPC: i32 = 28;
const EDQUOT: i32 = 122;

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid parallelism
    #[error("Invalid worker count {count}: must be between 1 and {max}")]
    InvalidWorkerCount { count: usize, max: usize },

    /// Invalid queue size
    #[error("Invalid queue size {size}: must be at least {min}")]
    InvalidQueueSize { size: usize, min: usize },

    /// Invalid I/O buffer size
    #[error("Invalid buffer size {size}: must be between {min} and {max}")]
    InvalidBufferSize { size: usize, min: usize, max: usize },

    /// Invalid exclude pattern
    #[error("Invalid exclude pattern '{pattern}': {reason}")]
    InvalidExcludePattern { pattern: String, reason: String },

    /// Unparseable or unsupported location
    #[error("Invalid location '{location}': {reason}")]
    InvalidLocation { location: String, reason: String },

    /// Options that cannot be combined, or an out-of-range value
    #[error("Invalid options: {reason}")]
    ConflictingOptions { reason: String },

    /// Host selection left nothing to read from or write to
    #[error("No available host for {role}")]
    NoAvailableHosts { role: &'static str },

    /// Source and destination overlap
    #[error("Destination '{dst}' is inside source '{src}'")]
    NestedDestination { src: PathBuf, dst: PathBuf },
}

/// Result type alias for EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Result type alias for QueueError
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Result type alias for PoolError
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Result type alias for WireError
pub type WireResult<T> = std::result::Result<T, WireError>;

/// Result type alias for BackendError
pub type BackendResult<T> = std::result::Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_retryable() {
        let conn = BackendError::new(BackendErrorKind::ConnectionError, "stat", "/a");
        assert!(conn.is_retryable());
        assert!(conn.is_retried_by_task());

        let quota = BackendError::new(BackendErrorKind::QuotaExceeded, "replicate", "/a");
        assert!(!quota.is_retryable());
        assert!(!quota.is_retried_by_task());
    }

    #[test]
    fn test_backend_error_display_attribution() {
        let err = BackendError::new(BackendErrorKind::Busy, "remove_replica", "/data/f1")
            .with_host("node3");
        assert_eq!(
            err.to_string(),
            "remove_replica(/data/f1 @node3): resource busy"
        );

        let err = BackendError::new(BackendErrorKind::Other, "open", "/x").with_message("boom");
        assert_eq!(err.to_string(), "open(/x): error: boom");
    }

    #[test]
    fn test_from_io_classification() {
        let err = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(
            BackendError::from_io("lstat", "/x", &err).kind,
            BackendErrorKind::NotFound
        );

        let err = std::io::Error::from_raw_os_error(28);
        assert_eq!(
            BackendError::from_io("write", "/x", &err).kind,
            BackendErrorKind::NoSpace
        );
    }

    #[test]
    fn test_directory_mismatch_not_retried() {
        let err = std::io::Error::from_raw_os_error(21);
        let err = BackendError::from_io("rename", "/dst", &err);
        assert_eq!(err.kind, BackendErrorKind::IsADirectory);
        assert!(!err.is_retried_by_task());

        let err = std::io::Error::from_raw_os_error(20);
        let err = BackendError::from_io("create", "/f/x", &err);
        assert_eq!(err.kind, BackendErrorKind::NotADirectory);
        assert!(!err.is_retried_by_task());
    }

    #[test]
    fn test_error_conversion() {
        let engine_err: EngineError = QueueError::EndOfStream.into();
        assert!(matches!(engine_err, EngineError::Queue(QueueError::EndOfStream)));
    }
}
