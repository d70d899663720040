//! Worker side of the pool
//!
//! A worker is a thread running a fixed routine against three streams:
//! requests in, responses out, and a log stream out. The routine never
//! touches coordinator state; everything it learns arrives as frames and
//! everything it reports leaves as frames or log lines.
//!
//! Log lines are level-tagged text. The pool's forwarder thread re-emits
//! them through `tracing` with the worker id attached, so worker output is
//! attributed the same way regardless of which thread produced it.

use super::pipe::{PipeReader, PipeWriter};
use super::wire::{Frame, FrameReader};
use crate::error::WireResult;
use crossbeam_channel::{Receiver, Select};
use std::fmt;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The routine every worker in a pool runs
pub type WorkerMain = Arc<dyn Fn(WorkerEndpoint) -> WireResult<()> + Send + Sync>;

/// How often the log forwarder rechecks its stop flag
const FORWARD_POLL: Duration = Duration::from_millis(100);

/// The worker's ends of its three streams
pub struct WorkerEndpoint {
    /// Worker index within the pool
    pub id: usize,

    /// Requests from the coordinator
    pub requests: FrameReader<PipeReader>,

    /// Responses to the coordinator
    pub responses: PipeWriter,

    /// Log stream
    pub log: WorkerLog,
}

impl WorkerEndpoint {
    /// Send a complete response frame
    pub fn reply(&mut self, frame: &Frame) -> WireResult<()> {
        frame.send(&mut self.responses)
    }
}

/// Severity of a forwarded worker log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    /// Split a forwarded line into its level and message
    fn parse(line: &str) -> (LogLevel, &str) {
        let (tag, rest) = line.split_once(' ').unwrap_or(("", line));
        let level = match tag {
            "DEBUG" => LogLevel::Debug,
            "INFO" => LogLevel::Info,
            "WARN" => LogLevel::Warn,
            "ERROR" => LogLevel::Error,
            _ => return (LogLevel::Info, line),
        };
        (level, rest)
    }
}

/// Line-oriented writer for a worker's log stream
pub struct WorkerLog {
    out: PipeWriter,
}

impl WorkerLog {
    pub(crate) fn new(out: PipeWriter) -> Self {
        Self { out }
    }

    pub fn log(&mut self, level: LogLevel, msg: impl fmt::Display) {
        let line = format!("{} {}\n", level.tag(), msg);
        // the forwarder is gone only after the pool stopped listening
        let _ = self.out.write_all(line.as_bytes());
    }

    pub fn debug(&mut self, msg: impl fmt::Display) {
        self.log(LogLevel::Debug, msg);
    }

    pub fn info(&mut self, msg: impl fmt::Display) {
        self.log(LogLevel::Info, msg);
    }

    pub fn warn(&mut self, msg: impl fmt::Display) {
        self.log(LogLevel::Warn, msg);
    }

    pub fn error(&mut self, msg: impl fmt::Display) {
        self.log(LogLevel::Error, msg);
    }
}

/// Clears the alive flag when the worker routine returns or unwinds
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Spawn worker thread `id` running `main`
pub(crate) fn spawn_worker(
    pool: &str,
    main: WorkerMain,
    endpoint: WorkerEndpoint,
    alive: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    let id = endpoint.id;
    alive.store(true, Ordering::SeqCst);

    thread::Builder::new()
        .name(format!("{}-worker-{}", pool, id))
        .spawn(move || {
            let _guard = AliveGuard(alive);
            match panic::catch_unwind(AssertUnwindSafe(|| main(endpoint))) {
                Ok(Ok(())) => debug!(worker = id, "Worker exited"),
                Ok(Err(e)) => warn!(worker = id, error = %e, "Worker stream failed"),
                Err(_) => error!(worker = id, "Worker panicked"),
            }
        })
}

/// Forward every worker's log stream into `tracing` until all streams
/// close or `done` is set.
pub(crate) fn spawn_log_forwarder(
    pool: &str,
    streams: Vec<(usize, PipeReader)>,
    done: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    let pool_name = pool.to_string();
    thread::Builder::new()
        .name(format!("{}-log", pool))
        .spawn(move || forward_logs(&pool_name, streams, &done))
}

struct LogStream {
    worker: usize,
    rx: Receiver<Vec<u8>>,
    partial: Vec<u8>,
}

fn forward_logs(pool: &str, streams: Vec<(usize, PipeReader)>, done: &AtomicBool) {
    let mut open: Vec<LogStream> = streams
        .into_iter()
        .map(|(worker, reader)| LogStream {
            worker,
            rx: reader.into_receiver(),
            partial: Vec::new(),
        })
        .collect();

    while !open.is_empty() {
        let received = {
            let mut sel = Select::new();
            for stream in &open {
                sel.recv(&stream.rx);
            }
            match sel.select_timeout(FORWARD_POLL) {
                Ok(op) => {
                    let index = op.index();
                    Some((index, op.recv(&open[index].rx)))
                }
                Err(_) => None,
            }
        };

        match received {
            Some((index, Ok(chunk))) => {
                let stream = &mut open[index];
                stream.partial.extend_from_slice(&chunk);
                while let Some(pos) = stream.partial.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = stream.partial.drain(..=pos).collect();
                    emit(pool, stream.worker, &line[..line.len() - 1]);
                }
            }
            Some((index, Err(_))) => {
                let stream = open.swap_remove(index);
                if !stream.partial.is_empty() {
                    emit(pool, stream.worker, &stream.partial);
                }
            }
            None => {
                if done.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }
}

fn emit(pool: &str, worker: usize, raw: &[u8]) {
    let line = String::from_utf8_lossy(raw);
    let (level, msg) = LogLevel::parse(&line);
    match level {
        LogLevel::Debug => debug!(pool, worker, "{}", msg),
        LogLevel::Info => info!(pool, worker, "{}", msg),
        LogLevel::Warn => warn!(pool, worker, "{}", msg),
        LogLevel::Error => error!(pool, worker, "{}", msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::pipe::pipe;

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("WARN retry OK"), (LogLevel::Warn, "retry OK"));
        assert_eq!(LogLevel::parse("ERROR x"), (LogLevel::Error, "x"));
        assert_eq!(LogLevel::parse("untagged line"), (LogLevel::Info, "untagged line"));
    }

    #[test]
    fn test_worker_log_writes_tagged_lines() {
        let (w, mut r) = pipe();
        let mut log = WorkerLog::new(w);
        log.warn(format_args!("lstat({}): {}", "/a", "busy"));
        drop(log);

        let mut s = String::new();
        io::Read::read_to_string(&mut r, &mut s).unwrap();
        assert_eq!(s, "WARN lstat(/a): busy\n");
    }

    #[test]
    fn test_forwarder_stops_when_streams_close() {
        let (w1, r1) = pipe();
        let (w2, r2) = pipe();
        let done = Arc::new(AtomicBool::new(false));
        let handle =
            spawn_log_forwarder("test", vec![(0, r1), (1, r2)], Arc::clone(&done)).unwrap();

        let mut l1 = WorkerLog::new(w1);
        l1.info("first");
        drop(l1);
        drop(w2);
        handle.join().unwrap();
    }

    #[test]
    fn test_spawned_worker_clears_alive_on_panic() {
        let (_req_w, req_r) = pipe();
        let (resp_w, _resp_r) = pipe();
        let (log_w, _log_r) = pipe();
        let endpoint = WorkerEndpoint {
            id: 3,
            requests: FrameReader::new(req_r),
            responses: resp_w,
            log: WorkerLog::new(log_w),
        };
        let alive = Arc::new(AtomicBool::new(false));
        let main: WorkerMain = Arc::new(|_ep| panic!("boom"));

        let handle = spawn_worker("test", main, endpoint, Arc::clone(&alive)).unwrap();
        handle.join().unwrap();
        assert!(!alive.load(Ordering::SeqCst));
    }
}
