//! Task dispatcher
//!
//! Runs replicate / migrate / copy / move / remove-replica commands on a
//! worker pool. Callers [`submit`](TaskDispatcher::submit) commands with a
//! piece of callback data; `on_start` sees the data before the task's I/O
//! begins and `on_complete` receives it back, together with the outcome,
//! exactly once per task. Both callbacks run on coordinator threads, several
//! at a time, in completion order.

mod command;
mod coordinator;
mod worker;

pub use command::{Command, FileCopy, Operation, ReplicaTransfer, TaskStatus};
pub use coordinator::{DispatchCounters, DispatchStats};
pub use worker::{tmp_path, TMP_SUFFIX};

use crate::engine::Engine;
use crate::error::Result;
use crate::pool::{PoolController, WorkerMain, WorkerPool};
use crate::queue::BoundedQueue;
use coordinator::Dispatch;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use worker::TaskContext;

/// Timeout [`TaskDispatcher::request_stop`] gives outstanding tasks
pub const STOP_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default copy buffer (64 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default dispatch queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Tuning for a [`TaskDispatcher`]
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Number of workers
    pub parallelism: usize,

    /// Commands that can wait before `submit` blocks
    pub queue_capacity: usize,

    /// Pretend to move data at this many KB/s instead of doing I/O; 0 is off
    pub simulate_rate: u64,

    /// Copy buffer size in bytes
    pub buffer_size: usize,

    /// Retries after a failed replicate or copy attempt
    pub retry_max: u32,

    /// Pause between attempts
    pub retry_delay: Duration,

    /// Pause before retrying a busy source replica removal
    pub busy_wait: Duration,

    /// Bytes a destination host must keep free beyond the file itself
    pub minimum_free: u64,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            parallelism: num_cpus::get(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            simulate_rate: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            retry_max: 2,
            retry_delay: Duration::from_secs(1),
            busy_wait: Duration::from_secs(1),
            minimum_free: 0,
        }
    }
}

/// A running dispatcher; `D` is the caller's per-task data
pub struct TaskDispatcher<D: Send + 'static> {
    dispatch: Arc<Dispatch<D>>,
    pool: WorkerPool<Dispatch<D>>,
    joined: bool,
}

impl<D: Send + 'static> TaskDispatcher<D> {
    /// Spawn the workers and begin taking commands
    pub fn start(
        engine: &Engine,
        options: DispatchOptions,
        on_start: impl Fn(&D) + Send + Sync + 'static,
        on_complete: impl Fn(TaskStatus, D) + Send + Sync + 'static,
    ) -> Result<Self> {
        let queue = BoundedQueue::new(options.queue_capacity)?;
        let dispatch = Arc::new(Dispatch::new(queue, Box::new(on_start), Box::new(on_complete)));

        let parallelism = options.parallelism;
        let simulate_rate = options.simulate_rate;
        let ctx = Arc::new(TaskContext {
            connector: engine.connector(),
            options: DispatchOptions {
                buffer_size: options.buffer_size.max(1),
                ..options
            },
        });
        let main: WorkerMain = Arc::new(move |ep| worker::run(&ctx, ep));
        let mut pool =
            WorkerPool::new(engine, "dispatch", parallelism, main, Arc::clone(&dispatch))?;
        pool.start()?;

        info!(workers = parallelism, simulate_rate, "Dispatcher started");
        Ok(Self {
            dispatch,
            pool,
            joined: false,
        })
    }

    /// Queue a command, blocking while the queue is full
    ///
    /// After a stop request the command is still accepted and is reported
    /// as failed without running.
    pub fn submit(&self, command: Command, data: D) -> Result<()> {
        debug!(op = %command.operation(), path = %command.path(), "Submit");
        self.dispatch.queue.enter((command, data))?;
        Ok(())
    }

    /// Terminate: running tasks get [`STOP_TIMEOUT`] to answer, queued tasks
    /// fail
    pub fn request_stop(&self) {
        self.pool.terminate(STOP_TIMEOUT);
    }

    /// Let running tasks finish; queued tasks fail
    pub fn request_graceful_stop(&self) {
        self.pool.stop();
    }

    /// Whether a stop was requested or a fatal error occurred
    pub fn is_stopping(&self) -> bool {
        self.dispatch.is_stopping()
    }

    /// Handle for stopping the dispatcher from another thread
    pub fn controller(&self) -> PoolController {
        self.pool.controller()
    }

    /// Outcome counters so far
    pub fn stats(&self) -> DispatchStats {
        self.dispatch.counters.snapshot()
    }

    /// Declare that no more commands will be submitted, wait for every
    /// queued task and tear down the pool
    ///
    /// Returns the first fatal error the pool hit, if any.
    pub fn join(&mut self) -> Result<()> {
        if self.joined {
            return Ok(());
        }
        self.joined = true;

        self.dispatch.queue.finish_and_wait();
        self.pool.join()?;

        let stats = self.stats();
        info!(
            ok = stats.ok,
            failed = stats.failed,
            skipped = stats.skipped,
            busy = stats.busy,
            fatal = stats.fatal,
            bytes = stats.bytes,
            "Dispatcher joined"
        );
        Ok(())
    }
}

impl<D: Send + 'static> Drop for TaskDispatcher<D> {
    fn drop(&mut self) {
        if !self.joined {
            let _ = self.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn options(parallelism: usize) -> DispatchOptions {
        DispatchOptions {
            parallelism,
            queue_capacity: 2,
            retry_delay: Duration::from_millis(1),
            busy_wait: Duration::from_millis(1),
            ..DispatchOptions::default()
        }
    }

    #[test]
    fn test_every_task_completes_once() {
        let backend = MemoryBackend::new();
        backend.mkdir_all("/dst");
        for i in 0..20 {
            backend.add_file(&format!("/src/f{}", i), 100 + i);
        }

        let engine = Engine::new(backend.connector());
        let started = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Mutex::new(Vec::new()));
        let (s, d) = (Arc::clone(&started), Arc::clone(&done));
        let mut dispatcher = TaskDispatcher::start(
            &engine,
            options(3),
            move |_: &usize| {
                s.fetch_add(1, Ordering::SeqCst);
            },
            move |status, i| d.lock().push((i, status)),
        )
        .unwrap();

        for i in 0..20 {
            let size = 100 + i as u64;
            let copy = FileCopy::new(format!("/src/f{}", i), format!("/dst/f{}", i), size);
            dispatcher.submit(Command::Copy(copy), i).unwrap();
        }
        dispatcher.join().unwrap();

        let mut done = done.lock().clone();
        done.sort_by_key(|(i, _)| *i);
        assert_eq!(done.len(), 20);
        assert!(done.iter().enumerate().all(|(i, (n, s))| *n == i && *s == TaskStatus::Ok));
        assert_eq!(started.load(Ordering::SeqCst), 20);
        assert_eq!(dispatcher.stats().bytes, (0..20).map(|i| 100 + i).sum::<u64>());
        assert_eq!(engine.live_pools(), 0);
    }

    #[test]
    fn test_stop_fails_queued_tasks() {
        let backend = MemoryBackend::new();
        backend.add_file("/src/f", 10);
        backend.mkdir_all("/dst");

        let engine = Engine::new(backend.connector());
        let done = Arc::new(Mutex::new(Vec::new()));
        let d = Arc::clone(&done);
        let on_complete = move |status: TaskStatus, i: u32| d.lock().push((i, status));
        let mut dispatcher =
            TaskDispatcher::start(&engine, options(1), |_: &u32| {}, on_complete).unwrap();
        dispatcher.request_graceful_stop();
        assert!(dispatcher.is_stopping());

        for i in 0..5 {
            let copy = FileCopy::new("/src/f", format!("/dst/f{}", i), 10);
            dispatcher.submit(Command::Copy(copy), i).unwrap();
        }
        dispatcher.join().unwrap();

        let done = done.lock();
        assert_eq!(done.len(), 5);
        assert!(done.iter().all(|(_, s)| *s == TaskStatus::Failed));
        assert!(!backend.exists("/dst/f0"));
    }

    #[test]
    fn test_join_with_nothing_submitted() {
        let engine = Engine::new(MemoryBackend::new().connector());
        let mut dispatcher =
            TaskDispatcher::start(&engine, options(2), |_: &()| {}, |_, _| {}).unwrap();
        dispatcher.join().unwrap();
        assert_eq!(dispatcher.stats().completed(), 0);
        let command = Command::RemoveReplica {
            path: "/f".into(),
            host: "h".into(),
        };
        assert!(dispatcher.submit(command, ()).is_err());
    }
}
