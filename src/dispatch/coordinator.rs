//! Dispatch coordinator - the pool handler that feeds queued commands to
//! workers and reports each outcome

use super::command::{Command, TaskStatus, OP_TERMINATE};
use crate::error::{PoolError, PoolResult, QueueError, WireError};
use crate::pool::{Frame, PoolHandler, Step, WorkerLink};
use crate::queue::BoundedQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};

pub(crate) type StartFn<D> = Box<dyn Fn(&D) + Send + Sync>;
pub(crate) type CompleteFn<D> = Box<dyn Fn(TaskStatus, D) + Send + Sync>;

/// Per-dispatcher outcome counters
#[derive(Debug, Default)]
pub struct DispatchCounters {
    pub ok: AtomicU64,
    pub failed: AtomicU64,
    pub skipped: AtomicU64,
    pub busy: AtomicU64,
    pub fatal: AtomicU64,
    /// Bytes moved by tasks that reported Ok
    pub bytes: AtomicU64,
}

impl DispatchCounters {
    fn record(&self, status: TaskStatus, size: u64) {
        let counter = match status {
            TaskStatus::Ok => {
                self.bytes.fetch_add(size, Ordering::Relaxed);
                &self.ok
            }
            TaskStatus::Failed => &self.failed,
            TaskStatus::Skipped => &self.skipped,
            TaskStatus::BusyRemoveSourceReplica => &self.busy,
            TaskStatus::Fatal => &self.fatal,
            TaskStatus::End => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            ok: self.ok.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
            fatal: self.fatal.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DispatchCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub ok: u64,
    pub failed: u64,
    pub skipped: u64,
    pub busy: u64,
    pub fatal: u64,
    pub bytes: u64,
}

impl DispatchStats {
    /// Tasks that have reported an outcome
    pub fn completed(&self) -> u64 {
        self.ok + self.failed + self.skipped + self.busy + self.fatal
    }
}

pub(crate) struct Dispatch<D> {
    pub queue: BoundedQueue<(Command, D)>,
    on_start: StartFn<D>,
    on_complete: CompleteFn<D>,
    stopping: AtomicBool,
    pub counters: DispatchCounters,
}

impl<D> Dispatch<D> {
    pub fn new(
        queue: BoundedQueue<(Command, D)>,
        on_start: StartFn<D>,
        on_complete: CompleteFn<D>,
    ) -> Self {
        Self {
            queue,
            on_start,
            on_complete,
            stopping: AtomicBool::new(false),
            counters: DispatchCounters::default(),
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn complete(&self, status: TaskStatus, command: &Command, data: D) {
        debug!(op = %command.operation(), path = %command.path(), %status, "Task complete");
        self.counters.record(status, command.size());
        (self.on_complete)(status, data);
    }

    /// Report the task attached to `link`, if any
    fn complete_attached(&self, link: &mut WorkerLink<(Command, D)>, status: TaskStatus) {
        if let Some((command, data)) = link.take_data() {
            self.complete(status, &command, data);
        }
    }

    fn send_terminate(&self, link: &mut WorkerLink<(Command, D)>) -> PoolResult<Step> {
        let mut frame = Frame::new();
        frame.put_i32(OP_TERMINATE);
        link.send(&frame)?;
        Ok(Step::Next)
    }
}

impl<D: Send + 'static> PoolHandler for Dispatch<D> {
    type Data = (Command, D);

    fn send(&self, link: &mut WorkerLink<(Command, D)>, stop: bool) -> PoolResult<Step> {
        if stop || self.is_stopping() {
            return self.send_terminate(link);
        }

        let (command, data) = match self.queue.dequeue() {
            Ok(task) => task,
            Err(QueueError::EndOfStream) => return self.send_terminate(link),
            Err(e) => return Err(PoolError::fatal(link.id(), e)),
        };

        // a stop may have arrived while blocked on the queue
        if self.is_stopping() {
            self.complete(TaskStatus::Failed, &command, data);
            return self.send_terminate(link);
        }

        (self.on_start)(&data);
        let mut frame = Frame::new();
        command.encode(&mut frame);
        link.set_data((command, data));
        if let Err(e) = link.send(&frame) {
            self.complete_attached(link, TaskStatus::Fatal);
            return Err(e);
        }
        Ok(Step::Next)
    }

    fn recv(&self, link: &mut WorkerLink<(Command, D)>) -> PoolResult<Step> {
        let code = match link.read_i32() {
            Ok(code) => code,
            Err(e) => {
                self.complete_attached(link, TaskStatus::Fatal);
                return Err(e);
            }
        };

        match TaskStatus::from_wire(code) {
            Some(TaskStatus::End) => Ok(Step::End),
            Some(status) => {
                self.complete_attached(link, status);
                Ok(Step::Next)
            }
            None => {
                self.complete_attached(link, TaskStatus::Fatal);
                Err(PoolError::fatal(
                    link.id(),
                    WireError::UnexpectedTag {
                        what: "dispatch status",
                        tag: code,
                    },
                ))
            }
        }
    }

    fn abandoned(&self, link: &mut WorkerLink<(Command, D)>) {
        self.complete_attached(link, TaskStatus::Fatal);
    }

    /// Fail whatever is still queued, consuming until the producer finishes
    fn end(&self) {
        let mut leftover = 0u64;
        while let Ok((command, data)) = self.queue.dequeue() {
            leftover += 1;
            self.complete(TaskStatus::Failed, &command, data);
        }
        if leftover > 0 {
            warn!(tasks = leftover, "Dispatcher stopped with queued tasks; reported as failed");
        }
    }

    fn interrupted(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::FileCopy;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn dispatch(capacity: usize) -> (Dispatch<u32>, Arc<Mutex<Vec<(TaskStatus, u32)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let d = Dispatch::new(
            BoundedQueue::new(capacity).unwrap(),
            Box::new(|_| {}),
            Box::new(move |status, data| sink.lock().push((status, data))),
        );
        (d, seen)
    }

    #[test]
    fn test_counters_by_status() {
        let counters = DispatchCounters::default();
        counters.record(TaskStatus::Ok, 10);
        counters.record(TaskStatus::Ok, 5);
        counters.record(TaskStatus::Skipped, 100);
        counters.record(TaskStatus::Fatal, 1);
        counters.record(TaskStatus::End, 1);
        let stats = counters.snapshot();
        assert_eq!(stats.ok, 2);
        assert_eq!(stats.bytes, 15);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.completed(), 4);
    }

    #[test]
    fn test_end_fails_leftover_tasks() {
        let (d, seen) = dispatch(4);
        for i in 0..3 {
            d.queue
                .enter((Command::Copy(FileCopy::new("/a", "/b", 1)), i))
                .unwrap();
        }
        let queue_done = std::thread::scope(|s| {
            let ender = s.spawn(|| d.end());
            d.queue.finish_and_wait();
            ender.join().is_ok()
        });
        assert!(queue_done);
        assert_eq!(
            *seen.lock(),
            vec![(TaskStatus::Failed, 0), (TaskStatus::Failed, 1), (TaskStatus::Failed, 2)]
        );
        assert_eq!(d.counters.snapshot().failed, 3);
    }
}
