//! Fixed-size worker pool driven over framed streams
//!
//! A [`WorkerPool`] owns N workers and, once started, N coordinator threads,
//! one per worker. Each coordinator runs the same loop against a
//! caller-supplied [`PoolHandler`]:
//!
//! ```text
//!   loop {
//!       handler.send(worker, stop_requested)   -> End: exit
//!       wait for the response stream           (bounded polls; a terminate
//!                                               timeout abandons the worker)
//!       handler.recv(worker)                   -> End: exit
//!   }
//! ```
//!
//! Any handler error is fatal for the whole pool: it is recorded, every
//! other coordinator is told to terminate, and [`WorkerPool::join`] returns
//! it. After all coordinators exit, [`PoolHandler::end`] runs exactly once on
//! a supervisor thread.
//!
//! # Architecture
//!
//! ```text
//!   caller threads            coordinator threads           worker threads
//!  ┌──────────────┐         ┌──────────────────┐  request  ┌─────────────┐
//!  │ submit/next  │ ◀─────▶ │ coord-0 (handler)│ ────────▶ │  worker-0   │
//!  └──────────────┘         │                  │ ◀──────── │  (session)  │
//!                           └──────────────────┘  response └──────┬──────┘
//!                                  ...                             │ log
//!                           ┌──────────────────┐                   ▼
//!                           │ coord-N-1        │           ┌─────────────┐
//!                           └──────────────────┘           │ log forward │──▶ tracing
//!                                                          └─────────────┘
//! ```

pub mod pipe;
pub mod wire;
pub mod worker;

pub use pipe::{pipe, PipeReader, PipeWriter, Readable};
pub use wire::{Frame, FrameReader};
pub use worker::{LogLevel, WorkerEndpoint, WorkerLog, WorkerMain};

use crate::engine::{Engine, PoolSlot};
use crate::error::{PoolError, PoolResult, WireResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Slice used while polling a worker's response stream
const POLL_SLICE: Duration = Duration::from_millis(100);

/// First reap wait per worker
const REAP_WAIT: Duration = Duration::from_millis(10);

/// Grace period before a worker is abandoned
const KILL_GRACE: Duration = Duration::from_secs(1);

/// What a handler wants the coordinator to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep cycling
    Next,
    /// This worker is done; exit the coordinator
    End,
}

/// Shutdown state observed by coordinators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Run,
    /// Finish the outstanding request, then terminate
    Stop,
    /// Terminate; abandon a worker that does not answer within the timeout
    Terminate(Duration),
}

const MODE_RUN: u8 = 0;
const MODE_STOP: u8 = 1;
const MODE_TERMINATE: u8 = 2;

#[derive(Debug, Default)]
struct Control {
    mode: AtomicU8,
    timeout_ms: AtomicU64,
    fatal: Mutex<Option<PoolError>>,
}

impl Control {
    fn interrupt(&self) -> Interrupt {
        match self.mode.load(Ordering::SeqCst) {
            MODE_RUN => Interrupt::Run,
            MODE_STOP => Interrupt::Stop,
            _ => Interrupt::Terminate(Duration::from_millis(
                self.timeout_ms.load(Ordering::SeqCst),
            )),
        }
    }

    fn request_stop(&self) {
        let _ = self.mode.compare_exchange(
            MODE_RUN,
            MODE_STOP,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn request_terminate(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
        self.mode.store(MODE_TERMINATE, Ordering::SeqCst);
    }

    fn record_fatal(&self, err: PoolError) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(err);
        }
        drop(fatal);
        self.request_terminate(Duration::ZERO);
    }
}

/// Callbacks a coordinator drives for each of its worker's cycles
///
/// `send` and `recv` run on the worker's coordinator thread; several
/// coordinators call them concurrently, so shared state inside the handler
/// needs its own locking.
pub trait PoolHandler: Send + Sync + 'static {
    /// Per-cycle context attached to a worker between send and recv
    type Data: Send + 'static;

    /// Write the next request. `stop` is set once shutdown was requested;
    /// the handler should then send its terminate request.
    fn send(&self, link: &mut WorkerLink<Self::Data>, stop: bool) -> PoolResult<Step>;

    /// Read and handle one response
    fn recv(&self, link: &mut WorkerLink<Self::Data>) -> PoolResult<Step>;

    /// Runs when a terminate timeout gives up on a worker that still has a
    /// request outstanding; the link's data is whatever `send` attached
    fn abandoned(&self, _link: &mut WorkerLink<Self::Data>) {}

    /// Runs once after every coordinator has exited
    fn end(&self) {}

    /// Runs when stop/terminate is requested or a fatal error occurs, so
    /// handlers can wake coordinators blocked on their own conditions
    fn interrupted(&self) {}
}

/// Coordinator-side view of one worker
pub struct WorkerLink<D> {
    id: usize,
    requests: PipeWriter,
    responses: FrameReader<PipeReader>,
    alive: Arc<AtomicBool>,
    data: Option<D>,
}

impl<D> WorkerLink<D> {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether the worker routine is still running
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send a request frame
    pub fn send(&mut self, frame: &Frame) -> PoolResult<()> {
        frame
            .send(&mut self.requests)
            .map_err(|e| PoolError::fatal(self.id, e))
    }

    pub fn read_i32(&mut self) -> PoolResult<i32> {
        let r = self.responses.get_i32();
        self.check(r)
    }

    pub fn read_i64(&mut self) -> PoolResult<i64> {
        let r = self.responses.get_i64();
        self.check(r)
    }

    pub fn read_bool(&mut self) -> PoolResult<bool> {
        let r = self.responses.get_bool();
        self.check(r)
    }

    pub fn read_string(&mut self) -> PoolResult<String> {
        let r = self.responses.get_string();
        self.check(r)
    }

    pub fn read_strings(&mut self) -> PoolResult<Vec<String>> {
        let r = self.responses.get_strings();
        self.check(r)
    }

    fn check<T>(&self, r: WireResult<T>) -> PoolResult<T> {
        r.map_err(|e| PoolError::fatal(self.id, e))
    }

    /// Attach per-cycle context
    pub fn set_data(&mut self, data: D) {
        self.data = Some(data);
    }

    pub fn data_mut(&mut self) -> Option<&mut D> {
        self.data.as_mut()
    }

    pub fn take_data(&mut self) -> Option<D> {
        self.data.take()
    }

    fn wait_readable(&mut self, timeout: Duration) -> Readable {
        self.responses.get_mut().wait_readable(timeout)
    }
}

/// Cloneable handle for requesting shutdown from other threads
#[derive(Clone)]
pub struct PoolController {
    control: Arc<Control>,
    notify: Arc<dyn Fn() + Send + Sync>,
}

impl PoolController {
    /// Request termination, abandoning unresponsive workers after `timeout`
    pub fn terminate(&self, timeout: Duration) {
        self.control.request_terminate(timeout);
        (self.notify)();
    }

    /// Request shutdown after each worker's outstanding request completes
    pub fn stop(&self) {
        self.control.request_stop();
        (self.notify)();
    }

    pub fn interrupt(&self) -> Interrupt {
        self.control.interrupt()
    }
}

impl std::fmt::Debug for PoolController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolController")
            .field("interrupt", &self.control.interrupt())
            .finish()
    }
}

struct WorkerThread {
    id: usize,
    handle: JoinHandle<()>,
}

/// A fixed set of workers and their coordinators
pub struct WorkerPool<H: PoolHandler> {
    name: String,
    size: usize,
    handler: Arc<H>,
    control: Arc<Control>,
    links: Vec<WorkerLink<H::Data>>,
    log_streams: Vec<(usize, PipeReader)>,
    workers: Vec<WorkerThread>,
    supervisor: Option<JoinHandle<Vec<WorkerLink<H::Data>>>>,
    forwarder: Option<JoinHandle<()>>,
    forward_done: Arc<AtomicBool>,
    slot: Option<PoolSlot>,
    started: bool,
    joined: bool,
}

impl<H: PoolHandler> WorkerPool<H> {
    /// Spawn `size` workers running `main`
    ///
    /// Workers start immediately and block on their request stream until a
    /// coordinator sends them something.
    pub fn new(
        engine: &Engine,
        name: &str,
        size: usize,
        main: WorkerMain,
        handler: Arc<H>,
    ) -> PoolResult<Self> {
        if size == 0 {
            return Err(PoolError::InvalidWorkerCount { count: size });
        }
        let slot = engine.register_pool()?;

        let mut pool = Self {
            name: name.to_string(),
            size,
            handler,
            control: Arc::new(Control::default()),
            links: Vec::with_capacity(size),
            log_streams: Vec::with_capacity(size),
            workers: Vec::with_capacity(size),
            supervisor: None,
            forwarder: None,
            forward_done: Arc::new(AtomicBool::new(false)),
            slot: Some(slot),
            started: false,
            joined: false,
        };

        for id in 0..size {
            let (req_w, req_r) = pipe();
            let (resp_w, resp_r) = pipe();
            let (log_w, log_r) = pipe();
            let alive = Arc::new(AtomicBool::new(false));

            let endpoint = WorkerEndpoint {
                id,
                requests: FrameReader::new(req_r),
                responses: resp_w,
                log: WorkerLog::new(log_w),
            };
            let handle = worker::spawn_worker(name, Arc::clone(&main), endpoint, Arc::clone(&alive))
                .map_err(|e| PoolError::Spawn {
                    what: format!("{} worker {}", name, id),
                    reason: e.to_string(),
                })?;

            pool.workers.push(WorkerThread { id, handle });
            pool.log_streams.push((id, log_r));
            pool.links.push(WorkerLink {
                id,
                requests: req_w,
                responses: FrameReader::new(resp_r),
                alive,
                data: None,
            });
        }

        debug!(pool = %pool.name, workers = size, "Worker pool spawned");
        Ok(pool)
    }

    /// Number of workers
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether [`start`](Self::start) has been called
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Launch the coordinator threads
    pub fn start(&mut self) -> PoolResult<()> {
        if self.started {
            return Err(PoolError::AlreadyStarted);
        }
        self.started = true;

        let streams = std::mem::take(&mut self.log_streams);
        self.forwarder = Some(
            worker::spawn_log_forwarder(&self.name, streams, Arc::clone(&self.forward_done))
                .map_err(|e| PoolError::Spawn {
                    what: format!("{} log forwarder", self.name),
                    reason: e.to_string(),
                })?,
        );

        let mut coordinators = Vec::with_capacity(self.size);
        let mut spawn_error = None;
        for link in std::mem::take(&mut self.links) {
            let id = link.id;
            let handler = Arc::clone(&self.handler);
            let control = Arc::clone(&self.control);
            let spawned = thread::Builder::new()
                .name(format!("{}-coord-{}", self.name, id))
                .spawn(move || coordinate(link, &*handler, &control));
            match spawned {
                Ok(handle) => coordinators.push(handle),
                Err(e) => {
                    spawn_error = Some(PoolError::Spawn {
                        what: format!("{} coordinator {}", self.name, id),
                        reason: e.to_string(),
                    });
                    break;
                }
            }
        }

        if let Some(err) = &spawn_error {
            error!(pool = %self.name, error = %err, "Coordinator spawn failed");
            self.control.record_fatal(err.clone());
            self.handler.interrupted();
        }

        let handler = Arc::clone(&self.handler);
        let control = Arc::clone(&self.control);
        let spawned = thread::Builder::new()
            .name(format!("{}-supervisor", self.name))
            .spawn(move || {
                let mut links = Vec::with_capacity(coordinators.len());
                for handle in coordinators {
                    match handle.join() {
                        Ok(link) => links.push(link),
                        Err(_) => {
                            control.record_fatal(PoolError::Panicked {
                                what: "coordinator".into(),
                            });
                            handler.interrupted();
                        }
                    }
                }
                handler.end();
                links
            });
        match spawned {
            Ok(handle) => self.supervisor = Some(handle),
            Err(e) => {
                let err = PoolError::Spawn {
                    what: format!("{} supervisor", self.name),
                    reason: e.to_string(),
                };
                self.control.record_fatal(err.clone());
                return Err(err);
            }
        }

        match spawn_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Request termination, abandoning unresponsive workers after `timeout`
    pub fn terminate(&self, timeout: Duration) {
        self.control.request_terminate(timeout);
        self.handler.interrupted();
    }

    /// Request shutdown after each worker's outstanding request completes
    pub fn stop(&self) {
        self.control.request_stop();
        self.handler.interrupted();
    }

    pub fn interrupt(&self) -> Interrupt {
        self.control.interrupt()
    }

    /// Handle for requesting shutdown from another thread
    pub fn controller(&self) -> PoolController {
        let handler = Arc::clone(&self.handler);
        PoolController {
            control: Arc::clone(&self.control),
            notify: Arc::new(move || handler.interrupted()),
        }
    }

    /// Whether a fatal error has been recorded
    pub fn has_failed(&self) -> bool {
        self.control.fatal.lock().is_some()
    }

    /// Wait for the coordinators, reap every worker, release all streams
    ///
    /// Returns the first fatal error any coordinator hit. A pool that was
    /// never started just closes its workers' request streams.
    pub fn join(&mut self) -> PoolResult<()> {
        if self.joined {
            return Ok(());
        }
        self.joined = true;

        let links = match self.supervisor.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                self.control.record_fatal(PoolError::Panicked {
                    what: "supervisor".into(),
                });
                Vec::new()
            }),
            None => std::mem::take(&mut self.links),
        };

        self.reap(links);

        self.forward_done.store(true, Ordering::SeqCst);
        self.log_streams.clear();
        if let Some(handle) = self.forwarder.take() {
            let _ = handle.join();
        }
        self.slot.take();

        debug!(pool = %self.name, "Worker pool joined");
        match self.control.fatal.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn reap(&mut self, links: Vec<WorkerLink<H::Data>>) {
        let mut remaining = Vec::new();
        for worker in self.workers.drain(..) {
            if wait_finished(&worker.handle, REAP_WAIT) {
                let _ = worker.handle.join();
            } else {
                remaining.push(worker);
            }
        }

        // closing the request streams unblocks idle workers
        drop(links);

        let grace_end = Instant::now() + KILL_GRACE;
        for worker in remaining {
            let left = grace_end.saturating_duration_since(Instant::now());
            if wait_finished(&worker.handle, left) {
                let _ = worker.handle.join();
            } else {
                warn!(
                    pool = %self.name,
                    worker = worker.id,
                    "Worker did not exit within grace period; abandoned, thread still running"
                );
            }
        }
    }
}

impl<H: PoolHandler> Drop for WorkerPool<H> {
    fn drop(&mut self) {
        if !self.joined {
            // no blocking here: the end callback may wait on a consumer
            self.terminate(Duration::ZERO);
            self.forward_done.store(true, Ordering::SeqCst);
        }
    }
}

/// Poll `handle` until it finishes or `limit` elapses
fn wait_finished(handle: &JoinHandle<()>, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if handle.is_finished() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(2)));
    }
}

/// Coordinator thread body; hands the link back for reaping
fn coordinate<H: PoolHandler>(
    mut link: WorkerLink<H::Data>,
    handler: &H,
    control: &Control,
) -> WorkerLink<H::Data> {
    let id = link.id;
    if let Err(err) = drive(&mut link, handler, control) {
        error!(worker = id, error = %err, "Coordinator aborting");
        control.record_fatal(err);
        handler.interrupted();
    }
    link
}

fn drive<H: PoolHandler>(
    link: &mut WorkerLink<H::Data>,
    handler: &H,
    control: &Control,
) -> PoolResult<()> {
    loop {
        if !link.is_alive() {
            return Err(PoolError::fatal(link.id, "no worker"));
        }

        let stop = control.interrupt() != Interrupt::Run;
        if handler.send(link, stop)? == Step::End {
            return Ok(());
        }

        let mut deadline: Option<Instant> = None;
        loop {
            let slice = match control.interrupt() {
                Interrupt::Terminate(timeout) => {
                    let until = *deadline.get_or_insert_with(|| Instant::now() + timeout);
                    let now = Instant::now();
                    if now >= until {
                        // last chance for an answer that is already queued
                        Duration::ZERO
                    } else {
                        (until - now).min(POLL_SLICE)
                    }
                }
                _ => POLL_SLICE,
            };

            match link.wait_readable(slice) {
                Readable::Ready | Readable::Closed => break,
                Readable::Timeout => {
                    if let Some(until) = deadline {
                        if Instant::now() >= until {
                            warn!(worker = link.id, "Terminate timeout waiting for worker");
                            handler.abandoned(link);
                            return Ok(());
                        }
                    }
                }
            }
        }

        if handler.recv(link)? == Step::End {
            return Ok(());
        }
    }
}
