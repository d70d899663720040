//! Bounded producer/consumer queue with a finish handshake
//!
//! [`BoundedQueue`] is the hand-off point between every pair of threads in
//! the engine: caller to dispatcher workers, walker coordinators to the
//! consumer. Producers block while the queue is full, consumers block while
//! it is empty. Shutdown is a one-shot rendezvous: the producer calls
//! [`BoundedQueue::finish_and_wait`], consumers drain what is left, observe
//! end-of-stream, and that observation releases the producer.
//!
//! Producers serialize among themselves on an entry lock and consumers on an
//! exit lock, so a blocked producer never holds up a consumer and vice versa.
//! A single state mutex with `nonempty`/`nonfull`/`finished` conditions
//! coordinates the two sides.

use crate::error::{QueueError, QueueResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Result of a non-blocking [`BoundedQueue::can_get`] poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// At least one item is available
    Ready,
    /// Nothing queued yet, more may arrive
    Empty,
    /// Finishing and drained
    Finished,
}

/// Statistics for a queue
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Total items accepted
    pub enqueued: AtomicU64,

    /// Total items handed to consumers
    pub dequeued: AtomicU64,

    /// Head items moved to the tail by `pending`
    pub requeued: AtomicU64,

    /// Number of times a producer had to wait for space
    pub backpressure_events: AtomicU64,
}

impl QueueStats {
    /// Get queue throughput (dequeued items)
    pub fn throughput(&self) -> u64 {
        self.dequeued.load(Ordering::Relaxed)
    }

    /// Get number of requeued items
    pub fn requeue_count(&self) -> u64 {
        self.requeued.load(Ordering::Relaxed)
    }

    /// Get backpressure event count
    pub fn backpressure_count(&self) -> u64 {
        self.backpressure_events.load(Ordering::Relaxed)
    }
}

struct State<T> {
    items: VecDeque<T>,
    finishing: bool,
    finished: bool,
}

/// Capacity-limited FIFO with blocking enter/dequeue and a finish handshake
pub struct BoundedQueue<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    nonempty: Condvar,
    nonfull: Condvar,
    finished: Condvar,
    entry_lock: Mutex<()>,
    exit_lock: Mutex<()>,
    stats: QueueStats,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items
    ///
    /// Storage for the full capacity is reserved up front so that a queue
    /// which constructs successfully never allocates while enqueuing.
    pub fn new(capacity: usize) -> QueueResult<Self> {
        if capacity == 0 {
            return Err(QueueError::InvalidCapacity(capacity));
        }
        let mut items = VecDeque::new();
        items
            .try_reserve_exact(capacity)
            .map_err(|_| QueueError::OutOfMemory { capacity })?;

        Ok(Self {
            capacity,
            state: Mutex::new(State {
                items,
                finishing: false,
                finished: false,
            }),
            nonempty: Condvar::new(),
            nonfull: Condvar::new(),
            finished: Condvar::new(),
            entry_lock: Mutex::new(()),
            exit_lock: Mutex::new(()),
            stats: QueueStats::default(),
        })
    }

    /// Append an item, blocking while the queue is full
    ///
    /// Fails with [`QueueError::Finishing`] once the producer side has
    /// finished; the item is dropped and blocked consumers are woken so they
    /// can observe end-of-stream.
    pub fn enter(&self, item: T) -> QueueResult<()> {
        let _entry = self.entry_lock.lock();
        let mut state = self.state.lock();

        if state.finishing {
            self.nonempty.notify_all();
            return Err(QueueError::Finishing);
        }

        if state.items.len() >= self.capacity {
            self.stats.backpressure_events.fetch_add(1, Ordering::Relaxed);
            while state.items.len() >= self.capacity {
                self.nonfull.wait(&mut state);
            }
        }

        state.items.push_back(item);
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        self.nonempty.notify_one();
        Ok(())
    }

    /// Remove and return the head item, blocking while empty
    ///
    /// Returns [`QueueError::EndOfStream`] once the queue is finishing and
    /// drained. Repeated calls after that keep returning end-of-stream.
    pub fn dequeue(&self) -> QueueResult<T> {
        let _exit = self.exit_lock.lock();
        let mut state = self.wait_nonempty()?;

        let item = state.items.pop_front().ok_or(QueueError::EndOfStream)?;
        self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
        self.nonfull.notify_one();
        Ok(item)
    }

    /// Inspect the head item without removing it, blocking while empty
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> QueueResult<R> {
        let _exit = self.exit_lock.lock();
        let state = self.wait_nonempty()?;
        state.items.front().map(f).ok_or(QueueError::EndOfStream)
    }

    /// Clone of the head item, blocking while empty
    pub fn peek(&self) -> QueueResult<T>
    where
        T: Clone,
    {
        self.peek_with(T::clone)
    }

    /// Move the head item to the tail
    ///
    /// Used after a peek when the consumer cannot act on the head yet. No-op
    /// with fewer than two items.
    pub fn pending(&self) {
        self.pending_with(|_| {});
    }

    /// Like [`pending`](Self::pending), updating the head item first
    ///
    /// `f` runs on the head item whenever one exists, even when there is
    /// nothing to rotate past it.
    pub fn pending_with(&self, f: impl FnOnce(&mut T)) {
        let _exit = self.exit_lock.lock();
        let mut state = self.state.lock();

        if let Some(head) = state.items.front_mut() {
            f(head);
        }
        if state.items.len() >= 2 {
            if let Some(head) = state.items.pop_front() {
                state.items.push_back(head);
                self.stats.requeued.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Non-blocking poll of the consumer side
    pub fn can_get(&self) -> Readiness {
        let state = self.state.lock();
        if !state.items.is_empty() {
            Readiness::Ready
        } else if state.finishing {
            Readiness::Finished
        } else {
            Readiness::Empty
        }
    }

    /// Declare that no more items will be entered and wait for the drain
    ///
    /// Returns once a consumer has observed the queue empty and finishing.
    /// Must not be called from the only consumer thread.
    pub fn finish_and_wait(&self) {
        let _entry = self.entry_lock.lock();
        let mut state = self.state.lock();

        state.finishing = true;
        while !state.finished {
            self.nonempty.notify_all();
            self.finished.wait(&mut state);
        }
    }

    /// Items currently queued
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the producer side has finished
    pub fn is_finishing(&self) -> bool {
        self.state.lock().finishing
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Wait for an item or end-of-stream, with the exit lock already held
    fn wait_nonempty(&self) -> QueueResult<parking_lot::MutexGuard<'_, State<T>>> {
        let mut state = self.state.lock();
        while state.items.is_empty() && !state.finishing {
            self.nonempty.wait(&mut state);
        }
        if state.items.is_empty() {
            state.finished = true;
            self.finished.notify_all();
            return Err(QueueError::EndOfStream);
        }
        Ok(state)
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity)
            .field("len", &state.items.len())
            .field("finishing", &state.finishing)
            .field("finished", &state.finished)
            .finish()
    }
}
