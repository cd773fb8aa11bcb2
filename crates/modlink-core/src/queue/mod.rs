//! Rate-limited work queue with per-key serialization.
//!
//! Keys queued here are deduplicated, and a key handed to a worker is never
//! handed to a second worker until the first calls [`WorkQueue::done`]: a key
//! re-added mid-processing is parked in the dirty set and queued again only
//! when its worker finishes. Reconcile logic keyed this way needs no further
//! locking.
//!
//! Failed keys come back through [`WorkQueue::add_rate_limited`], which
//! combines per-key exponential backoff with a global token bucket (see
//! [`limiter`]).

pub mod limiter;

pub use limiter::QueueRateLimiter;

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

/// Outcome of one reconcile pass, governing requeue behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Requeue with rate-limited backoff.
    pub requeue: bool,
    /// Requeue after a fixed delay; takes precedence over `requeue`.
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// The pass succeeded; forget the key.
    #[must_use]
    pub const fn done() -> Self {
        Self {
            requeue: false,
            requeue_after: None,
        }
    }

    /// Retry the key with rate-limited backoff.
    #[must_use]
    pub const fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    /// Retry the key after a fixed delay.
    #[must_use]
    pub const fn after(delay: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(delay),
        }
    }
}

/// A per-key serialized work queue.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    wakeup: Notify,
    /// Back-reference handed to delayed re-add tasks.
    this: Weak<Self>,
}

struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    limiter: QueueRateLimiter,
    shutting_down: bool,
}

impl WorkQueue {
    /// Creates a queue with the given rate limiter.
    #[must_use]
    pub fn new(limiter: QueueRateLimiter) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                limiter,
                shutting_down: false,
            }),
            wakeup: Notify::new(),
            this: this.clone(),
        })
    }

    /// Enqueues a key. Keys already queued are deduplicated; keys currently
    /// being processed are parked until their worker calls [`Self::done`].
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if !state.processing.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.wakeup.notify_waiters();
        }
    }

    /// Enqueues a key after a fixed delay.
    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let Some(queue) = self.this.upgrade() else {
            return;
        };
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Enqueues a key after its rate-limited backoff delay.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = self.state.lock().limiter.delay(key);
        trace!(key, ?delay, "requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Clears the backoff history of a key after a successful pass.
    pub fn forget(&self, key: &str) {
        self.state.lock().limiter.forget(key);
    }

    /// Marks a key as no longer being processed, requeueing it when it was
    /// re-added mid-flight.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.wakeup.notify_waiters();
        }
    }

    /// Waits for the next key. Returns `None` once the queue is shut down and
    /// drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let wakeup = self.wakeup.notified();
            tokio::pin!(wakeup);
            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
                // Register for a wakeup while still holding the lock so an
                // add between unlock and await cannot be lost.
                wakeup.as_mut().enable();
            }
            wakeup.await;
        }
    }

    /// Pops a key without waiting. Test and drain helper.
    pub fn try_get(&self) -> Option<String> {
        let mut state = self.state.lock();
        let key = state.queue.pop_front()?;
        state.dirty.remove(&key);
        state.processing.insert(key.clone());
        Some(key)
    }

    /// Stops accepting new keys and wakes blocked workers; [`Self::get`]
    /// returns `None` once the backlog is drained.
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.wakeup.notify_waiters();
    }

    /// Number of keys waiting to be handed to a worker.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no keys are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
