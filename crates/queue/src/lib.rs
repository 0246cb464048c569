//! Recon work queue: deduplicating, rate-limited delay queue of item keys.
//!
//! An item moves through `pending -> processing -> done`, with an optional
//! `waiting` detour when it is re-added after a delay. While an item is
//! processing, further adds only mark it dirty; `done` then puts it back once.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

pub mod rate_limit;

/// Longest delay `add_after` honours; longer ones are clamped to it.
pub const MAX_DELAY: Duration = Duration::from_secs(86400 * 365 * 30);

pub use rate_limit::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter,
    RateLimiter,
};

/// Bounds every queued item satisfies.
pub trait QueueItem: Clone + Eq + Hash + fmt::Debug + Send + 'static {}
impl<T: Clone + Eq + Hash + fmt::Debug + Send + 'static> QueueItem for T {}

struct Waiting<T> {
    ready_at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Waiting<T> {
    fn eq(&self, other: &Self) -> bool { self.ready_at == other.ready_at && self.seq == other.seq }
}
impl<T> Eq for Waiting<T> {}
impl<T> PartialOrd for Waiting<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl<T> Ord for Waiting<T> {
    // Reversed so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.ready_at.cmp(&self.ready_at).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    waiting: BinaryHeap<Waiting<T>>,
    // earliest deadline per waiting item; heap entries that disagree are stale
    waiting_ready: FxHashMap<T, Instant>,
    seq: u64,
    shutting_down: bool,
}

impl<T: QueueItem> State<T> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            waiting: BinaryHeap::new(),
            waiting_ready: FxHashMap::default(),
            seq: 0,
            shutting_down: false,
        }
    }

    /// Returns true when the item became newly deliverable.
    fn add(&mut self, item: T) -> bool {
        if self.shutting_down {
            debug!(item = ?item, "queue shutting down; add dropped");
            return false;
        }
        if self.dirty.contains(&item) {
            debug!(item = ?item, "already pending; collapsed");
            return false;
        }
        self.dirty.insert(item.clone());
        if self.processing.contains(&item) {
            debug!(item = ?item, "in flight; marked dirty for redelivery");
            return false;
        }
        self.queue.push_back(item);
        true
    }

    fn promote_ready(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while self.waiting.peek().is_some_and(|w| w.ready_at <= now) {
            let Some(w) = self.waiting.pop() else { break };
            if self.waiting_ready.get(&w.item) != Some(&w.ready_at) {
                continue;
            }
            self.waiting_ready.remove(&w.item);
            if self.add(w.item) {
                promoted += 1;
            }
        }
        promoted
    }

    fn next_ready_at(&self) -> Option<Instant> { self.waiting.peek().map(|w| w.ready_at) }
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<T>>,
}

/// Cloneable handle to a shared queue; all synchronization is internal.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<T: QueueItem> WorkQueue<T> {
    pub fn new(name: impl Into<String>, limiter: Box<dyn RateLimiter<T>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State::new()),
                notify: Notify::new(),
                limiter,
            }),
        }
    }

    /// Queue backed by [`default_controller_rate_limiter`].
    pub fn with_default_rate_limiter(name: impl Into<String>) -> Self {
        Self::new(name, Box::new(default_controller_rate_limiter()))
    }

    pub fn name(&self) -> &str { &self.inner.name }

    fn lock(&self) -> MutexGuard<'_, State<T>> { self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) }

    fn record_depth(&self, st: &State<T>) {
        gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.inner.name.clone());
    }

    /// Make `item` deliverable now. No-op when it is already pending; deferred
    /// until `done` when it is currently processing.
    pub fn add(&self, item: T) {
        let mut st = self.lock();
        if st.add(item) {
            counter!("workqueue_adds_total", 1u64, "name" => self.inner.name.clone());
            self.record_depth(&st);
            drop(st);
            self.inner.notify.notify_one();
        }
    }

    /// Add `item` once `delay` has elapsed. An earlier pending deadline for the same item wins.
    ///
    /// Delays beyond [`MAX_DELAY`] are clamped.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let ready_at = Instant::now() + delay.min(MAX_DELAY);
        let mut st = self.lock();
        if st.shutting_down {
            debug!(queue = %self.inner.name, item = ?item, "queue shutting down; delayed add dropped");
            return;
        }
        if st.waiting_ready.get(&item).is_some_and(|at| *at <= ready_at) {
            return;
        }
        st.seq = st.seq.wrapping_add(1);
        let seq = st.seq;
        st.waiting_ready.insert(item.clone(), ready_at);
        st.waiting.push(Waiting { ready_at, seq, item });
        drop(st);
        // wake a getter so it re-arms its timer on the new deadline
        self.inner.notify.notify_one();
    }

    /// Re-add `item` after the limiter's backoff for it; counts one more failure.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.limiter.when(&item);
        counter!("workqueue_retries_total", 1u64, "name" => self.inner.name.clone());
        debug!(queue = %self.inner.name, item = ?item, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        self.add_after(item, delay);
    }

    /// Reset retry tracking for `item`. Does not remove it from the queue.
    pub fn forget(&self, item: &T) { self.inner.limiter.forget(item); }

    pub fn num_requeues(&self, item: &T) -> u32 { self.inner.limiter.num_requeues(item) }

    /// Wait for the next deliverable item. `None` once the queue is shut down and drained.
    ///
    /// The returned item is owned by the caller until [`WorkQueue::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_ready = {
                let mut st = self.lock();
                st.promote_ready(Instant::now());
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    self.record_depth(&st);
                    let more = !st.queue.is_empty();
                    drop(st);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
                if st.shutting_down {
                    return None;
                }
                st.next_ready_at()
            };

            match next_ready {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release `item` from processing; redeliver it if it was re-added meanwhile.
    pub fn done(&self, item: &T) {
        let mut st = self.lock();
        st.processing.remove(item);
        if st.dirty.contains(item) {
            st.queue.push_back(item.clone());
            self.record_depth(&st);
            drop(st);
            self.inner.notify.notify_one();
        }
    }

    /// Stop accepting items. Idempotent; waiting delayed items are dropped, ready ones still drain.
    pub fn shut_down(&self) {
        let mut st = self.lock();
        if !st.shutting_down {
            st.shutting_down = true;
            st.waiting.clear();
            st.waiting_ready.clear();
            debug!(queue = %self.inner.name, remaining = st.queue.len(), "queue shutting down");
        }
        drop(st);
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Number of items ready for delivery.
    pub fn len(&self) -> usize {
        let mut st = self.lock();
        st.promote_ready(Instant::now());
        st.queue.len()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Number of items waiting out a delay.
    pub fn waiting_len(&self) -> usize { self.lock().waiting_ready.len() }

    pub fn is_processing(&self, item: &T) -> bool { self.lock().processing.contains(item) }
}
