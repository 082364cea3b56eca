//! rulesync work queue: coalescing pending set, in-flight tracking and
//! rate-limited requeue.
//!
//! Semantics follow the classic controller work queue:
//! - an item that is already pending is not queued twice;
//! - an item that is in flight (handed out by `get`, not yet `done`) is
//!   marked dirty and queued again once `done` is called, so at most one
//!   copy of an equal item is ever processed at a time;
//! - failures are counted per item and drive the requeue delay.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::gauge;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::debug;

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self { Self { base: Duration::from_millis(5), max: Duration::from_secs(1000) } }
}

impl Backoff {
    pub fn delay(&self, failures: u32) -> Duration {
        if failures >= 64 { return self.max; }
        let nanos = self.base.as_nanos().saturating_mul(1u128 << failures);
        if nanos >= self.max.as_nanos() { self.max } else { Duration::from_nanos(nanos as u64) }
    }
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    failures: FxHashMap<T, u32>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    backoff: Backoff,
}

/// Cloneable handle; all clones share one queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<T: Clone + Eq + Hash + Send + 'static> Default for WorkQueue<T> {
    fn default() -> Self { Self::new() }
}

impl<T: Clone + Eq + Hash + Send + 'static> WorkQueue<T> {
    pub fn new() -> Self { Self::with_backoff(Backoff::default()) }

    pub fn with_backoff(backoff: Backoff) -> Self {
        let state = State {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            failures: FxHashMap::default(),
            shutting_down: false,
        };
        Self { inner: Arc::new(Inner { state: Mutex::new(state), notify: Notify::new(), backoff }) }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `item` unless an equal item is already pending.
    pub fn add(&self, item: T) {
        let mut st = self.lock();
        if st.shutting_down || st.dirty.contains(&item) {
            return;
        }
        st.dirty.insert(item.clone());
        if st.processing.contains(&item) {
            // requeued by done()
            return;
        }
        st.queue.push_back(item);
        gauge!("rulesync_queue_depth", st.queue.len() as f64);
        drop(st);
        self.inner.notify.notify_one();
    }

    /// Wait for the next item. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut st = self.lock();
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    gauge!("rulesync_queue_depth", st.queue.len() as f64);
                    return Some(item);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `item` as no longer in flight. If it was added again meanwhile it is queued now.
    pub fn done(&self, item: &T) {
        let mut st = self.lock();
        st.processing.remove(item);
        if st.shutting_down || !st.dirty.contains(item) {
            return;
        }
        st.queue.push_back(item.clone());
        drop(st);
        self.inner.notify.notify_one();
    }

    /// Count a failure for `item` and add it back after the backoff delay.
    /// Must be called from within a Tokio runtime.
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut st = self.lock();
            let failures = st.failures.entry(item.clone()).or_insert(0);
            let delay = self.inner.backoff.delay(*failures);
            *failures += 1;
            delay
        };
        self.add_after(item, delay);
    }

    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        debug!(delay_ms = %delay.as_millis(), "queue: delayed add");
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Failures recorded for `item` since the last `forget`.
    pub fn num_requeues(&self, item: &T) -> u32 { self.lock().failures.get(item).copied().unwrap_or(0) }

    pub fn forget(&self, item: &T) { self.lock().failures.remove(item); }

    /// Number of pending (not in-flight) items.
    pub fn len(&self) -> usize { self.lock().queue.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Discard pending items, ignore later adds and release every waiting `get`.
    pub fn shutdown(&self) {
        {
            let mut st = self.lock();
            st.shutting_down = true;
            st.queue.clear();
            st.dirty.clear();
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }
}
