//! Rekon work queue: a deduplicating delay queue with per-item rate limiting.
//!
//! Items move through three sets guarded by one mutex:
//! - `waiting`: scheduled for a future instant (grace periods, backoff)
//! - `dirty`: pending processing; mirrored in the FIFO `queue` unless in flight
//! - `processing`: handed out by `get()` and not yet `done()`
//!
//! An item is in `queue` at most once and never while it is processing, which
//! gives at-most-one-worker-per-item regardless of how often it is re-added.

#![forbid(unsafe_code)]

pub mod limiter;

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

pub use limiter::{
    controller_rate_limiter, default_controller_rate_limiter, ExponentialFailure, MaxOf, RateLimiter,
    TokenBucket,
};

struct State<T> {
    queue: VecDeque<T>,
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    waiting: FxHashMap<T, Instant>,
    shutting_down: bool,
}

impl<T: Eq + Hash + Clone> State<T> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            waiting: FxHashMap::default(),
            shutting_down: false,
        }
    }

    /// Returns true when the item became ready for `get()`.
    fn insert_ready(&mut self, item: T) -> bool {
        if !self.dirty.insert(item.clone()) {
            return false;
        }
        if self.processing.contains(&item) {
            // re-queued by done()
            return false;
        }
        self.queue.push_back(item);
        true
    }

    fn promote_due(&mut self, now: Instant) -> usize {
        let due: Vec<T> = self
            .waiting
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(item, _)| item.clone())
            .collect();
        let mut ready = 0;
        for item in due {
            self.waiting.remove(&item);
            if self.insert_ready(item) {
                ready += 1;
            }
        }
        ready
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.waiting.values().min().copied()
    }
}

/// Deduplicating, delay-capable work queue shared by a pool of workers.
pub struct WorkQueue<T> {
    name: String,
    state: Mutex<State<T>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<T>>,
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
{
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::new()),
            notify: Notify::new(),
            limiter: Box::new(limiter),
        }
    }

    pub fn with_default_limiter(name: impl Into<String>) -> Self {
        Self::new(name, default_controller_rate_limiter())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_depth(&self, depth: usize) {
        gauge!("rekon_workqueue_depth", depth as f64, "queue" => self.name.clone());
    }

    /// Make `item` ready now. No-op when it is already ready; a delayed entry
    /// for the same item stays scheduled.
    pub fn add(&self, item: T) {
        let became_ready = {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            counter!("rekon_workqueue_adds_total", 1u64, "queue" => self.name.clone());
            let ready = st.insert_ready(item);
            self.record_depth(st.queue.len());
            ready
        };
        if became_ready {
            self.notify.notify_one();
        }
    }

    /// Make `item` ready no earlier than `now + delay`.
    ///
    /// If the item is already waiting, the earlier of the two instants wins.
    /// A pending immediate add does not cancel the delayed one: the item is
    /// processed now and again once the delay has passed.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            return self.add(item);
        }
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            let at = Instant::now() + delay;
            let slot = st.waiting.entry(item).or_insert(at);
            if at < *slot {
                *slot = at;
            }
        }
        // Sleeping getters may need an earlier wake-up.
        self.notify.notify_waiters();
    }

    /// Re-add after the rate limiter's delay for this item.
    pub fn add_rate_limited(&self, item: T) {
        if self.is_shutting_down() {
            return;
        }
        let delay = self.limiter.when(&item);
        counter!("rekon_workqueue_retries_total", 1u64, "queue" => self.name.clone());
        debug!(queue = %self.name, item = ?item, delay_ms = delay.as_millis() as u64, "rate limited requeue");
        self.add_after(item, delay);
    }

    /// Clear the failure history for `item`.
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.limiter.num_requeues(item)
    }

    /// Wait for the next ready item. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a concurrent add can't slip by.
            notified.as_mut().enable();

            let deadline = {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                st.promote_due(Instant::now());
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    self.record_depth(st.queue.len());
                    if !st.queue.is_empty() {
                        // more work than this getter can take
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                st.next_deadline()
            };

            match deadline {
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

    /// Mark processing of `item` complete; re-queues it if it was re-added meanwhile.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut st = self.lock();
            st.processing.remove(item);
            if st.dirty.contains(item) && !st.shutting_down {
                st.queue.push_back(item.clone());
                self.record_depth(st.queue.len());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop handing out work. Pending and future `get()` calls return `None`.
    pub fn shut_down(&self) {
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
        }
        debug!(queue = %self.name, "work queue shutting down");
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Items ready to be handed out right now.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items scheduled for a future instant.
    pub fn waiting_len(&self) -> usize {
        self.lock().waiting.len()
    }

    /// Instant at which `item` is scheduled to become ready, if it is waiting.
    pub fn scheduled_at(&self, item: &T) -> Option<Instant> {
        self.lock().waiting.get(item).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new("test", ExponentialFailure::new(Duration::from_millis(10), Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let q = queue();
        q.add("a");
        q.add("a");
        q.add("b");
        q.add("a");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn readd_while_processing_waits_for_done() {
        let q = queue();
        q.add("a");
        let item = q.get().await.unwrap();
        q.add("a");
        q.add("a");
        assert_eq!(q.len(), 0, "in-flight item must not be handed out again");
        q.done(&item);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_delays_delivery() {
        let q = queue();
        let start = Instant::now();
        q.add_after("a", Duration::from_secs(5));
        assert_eq!(q.len(), 0);
        assert_eq!(q.waiting_len(), 1);
        assert_eq!(q.get().await, Some("a"));
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(q.waiting_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_schedule_wins() {
        let q = queue();
        let start = Instant::now();
        q.add_after("a", Duration::from_secs(10));
        q.add_after("a", Duration::from_secs(2));
        q.add_after("a", Duration::from_secs(7));
        assert_eq!(q.scheduled_at(&"a"), Some(start + Duration::from_secs(2)));
        assert_eq!(q.get().await, Some("a"));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_add_keeps_delayed_entry() {
        let q = queue();
        let start = Instant::now();
        q.add_after("a", Duration::from_secs(30));
        q.add("a");
        assert_eq!(q.waiting_len(), 1);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(start.elapsed(), Duration::ZERO);
        q.done(&"a");
        assert_eq!(q.get().await, Some("a"));
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_add_of_ready_item_is_still_scheduled() {
        let q = queue();
        let start = Instant::now();
        q.add("a");
        q.add_after("a", Duration::from_secs(5));
        assert_eq!(q.len(), 1);
        assert_eq!(q.scheduled_at(&"a"), Some(start + Duration::from_secs(5)));

        assert_eq!(q.get().await, Some("a"));
        assert_eq!(start.elapsed(), Duration::ZERO);
        q.done(&"a");
        assert_eq!(q.get().await, Some("a"));
        assert!(start.elapsed() >= Duration::from_secs(5));
        q.done(&"a");
        assert!(q.is_empty());
        assert_eq!(q.waiting_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn due_entry_of_item_already_ready_is_not_duplicated() {
        let q = queue();
        q.add_after("a", Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        q.add("a");
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
        assert_eq!(q.waiting_len(), 0);
    }

    #[test]
    fn rate_limited_add_after_shutdown_is_not_counted() {
        let q = queue();
        q.shut_down();
        q.add_rate_limited("a");
        assert_eq!(q.num_requeues(&"a"), 0);
        assert_eq!(q.waiting_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sleeping_getter_wakes_for_earlier_deadline() {
        let q = Arc::new(queue());
        q.add_after("late", Duration::from_secs(60));
        let getter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        let start = Instant::now();
        q.add_after("early", Duration::from_secs(1));
        assert_eq!(getter.await.unwrap(), Some("early"));
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn shutdown_releases_blocked_getters() {
        let q = Arc::new(queue());
        let mut getters = Vec::new();
        for _ in 0..3 {
            let q = Arc::clone(&q);
            getters.push(tokio::spawn(async move { q.get().await }));
        }
        tokio::task::yield_now().await;
        q.shut_down();
        for g in getters {
            assert_eq!(g.await.unwrap(), None);
        }
        q.add("ignored");
        assert!(q.is_empty());
        assert!(q.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_requeue_backs_off() {
        let q = queue();
        let start = Instant::now();
        q.add_rate_limited("a");
        assert_eq!(q.scheduled_at(&"a"), Some(start + Duration::from_millis(10)));
        assert_eq!(q.get().await, Some("a"));
        q.add_rate_limited("a");
        q.done(&"a");
        assert_eq!(q.num_requeues(&"a"), 2);
        assert_eq!(q.get().await, Some("a"));
        assert!(start.elapsed() >= Duration::from_millis(30));
        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);
    }
}
