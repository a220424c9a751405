//! Deduplicating, rate-limited work queue.
//!
//! Keys move through three sets:
//!
//! - **dirty**: keys that need processing (pending or re-requested while in flight)
//! - **processing**: keys handed out by [`WorkQueue::get`] and not yet `done`
//! - **queue**: the FIFO of dirty keys that are not being processed
//!
//! Adding a key that is already dirty is a no-op. Adding a key that is being
//! processed only marks it dirty; it goes back on the FIFO when the worker
//! calls [`WorkQueue::done`]. A key is therefore never held by two workers at
//! once.
//!
//! Delayed keys (from [`WorkQueue::add_after`] and
//! [`WorkQueue::add_rate_limited`]) wait in a min-heap and are promoted to the
//! FIFO by whichever consumer notices they are due.

mod rate_limiter;

pub use rate_limiter::{ControllerRateLimiter, ItemExponentialBackoff, TokenBucket};

use crate::config::QueueConfig;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Work queue shared by event producers and worker loops.
pub struct WorkQueue<K> {
    name: String,
    state: Mutex<QueueState<K>>,
    /// Wakes consumers blocked in `get`.
    notify: Notify,
    rate_limiter: ControllerRateLimiter<K>,
}

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    waiting: BinaryHeap<Delayed<K>>,
    next_seq: u64,
    shutting_down: bool,
}

/// A key waiting for its delay to expire.
struct Delayed<K> {
    ready_at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Delayed<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<K> Eq for Delayed<K> {}

impl<K> PartialOrd for Delayed<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Delayed<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earliest first, then insertion order (BinaryHeap is a max-heap).
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<K> QueueState<K>
where
    K: Eq + Hash + Clone,
{
    /// Returns true when the key was appended to the FIFO.
    fn insert(&mut self, key: K) -> bool {
        if self.shutting_down || self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    fn promote_due(&mut self, now: Instant) {
        while self.waiting.peek().is_some_and(|d| d.ready_at <= now) {
            if let Some(delayed) = self.waiting.pop() {
                self.insert(delayed.key);
            }
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Display + Send,
{
    /// Create a named queue with the given retry configuration.
    pub fn new(name: impl Into<String>, config: &QueueConfig) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: BinaryHeap::new(),
                next_seq: 0,
                shutting_down: false,
            }),
            notify: Notify::new(),
            rate_limiter: ControllerRateLimiter::new(config),
        }
    }

    /// Create a queue with default retry configuration.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, &QueueConfig::default())
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark `key` as needing processing.
    ///
    /// No-op if the key is already pending or the queue is shutting down.
    pub fn add(&self, key: K) {
        let pushed = self.state.lock().insert(key);
        if pushed {
            self.notify.notify_one();
        }
    }

    /// Make `key` visible to `get` after `delay`.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            let seq = state.next_seq;
            state.next_seq = state.next_seq.wrapping_add(1);
            state.waiting.push(Delayed {
                ready_at: Instant::now() + delay,
                seq,
                key,
            });
        }
        // A consumer asleep on an older deadline must recompute it.
        self.notify.notify_one();
    }

    /// Re-add `key` once the rate limiter allows it.
    pub fn add_rate_limited(&self, key: K) {
        if self.is_shutting_down() {
            return;
        }
        let delay = self.rate_limiter.when(&key);
        tracing::debug!(
            queue = %self.name,
            key = %key,
            delay_ms = delay.as_millis() as u64,
            requeues = self.rate_limiter.num_requeues(&key),
            "Requeueing with backoff"
        );
        self.add_after(key, delay);
    }

    /// Clear the retry history of `key`. Does not remove it from the queue.
    pub fn forget(&self, key: &K) {
        self.rate_limiter.forget(key);
    }

    /// Number of failed attempts recorded for `key`.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.rate_limiter.num_requeues(key)
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue is shut down and every pending key has
    /// been handed out. The returned key is exclusively owned by the caller
    /// until it passes it to [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_deadline = {
                let mut state = self.state.lock();
                state.promote_due(Instant::now());

                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
                state.waiting.peek().map(|d| d.ready_at)
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release `key` after processing.
    ///
    /// If the key was re-added while it was being processed it goes back on
    /// the queue now.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no key is ready to be handed out.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting keys and wake every waiting consumer.
    ///
    /// Delayed keys are discarded; keys already on the queue are still handed
    /// out by `get` before it starts returning `None`.
    pub fn shut_down(&self) {
        {
            let mut state = self.state.lock();
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.notify.notify_waiters();
        tracing::info!(queue = %self.name, "Work queue shut down");
    }

    /// Whether [`WorkQueue::shut_down`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue() -> WorkQueue<String> {
        WorkQueue::with_defaults("test")
    }

    #[tokio::test]
    async fn duplicate_adds_collapse_into_one_entry() {
        let queue = queue();
        queue.add("ns1/web".to_string());
        queue.add("ns1/web".to_string());
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.get().await.as_deref(), Some("ns1/web"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn fifo_of_first_enqueue() {
        let queue = queue();
        for key in ["ns1/a", "ns1/b", "ns1/a", "ns1/c"] {
            queue.add(key.to_string());
        }

        let mut order = Vec::new();
        for _ in 0..3 {
            let key = queue.get().await.unwrap();
            queue.done(&key);
            order.push(key);
        }
        assert_eq!(order, ["ns1/a", "ns1/b", "ns1/c"]);
    }

    #[tokio::test]
    async fn in_flight_key_is_not_handed_out_twice() {
        let queue = queue();
        queue.add("ns1/web".to_string());
        let key = queue.get().await.unwrap();

        // Re-added while processing: absorbed until done.
        queue.add(key.clone());
        queue.add(key.clone());
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(key.clone()));
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn done_without_re_add_does_not_requeue() {
        let queue = queue();
        queue.add("ns1/web".to_string());
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn get_wakes_on_add() {
        let queue = Arc::new(queue());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.add("ns1/web".to_string());
        assert_eq!(consumer.await.unwrap().as_deref(), Some("ns1/web"));
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_is_invisible_until_due() {
        let queue = queue();
        queue.add_after("ns1/web".to_string(), Duration::from_secs(5));
        assert!(queue.is_empty());

        let started = Instant::now();
        let key = queue.get().await;
        assert_eq!(key.as_deref(), Some("ns1/web"));
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn add_rate_limited_backs_off_and_forget_resets() {
        let config = QueueConfig {
            base_delay_ms: 100,
            ..Default::default()
        };
        let queue = WorkQueue::new("test", &config);
        let key = "ns1/web".to_string();

        for expected in [100u64, 200, 400] {
            let started = Instant::now();
            queue.add_rate_limited(key.clone());
            let got = queue.get().await.unwrap();
            queue.done(&got);
            assert!(started.elapsed() >= Duration::from_millis(expected));
        }
        assert_eq!(queue.num_requeues(&key), 3);

        queue.forget(&key);
        assert_eq!(queue.num_requeues(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_deadline_wins_over_sleeping_consumer() {
        let queue = Arc::new(queue());
        queue.add_after("ns1/slow".to_string(), Duration::from_secs(60));

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.add_after("ns1/fast".to_string(), Duration::from_secs(1));
        assert_eq!(consumer.await.unwrap().as_deref(), Some("ns1/fast"));
    }

    #[tokio::test]
    async fn shutdown_drains_then_reports_none() {
        let queue = queue();
        queue.add("ns1/a".to_string());
        queue.add_after("ns1/b".to_string(), Duration::from_secs(60));
        queue.shut_down();

        queue.add("ns1/c".to_string());
        assert!(queue.is_shutting_down());
        assert_eq!(queue.get().await.as_deref(), Some("ns1/a"));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_consumers() {
        let queue = Arc::new(queue());
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.get().await })
            })
            .collect();
        tokio::task::yield_now().await;

        queue.shut_down();
        for consumer in consumers {
            assert_eq!(consumer.await.unwrap(), None);
        }
    }
}
