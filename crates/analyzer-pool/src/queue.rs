//! Capacity-bounded FIFO hand-off queues.
//!
//! Frame and result queues use [`OverflowPolicy::DropOldest`]: a push onto a full queue
//! evicts the oldest entry so end-to-end latency stays bounded. The evicted value is
//! dropped in place, which for [`crate::FrameRef`] (and anything wrapping one) releases
//! its arena reference exactly once.
//!
//! The alarm queue uses [`OverflowPolicy::Block`], making the producer wait up to a
//! timeout for room instead of discarding anything.

use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

/// Behaviour of [`BoundedQueue::push`] when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest item, then push.
    DropOldest,
    /// Wait up to `timeout` for space; give up and drop the new item afterwards.
    Block {
        /// Longest time a producer waits.
        timeout: Duration,
    },
}

/// Queue counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Queue name used in logs.
    pub name: String,
    /// Items currently queued.
    pub len: usize,
    /// Maximum items.
    pub capacity: usize,
    /// Items accepted.
    pub pushed: u64,
    /// Items removed by drop-oldest eviction.
    pub evicted: u64,
    /// Items refused after a blocking push timed out.
    pub rejected: u64,
}

#[derive(Default)]
struct QueueMetrics {
    pushed: AtomicU64,
    evicted: AtomicU64,
    rejected: AtomicU64,
}

/// Bounded multi-producer multi-consumer queue with async waiting.
pub struct BoundedQueue<T> {
    name: String,
    items: ArrayQueue<T>,
    policy: OverflowPolicy,
    not_empty: Notify,
    not_full: Notify,
    metrics: QueueMetrics,
}

impl<T: Send> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (clamped to at least one).
    pub fn new(name: impl Into<String>, capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            name: name.into(),
            items: ArrayQueue::new(capacity.max(1)),
            policy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            metrics: QueueMetrics::default(),
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue `item` according to the overflow policy.
    ///
    /// Returns `false` only when a blocking push timed out; the item is dropped then.
    pub async fn push(&self, item: T) -> bool {
        match self.policy {
            OverflowPolicy::DropOldest => {
                if let Some(evicted) = self.items.force_push(item) {
                    drop(evicted);
                    self.metrics.evicted.fetch_add(1, Ordering::Relaxed);
                }
                self.accepted();
                true
            }
            OverflowPolicy::Block { timeout } => self.push_blocking(item, timeout).await,
        }
    }

    async fn push_blocking(&self, mut item: T, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.items.push(item) {
                Ok(()) => {
                    self.accepted();
                    return true;
                }
                Err(back) => item = back,
            }
            if tokio::time::timeout_at(deadline, self.not_full.notified())
                .await
                .is_err()
            {
                if self.items.push(item).is_ok() {
                    self.accepted();
                    return true;
                }
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    queue = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "push timed out on full queue"
                );
                return false;
            }
        }
    }

    fn accepted(&self) {
        self.metrics.pushed.fetch_add(1, Ordering::Relaxed);
        self.not_empty.notify_one();
    }

    /// Dequeue the oldest item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.items.pop();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Dequeue the oldest item, waiting up to `timeout`. `None` means the queue stayed empty.
    pub async fn pop(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, self.not_empty.notified())
                .await
                .is_err()
            {
                return self.try_pop();
            }
        }
    }

    /// Drop every queued item; returns how many were removed.
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        while let Some(item) = self.items.pop() {
            drop(item);
            drained += 1;
        }
        if drained > 0 {
            self.not_full.notify_waiters();
        }
        drained
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum items.
    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    /// Current counters.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            name: self.name.clone(),
            len: self.items.len(),
            capacity: self.items.capacity(),
            pushed: self.metrics.pushed.load(Ordering::Relaxed),
            evicted: self.metrics.evicted.load(Ordering::Relaxed),
            rejected: self.metrics.rejected.load(Ordering::Relaxed),
        }
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("name", &self.name)
            .field("len", &self.items.len())
            .field("capacity", &self.items.capacity())
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameArena, FrameShape, PixelDtype};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = BoundedQueue::new("fifo", 16, OverflowPolicy::DropOldest);
        for i in 0..10 {
            assert!(queue.push(i).await);
        }
        let mut received = Vec::new();
        while let Some(i) = queue.pop(Duration::from_millis(5)).await {
            received.push(i);
        }
        assert_eq!(received, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest() {
        let queue = BoundedQueue::new("frames", 3, OverflowPolicy::DropOldest);
        for i in 0..8 {
            queue.push(i).await;
        }
        let stats = queue.stats();
        assert_eq!(stats.evicted, 5);
        assert_eq!(stats.pushed, 8);

        let mut remaining = Vec::new();
        while let Some(i) = queue.try_pop() {
            remaining.push(i);
        }
        assert_eq!(remaining, vec![5, 6, 7]);
    }

    #[test]
    fn test_drop_oldest_push_never_waits() {
        let queue = BoundedQueue::new("frames", 1, OverflowPolicy::DropOldest);
        for i in 0..3 {
            let mut push = tokio_test::task::spawn(queue.push(i));
            tokio_test::assert_ready_eq!(push.poll(), true);
        }
        assert_eq!(queue.try_pop(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_times_out_when_empty() {
        let queue: BoundedQueue<u8> = BoundedQueue::new("empty", 1, OverflowPolicy::DropOldest);
        let start = Instant::now();
        assert!(queue.pop(Duration::from_millis(250)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(BoundedQueue::new("wake", 4, OverflowPolicy::DropOldest));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(42u32).await;
        assert_eq!(consumer.await.unwrap(), Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_push_times_out() {
        let queue = BoundedQueue::new(
            "alarms",
            1,
            OverflowPolicy::Block {
                timeout: Duration::from_millis(100),
            },
        );
        assert!(queue.push(1u8).await);
        assert!(!queue.push(2u8).await);
        assert_eq!(queue.stats().rejected, 1);
        assert_eq!(queue.try_pop(), Some(1));
    }

    #[tokio::test]
    async fn test_blocking_push_resumes_when_space_frees() {
        let queue = Arc::new(BoundedQueue::new(
            "alarms",
            1,
            OverflowPolicy::Block {
                timeout: Duration::from_secs(5),
            },
        ));
        queue.push(1u8).await;
        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push(2u8).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.try_pop(), Some(1));
        assert!(producer.await.unwrap());
        assert_eq!(queue.try_pop(), Some(2));
    }

    #[tokio::test]
    async fn test_eviction_releases_frames_once() {
        let arena = FrameArena::new(4, 64);
        let queue = BoundedQueue::new("frames", 2, OverflowPolicy::DropOldest);
        for _ in 0..4 {
            let slot = arena.allocate("cam").unwrap();
            let frame = arena
                .write(slot, &[1u8; 12], FrameShape::bgr(2, 2), PixelDtype::U8)
                .unwrap();
            queue.push(frame).await;
        }
        assert_eq!(arena.stats().free, 2);
        assert_eq!(queue.drain(), 2);
        let stats = arena.stats();
        assert_eq!(stats.free, 4);
        assert_eq!(stats.allocations, stats.releases);
    }
}
