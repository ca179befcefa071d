//! Bounded multi-producer multi-consumer queue with selectable overflow policy
//!
//! Front door of the pipeline worker pool, the persistence lanes, and the
//! gateway subscriber. Capacity is fixed at construction; what happens at
//! capacity is the policy: block the producer, reject the push, or drop the
//! oldest entry. Drops and rejections are counted so queue pressure shows
//! up in stats instead of disappearing silently.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::Notify;

/// What to do with a push when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Suspend the producer until space frees up.
    #[default]
    Block,
    /// Fail the push with [`QueueError::Full`].
    Reject,
    /// Evict the oldest queued item to make room.
    DropOldest,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full (capacity {0})")]
    Full(usize),
    #[error("queue is closed")]
    Closed,
}

/// Bounded MPMC queue. All methods are callable from any task.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    closed: AtomicBool,
    not_empty: Notify,
    not_full: Notify,
    dropped: AtomicU64,
    rejected: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            policy,
            closed: AtomicBool::new(false),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Push an item, applying the overflow policy.
    ///
    /// Only the `Block` policy suspends; `Reject` and `DropOldest` return
    /// immediately.
    pub async fn push(&self, item: T) -> Result<(), QueueError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(QueueError::Closed);
            }
            {
                let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
                if items.len() < self.capacity {
                    items.push_back(item);
                    drop(items);
                    self.not_empty.notify_one();
                    return Ok(());
                }
                match self.policy {
                    OverflowPolicy::Reject => {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(QueueError::Full(self.capacity));
                    }
                    OverflowPolicy::DropOldest => {
                        items.pop_front();
                        items.push_back(item);
                        drop(items);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        self.not_empty.notify_one();
                        return Ok(());
                    }
                    OverflowPolicy::Block => {}
                }
            }
            // Block policy: wait for a consumer, then retry.
            let notified = self.not_full.notified();
            {
                let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
                if items.len() < self.capacity {
                    continue;
                }
            }
            notified.await;
        }
    }

    /// Pop the next item, suspending while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(item) = items.pop_front() {
                    drop(items);
                    self.not_full.notify_one();
                    return Some(item);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            let notified = self.not_empty.notified();
            {
                let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
                if !items.is_empty() {
                    continue;
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking pop; `None` when empty.
    pub fn try_pop(&self) -> Option<T> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let item = items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Close the queue: pending pops drain the remainder, new pushes fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items evicted under the `DropOldest` policy.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Pushes refused under the `Reject` policy.
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn fifo_order() {
        let q = BoundedQueue::new(4, OverflowPolicy::Reject);
        q.push(1).await.unwrap();
        q.push(2).await.unwrap();
        assert_eq!(q.pop().await, Some(1));
        assert_eq!(q.pop().await, Some(2));
    }

    #[tokio::test]
    async fn reject_at_capacity() {
        let q = BoundedQueue::new(2, OverflowPolicy::Reject);
        q.push(1).await.unwrap();
        q.push(2).await.unwrap();
        assert_eq!(q.push(3).await, Err(QueueError::Full(2)));
        assert_eq!(q.rejected_count(), 1);
    }

    #[tokio::test]
    async fn drop_oldest_at_capacity() {
        let q = BoundedQueue::new(2, OverflowPolicy::DropOldest);
        q.push(1).await.unwrap();
        q.push(2).await.unwrap();
        q.push(3).await.unwrap();
        assert_eq!(q.dropped_count(), 1);
        assert_eq!(q.pop().await, Some(2));
        assert_eq!(q.pop().await, Some(3));
    }

    #[tokio::test]
    async fn block_resumes_after_pop() {
        let q = Arc::new(BoundedQueue::new(1, OverflowPolicy::Block));
        q.push(1).await.unwrap();

        let q2 = Arc::clone(&q);
        let producer = tokio::spawn(async move { q2.push(2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.pop().await, Some(1));

        producer.await.unwrap().unwrap();
        assert_eq!(q.pop().await, Some(2));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let q = Arc::new(BoundedQueue::new(4, OverflowPolicy::Reject));
        q.push(1).await.unwrap();
        q.close();
        assert_eq!(q.push(2).await, Err(QueueError::Closed));
        assert_eq!(q.pop().await, Some(1));
        assert_eq!(q.pop().await, None);
    }
}
