//! The dispatch worker's outbound event queue.
//!
//! Needs two things a plain `tokio::sync::mpsc` channel doesn't give us:
//! pushing a message back onto the *front* on a recoverable retry, and a
//! timed pop that returns `None` on timeout rather than closing the
//! channel. A `VecDeque` behind a `tokio::sync::Mutex`, paired with a
//! `Notify` to wake a waiting pop, covers both.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

pub struct EventQueue {
    items: Mutex<VecDeque<String>>,
    notify: Notify,
    depth: AtomicUsize,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self { items: Mutex::new(VecDeque::new()), notify: Notify::new(), depth: AtomicUsize::new(0) }
    }

    pub async fn push_back(&self, item: String) {
        self.items.lock().await.push_back(item);
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Puts a message back at the head of the queue, for a recoverable
    /// publish failure that should be retried before anything newer.
    pub async fn push_front(&self, item: String) {
        self.items.lock().await.push_front(item);
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Waits up to `timeout` for a message, returning `None` if none
    /// arrived in time.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<String> {
        if let Some(item) = self.pop_now().await {
            return Some(item);
        }
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        self.pop_now().await
    }

    async fn pop_now(&self) -> Option<String> {
        let item = self.items.lock().await.pop_front();
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_preserved() {
        let q = EventQueue::new();
        q.push_back("a".into()).await;
        q.push_back("b".into()).await;
        assert_eq!(q.pop_timeout(Duration::from_millis(10)).await, Some("a".into()));
        assert_eq!(q.pop_timeout(Duration::from_millis(10)).await, Some("b".into()));
    }

    #[tokio::test]
    async fn push_front_requeues_ahead_of_newer_items() {
        let q = EventQueue::new();
        q.push_back("a".into()).await;
        q.push_back("b".into()).await;
        let popped = q.pop_timeout(Duration::from_millis(10)).await.unwrap();
        q.push_front(popped).await;
        assert_eq!(q.pop_timeout(Duration::from_millis(10)).await, Some("a".into()));
        assert_eq!(q.pop_timeout(Duration::from_millis(10)).await, Some("b".into()));
    }

    #[tokio::test]
    async fn pop_timeout_returns_none_when_empty() {
        let q = EventQueue::new();
        assert_eq!(q.pop_timeout(Duration::from_millis(20)).await, None);
    }

    #[tokio::test]
    async fn depth_tracks_pushes_and_pops() {
        let q = EventQueue::new();
        assert!(q.is_empty());
        q.push_back("a".into()).await;
        assert_eq!(q.len(), 1);
        q.pop_timeout(Duration::from_millis(10)).await;
        assert!(q.is_empty());
    }
}
