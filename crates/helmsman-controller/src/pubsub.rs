// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process publish/subscribe topic.
//!
//! Every subscriber owns an unbounded queue, so a slow subscriber never
//! blocks the publisher or its peers. Subscriptions are removed explicitly
//! with [`Subscription::unsubscribe`] or when dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

struct Subscribers<T> {
    next_id: u64,
    senders: HashMap<u64, mpsc::UnboundedSender<T>>,
}

/// A fan-out topic. Clones share the same subscriber set.
pub struct Topic<T> {
    inner: Arc<Mutex<Subscribers<T>>>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Topic<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Subscribers {
                next_id: 0,
                senders: HashMap::new(),
            })),
        }
    }
}

impl<T: Clone + Send + 'static> Topic<T> {
    /// A topic with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new subscriber. It sees only messages published from now on.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.lock();
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.senders.insert(id, tx);
        Subscription {
            id,
            receiver: rx,
            topic: self.clone(),
        }
    }

    /// Deliver `message` to every subscriber, returning how many received it.
    pub fn publish(&self, message: T) -> usize {
        let mut subscribers = self.lock();
        subscribers
            .senders
            .retain(|_, sender| sender.send(message.clone()).is_ok());
        subscribers.senders.len()
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.lock().senders.len()
    }

    fn remove(&self, id: u64) {
        self.lock().senders.remove(&id);
    }
}

/// A subscriber's queue.
pub struct Subscription<T: Clone + Send + 'static> {
    id: u64,
    receiver: mpsc::UnboundedReceiver<T>,
    topic: Topic<T>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    /// Identifier unique within the topic.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next message.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Stop receiving. Queued messages are discarded.
    pub fn unsubscribe(self) {}
}

impl<T: Clone + Send + 'static> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.topic.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_each_subscriber_gets_every_message() {
        let topic = Topic::new();
        let mut a = topic.subscribe();
        let mut b = topic.subscribe();
        assert_ne!(a.id(), b.id());

        assert_eq!(topic.publish(1), 2);
        assert_eq!(topic.publish(2), 2);
        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_subscriber() {
        let topic = Topic::new();
        let a = topic.subscribe();
        let mut b = topic.subscribe();
        a.unsubscribe();
        assert_eq!(topic.subscriber_count(), 1);
        assert_eq!(topic.publish("x"), 1);
        assert_eq!(b.recv().await, Some("x"));
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_messages() {
        let topic = Topic::new();
        topic.publish(1);
        let mut late = topic.subscribe();
        topic.publish(2);
        assert_eq!(late.recv().await, Some(2));
    }
}
