//! In-memory event bus for tests/dev.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("in-memory bus lock poisoned")]
    Poisoned,

    /// Failure requested through [`InMemoryEventBus::fail_next`].
    #[error("injected publish failure")]
    Injected,
}

/// In-memory pub/sub bus.
///
/// - No IO
/// - Fan-out to every live subscriber, in publish order
/// - Keeps a log of everything accepted so tests can assert on it
/// - Can be told to reject the next N publishes
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<M>>>,
    published: Mutex<Vec<M>>,
    fail_next: AtomicU32,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` publishes fail with [`InMemoryBusError::Injected`].
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl<M: Clone> InMemoryEventBus<M> {
    /// Every message accepted so far, in publish order.
    pub fn published(&self) -> Vec<M> {
        self.published
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            fail_next: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + Sync + 'static,
{
    type Error = InMemoryBusError;

    async fn publish(&self, message: M) -> Result<(), Self::Error> {
        if self.take_injected_failure() {
            return Err(InMemoryBusError::Injected);
        }

        {
            let mut subs = self
                .subscribers
                .lock()
                .map_err(|_| InMemoryBusError::Poisoned)?;
            // Drop any dead subscribers while publishing.
            subs.retain(|tx| tx.send(message.clone()).is_ok());
        }

        self.published
            .lock()
            .map_err(|_| InMemoryBusError::Poisoned)?
            .push(message);

        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::unbounded_channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_in_publish_order() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::new();
        let mut sub = bus.subscribe();

        for n in 1..=3 {
            bus.publish(n).await.unwrap();
        }

        assert_eq!(sub.drain(), vec![1, 2, 3]);
        assert_eq!(bus.published(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_one_per_publish() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::new();
        bus.fail_next(2);

        assert_eq!(bus.publish(1).await, Err(InMemoryBusError::Injected));
        assert_eq!(bus.publish(2).await, Err(InMemoryBusError::Injected));
        assert_eq!(bus.publish(3).await, Ok(()));
        assert_eq!(bus.published(), vec![3]);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::new();
        let sub = bus.subscribe();
        drop(sub);

        bus.publish(7).await.unwrap();
        assert_eq!(bus.subscribers.lock().unwrap().len(), 0);
    }
}
