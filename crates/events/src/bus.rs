//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus distributes events **after** the state change they describe has been
//! committed. It is never the system of record.
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: an envelope may be delivered more than once (publisher
//!   retries, broker redelivery). Consumers de-duplicate on the envelope key and
//!   sequence number.
//! - **Per-key ordering**: implementations must preserve publish order for
//!   envelopes sharing a key. Nothing is promised across keys.
//! - **No persistence assumptions**: in-memory channels, Redis Streams and real
//!   brokers all fit behind the same trait.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

/// A subscription to an event stream.
///
/// Each subscription gets a copy of every message published after it was
/// created (broadcast semantics). Messages arrive in publish order.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Take a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<M> {
        let mut out = Vec::new();
        while let Ok(m) = self.receiver.try_recv() {
            out.push(m);
        }
        out
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// ```text
/// Coordinator → Invoice Store (commit) → Event Bus (publish) → Consumers
/// ```
///
/// `publish()` resolves once the transport has acknowledged the message (or
/// failed). Failures are surfaced to the caller; the committed state is
/// unaffected, so republishing is always safe.
#[async_trait]
pub trait EventBus<M>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

#[async_trait]
impl<M, B> EventBus<M> for Arc<B>
where
    M: Send + 'static,
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    async fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message).await
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
