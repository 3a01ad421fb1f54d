//! Post-commit event publication.
//!
//! Every committed transition produces exactly one [`InvoiceTransitioned`]
//! envelope keyed by invoice id and sequenced by the committed version.
//!
//! ## Ordering
//!
//! Each invoice key gets a FIFO lane: an unbounded queue drained by one
//! detached worker task. Different keys never wait on each other. A lane worker
//! exits after sitting idle and is recreated on the next enqueue.
//!
//! Enqueue order is not commit order: a writer whose commit is acknowledged
//! late can be overtaken by a writer that already saw its version. The
//! coordinator therefore takes a [`PublishSlot`] *before* its conditional
//! update and fills it after commit. The lane holds everything behind an
//! unfilled slot, so envelopes leave in commit order. A slot dropped without
//! a commit is skipped; one left unfilled past `SLOT_HOLD_TIMEOUT` is skipped
//! with a warning and its envelope, if it ever arrives, goes out of turn.
//!
//! ## Cancellation
//!
//! Publishing runs on the lane worker, not on the caller's future. A caller that
//! is cancelled after commit only loses the acknowledgement; the envelope still
//! goes out.
//!
//! ## Delivery
//!
//! At-least-once within the retry budget. Once the budget is spent the failure
//! is reported (terminal transitions) or logged (non-terminal ones) and the
//! envelope is dropped; the committed state is never touched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, instrument, warn};

use payrecon_events::{EventBus, EventEnvelope};
use payrecon_invoicing::{InvoiceTransitioned, TransitionRecord};

/// The unit handed to the broker.
pub type InvoiceEnvelope = EventEnvelope<InvoiceTransitioned>;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(200);
const LANE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const SLOT_HOLD_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry budget for one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    /// Linear: attempt `n` waits `n * retry_backoff` before the next try.
    pub retry_backoff: Duration,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl PublishPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("publish of {key} v{sequence} timed out after {attempts} attempt(s)")]
    Timeout {
        key: String,
        sequence: u64,
        attempts: u32,
    },

    #[error("broker rejected {key} v{sequence} after {attempts} attempt(s): {message}")]
    Broker {
        key: String,
        sequence: u64,
        attempts: u32,
        message: String,
    },

    /// The lane worker went away before reporting back (runtime shutdown).
    #[error("publish lane for {key} closed before acknowledging")]
    LaneClosed { key: String },
}

struct Job {
    envelope: InvoiceEnvelope,
    ack: Option<oneshot::Sender<Result<(), PublishError>>>,
}

enum Entry {
    Ready(Job),
    /// Placeholder taken before a commit; the lane waits for it to be filled.
    Reserved(oneshot::Receiver<Job>),
}

type Lanes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Entry>>>>;

/// Publishes transition events through per-invoice FIFO lanes.
pub struct EventPublisher<B> {
    bus: Arc<B>,
    policy: PublishPolicy,
    lanes: Lanes,
}

impl<B> Clone for EventPublisher<B> {
    fn clone(&self) -> Self {
        Self {
            bus: Arc::clone(&self.bus),
            policy: self.policy,
            lanes: Arc::clone(&self.lanes),
        }
    }
}

impl<B> EventPublisher<B>
where
    B: EventBus<InvoiceEnvelope> + 'static,
{
    pub fn new(bus: B, policy: PublishPolicy) -> Self {
        Self::from_arc(Arc::new(bus), policy)
    }

    pub fn from_arc(bus: Arc<B>, policy: PublishPolicy) -> Self {
        Self {
            bus,
            policy,
            lanes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    pub fn policy(&self) -> PublishPolicy {
        self.policy
    }

    /// Publish the event for a committed transition at the back of its lane.
    ///
    /// Terminal transitions wait for the broker acknowledgement (bounded by the
    /// retry budget). Non-terminal transitions are enqueued and return at once.
    pub async fn publish(&self, record: &TransitionRecord) -> Result<(), PublishError> {
        self.reserve(record.invoice_id.as_str()).publish(record).await
    }

    /// Take the next place in `key`'s lane ahead of a commit.
    ///
    /// Everything enqueued for `key` afterwards waits until the slot is filled
    /// with [`PublishSlot::publish`] or dropped.
    pub fn reserve(&self, key: &str) -> PublishSlot<B> {
        let (filler, slot) = oneshot::channel();
        self.push(key.to_string(), Entry::Reserved(slot));
        PublishSlot {
            publisher: self.clone(),
            key: key.to_string(),
            filler,
        }
    }

    fn push(&self, key: String, mut entry: Entry) {
        // Sends happen under the lanes lock so a worker retiring its lane
        // (which also takes the lock) can never strand an entry.
        let mut lanes = match self.lanes.lock() {
            Ok(lanes) => lanes,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(sender) = lanes.get(&key) {
            match sender.send(entry) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => entry = returned,
            }
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        // A fresh receiver is alive, so this send cannot fail.
        let _ = sender.send(entry);
        lanes.insert(key.clone(), sender);
        drop(lanes);

        tokio::spawn(run_lane(
            key,
            receiver,
            Arc::clone(&self.bus),
            self.policy,
            Arc::clone(&self.lanes),
        ));
    }

    /// Number of lanes with a live worker.
    pub fn active_lanes(&self) -> usize {
        self.lanes.lock().map(|lanes| lanes.len()).unwrap_or(0)
    }
}

/// A reserved place in one invoice's publish lane.
///
/// Dropping it without publishing releases the place.
pub struct PublishSlot<B> {
    publisher: EventPublisher<B>,
    key: String,
    filler: oneshot::Sender<Job>,
}

impl<B> PublishSlot<B>
where
    B: EventBus<InvoiceEnvelope> + 'static,
{
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Fill the slot with the committed transition's event.
    ///
    /// Waits like [`EventPublisher::publish`]: terminal transitions until the
    /// broker answers, others not at all.
    #[instrument(
        skip(self, record),
        fields(invoice_id = %record.invoice_id, to_status = %record.to_status, version = record.version)
    )]
    pub async fn publish(self, record: &TransitionRecord) -> Result<(), PublishError> {
        let envelope = InvoiceTransitioned::envelope(record);
        if record.is_terminal() {
            let key = self.key.clone();
            let (tx, rx) = oneshot::channel();
            self.fill(Job {
                envelope,
                ack: Some(tx),
            });
            rx.await
                .unwrap_or_else(|_| Err(PublishError::LaneClosed { key }))
        } else {
            self.fill(Job { envelope, ack: None });
            Ok(())
        }
    }

    fn fill(self, job: Job) {
        let PublishSlot {
            publisher,
            key,
            filler,
        } = self;
        if let Err(job) = filler.send(job) {
            warn!(
                invoice_id = %key,
                sequence = job.envelope.sequence_number(),
                "publish slot expired before commit finished; publishing out of turn"
            );
            publisher.push(key, Entry::Ready(job));
        }
    }
}

async fn run_lane<B>(
    key: String,
    mut receiver: mpsc::UnboundedReceiver<Entry>,
    bus: Arc<B>,
    policy: PublishPolicy,
    lanes: Lanes,
) where
    B: EventBus<InvoiceEnvelope> + 'static,
{
    loop {
        let entry = match tokio::time::timeout(LANE_IDLE_TIMEOUT, receiver.recv()).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return,
            Err(_) => {
                let mut lanes = match lanes.lock() {
                    Ok(lanes) => lanes,
                    Err(poisoned) => poisoned.into_inner(),
                };
                match receiver.try_recv() {
                    Ok(entry) => entry,
                    Err(_) => {
                        lanes.remove(&key);
                        debug!(key = %key, "publish lane retired");
                        return;
                    }
                }
            }
        };

        let job = match entry {
            Entry::Ready(job) => job,
            Entry::Reserved(slot) => match tokio::time::timeout(SLOT_HOLD_TIMEOUT, slot).await {
                Ok(Ok(job)) => job,
                Ok(Err(_)) => {
                    debug!(key = %key, "publish slot released without a commit");
                    continue;
                }
                Err(_) => {
                    warn!(key = %key, "publish slot not filled in time; moving on");
                    continue;
                }
            },
        };

        let result = deliver(bus.as_ref(), &policy, &job.envelope).await;
        if let Err(err) = &result {
            error!(
                invoice_id = %job.envelope.key(),
                to_status = %job.envelope.payload().to_status,
                sequence = job.envelope.sequence_number(),
                error = %err,
                "event publication failed"
            );
        }
        if let Some(ack) = job.ack {
            // Caller may have gone away; the outcome is already logged.
            let _ = ack.send(result);
        }
    }
}

async fn deliver<B>(bus: &B, policy: &PublishPolicy, envelope: &InvoiceEnvelope) -> Result<(), PublishError>
where
    B: EventBus<InvoiceEnvelope>,
{
    let key = envelope.key().to_string();
    let sequence = envelope.sequence_number();
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match tokio::time::timeout(policy.attempt_timeout, bus.publish(envelope.clone())).await {
            Ok(Ok(())) => {
                debug!(invoice_id = %key, sequence, attempt, "event published");
                return Ok(());
            }
            Ok(Err(err)) => {
                warn!(invoice_id = %key, sequence, attempt, error = %err, "publish attempt failed");
                last_error = Some(PublishError::Broker {
                    key: key.clone(),
                    sequence,
                    attempts: attempt,
                    message: err.to_string(),
                });
            }
            Err(_) => {
                warn!(invoice_id = %key, sequence, attempt, "publish attempt timed out");
                last_error = Some(PublishError::Timeout {
                    key: key.clone(),
                    sequence,
                    attempts: attempt,
                });
            }
        }

        if attempt < attempts {
            tokio::time::sleep(policy.retry_backoff * attempt).await;
        }
    }

    Err(last_error.unwrap_or(PublishError::Timeout {
        key,
        sequence,
        attempts,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use payrecon_events::{InMemoryEventBus, Subscription};
    use payrecon_invoicing::{InvoiceStatus, SignalSource};

    fn record(id: &str, from: InvoiceStatus, to: InvoiceStatus, version: u64) -> TransitionRecord {
        TransitionRecord {
            invoice_id: id.parse().unwrap(),
            from_status: from,
            to_status: to,
            source: SignalSource::gateway("vnpay"),
            source_reference: None,
            reason: String::new(),
            applied_at: Utc::now(),
            version,
            order_reference: None,
        }
    }

    fn publisher(bus: Arc<InMemoryEventBus<InvoiceEnvelope>>) -> EventPublisher<InMemoryEventBus<InvoiceEnvelope>> {
        EventPublisher::from_arc(bus, PublishPolicy::default())
    }

    #[tokio::test]
    async fn terminal_publish_waits_for_broker() {
        let bus = Arc::new(InMemoryEventBus::new());
        let publisher = publisher(Arc::clone(&bus));

        publisher
            .publish(&record("inv-1", InvoiceStatus::Pending, InvoiceStatus::Paid, 2))
            .await
            .unwrap();

        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key(), "inv-1");
        assert_eq!(published[0].sequence_number(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_publish_retries_then_succeeds() {
        let bus = Arc::new(InMemoryEventBus::new());
        bus.fail_next(2);
        let publisher = publisher(Arc::clone(&bus));

        publisher
            .publish(&record("inv-1", InvoiceStatus::Pending, InvoiceStatus::Failed, 2))
            .await
            .unwrap();
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_surfaces_broker_error() {
        let bus = Arc::new(InMemoryEventBus::new());
        bus.fail_next(3);
        let publisher = publisher(Arc::clone(&bus));

        let err = publisher
            .publish(&record("inv-1", InvoiceStatus::Pending, InvoiceStatus::Paid, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Broker { attempts: 3, .. }));
        assert!(bus.published().is_empty());
    }

    struct StalledBus;

    #[async_trait]
    impl EventBus<InvoiceEnvelope> for StalledBus {
        type Error = std::io::Error;

        async fn publish(&self, _message: InvoiceEnvelope) -> Result<(), Self::Error> {
            std::future::pending().await
        }

        fn subscribe(&self) -> Subscription<InvoiceEnvelope> {
            let (_tx, rx) = mpsc::unbounded_channel();
            Subscription::new(rx)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_broker_times_out_per_attempt() {
        let publisher = EventPublisher::new(StalledBus, PublishPolicy::default().with_max_attempts(2));

        let err = publisher
            .publish(&record("inv-1", InvoiceStatus::Pending, InvoiceStatus::Paid, 2))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PublishError::Timeout {
                key: "inv-1".to_string(),
                sequence: 2,
                attempts: 2
            }
        );
    }

    #[tokio::test]
    async fn one_key_is_delivered_in_enqueue_order() {
        let bus = Arc::new(InMemoryEventBus::new());
        let mut sub = bus.subscribe();
        let publisher = publisher(Arc::clone(&bus));

        publisher
            .publish(&record("inv-1", InvoiceStatus::Pending, InvoiceStatus::AwaitingConfirmation, 2))
            .await
            .unwrap();
        publisher
            .publish(&record("inv-1", InvoiceStatus::AwaitingConfirmation, InvoiceStatus::Paid, 3))
            .await
            .unwrap();

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first.sequence_number(), 2);
        assert_eq!(second.sequence_number(), 3);
    }

    #[tokio::test]
    async fn reserved_slot_holds_back_a_later_commit() {
        let bus = Arc::new(InMemoryEventBus::new());
        let mut sub = bus.subscribe();
        let publisher = publisher(Arc::clone(&bus));

        // The first writer reserves before its commit, the second commits on top of it
        // and finishes first.
        let slot = publisher.reserve("inv-1");
        let later = {
            let publisher = publisher.clone();
            tokio::spawn(async move {
                publisher
                    .publish(&record("inv-1", InvoiceStatus::AwaitingConfirmation, InvoiceStatus::Paid, 3))
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(bus.published().is_empty());

        slot.publish(&record("inv-1", InvoiceStatus::Pending, InvoiceStatus::AwaitingConfirmation, 2))
            .await
            .unwrap();
        later.await.unwrap().unwrap();

        assert_eq!(sub.recv().await.unwrap().sequence_number(), 2);
        assert_eq!(sub.recv().await.unwrap().sequence_number(), 3);
    }

    #[tokio::test]
    async fn dropped_slot_releases_the_lane() {
        let bus = Arc::new(InMemoryEventBus::new());
        let publisher = publisher(Arc::clone(&bus));

        let slot = publisher.reserve("inv-1");
        assert_eq!(slot.key(), "inv-1");
        drop(slot);

        publisher
            .publish(&record("inv-1", InvoiceStatus::Pending, InvoiceStatus::Paid, 2))
            .await
            .unwrap();
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_slot_stops_holding_after_timeout() {
        let bus = Arc::new(InMemoryEventBus::new());
        let mut sub = bus.subscribe();
        let publisher = publisher(Arc::clone(&bus));

        let slot = publisher.reserve("inv-1");
        let started = tokio::time::Instant::now();
        publisher
            .publish(&record("inv-1", InvoiceStatus::AwaitingConfirmation, InvoiceStatus::Paid, 3))
            .await
            .unwrap();
        assert!(started.elapsed() >= SLOT_HOLD_TIMEOUT);

        // A fill that shows up afterwards is still delivered, out of turn.
        slot.publish(&record("inv-1", InvoiceStatus::Pending, InvoiceStatus::AwaitingConfirmation, 2))
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap().sequence_number(), 3);
        assert_eq!(sub.recv().await.unwrap().sequence_number(), 2);
    }

    #[tokio::test]
    async fn non_terminal_publish_survives_dropped_caller() {
        let bus = Arc::new(InMemoryEventBus::new());
        let mut sub = bus.subscribe();
        let publisher = publisher(Arc::clone(&bus));

        // Enqueue happens on the first poll; dropping afterwards changes nothing.
        let rec = record("inv-7", InvoiceStatus::Pending, InvoiceStatus::AwaitingConfirmation, 2);
        let fut = publisher.publish(&rec);
        let _ = tokio::time::timeout(Duration::ZERO, fut).await;

        let delivered = sub.recv().await.unwrap();
        assert_eq!(delivered.key(), "inv-7");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_lanes_are_retired() {
        let bus = Arc::new(InMemoryEventBus::new());
        let publisher = publisher(Arc::clone(&bus));

        publisher
            .publish(&record("inv-1", InvoiceStatus::Pending, InvoiceStatus::Paid, 2))
            .await
            .unwrap();
        assert_eq!(publisher.active_lanes(), 1);

        tokio::time::sleep(LANE_IDLE_TIMEOUT + Duration::from_secs(1)).await;
        assert_eq!(publisher.active_lanes(), 0);
    }
}
