//! Reconciliation pipeline: the single writer path for invoice status.
//!
//! ```text
//! TransitionRequest
//!   ↓
//! 1. Load invoice (NotFound is returned, never retried)
//!   ↓
//! 2. Decide (pure state machine: transition | no-op | reject)
//!   ↓
//! 3. Reserve a publish slot, then conditional update at the loaded version
//!   ↓  VersionConflict → release the slot, back to 1, up to `max_attempts`
//! 4. Cancel the expiry timer (terminal only)
//!   ↓
//! 5. Fill the publish slot (after commit, never rolled back)
//! ```
//!
//! Every signal source (gateway callbacks, staff entry, the expiry watcher)
//! funnels through [`Coordinator::apply`]. Optimistic concurrency on the invoice
//! version is the only mutual exclusion; there are no locks held across sources.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use payrecon_core::{AggregateRoot, Clock, ExpectedVersion, InvoiceId, SystemClock};
use payrecon_events::EventBus;
use payrecon_invoicing::{
    Decision, Invoice, NoOpReason, RejectionReason, TransitionRecord, TransitionRequest, decide,
};

use crate::expiry::TimerRegistry;
use crate::invoice_store::{InvoiceStore, StoreError};
use crate::publisher::{EventPublisher, InvoiceEnvelope, PublishError, PublishSlot};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Result of a request that reached the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The transition was committed and its event published.
    Applied {
        invoice: Invoice,
        record: TransitionRecord,
    },
    /// Idempotent replay; nothing written, nothing published.
    Acknowledged(NoOpReason),
    /// The state machine refused the request; the invoice is untouched.
    Rejected(RejectionReason),
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }

    pub fn record(&self) -> Option<&TransitionRecord> {
        match self {
            ApplyOutcome::Applied { record, .. } => Some(record),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invoice {0} not found")]
    NotFound(InvoiceId),

    /// Every attempt lost the version race. Safe to retry later.
    #[error("invoice {invoice_id} still contended after {attempts} attempt(s)")]
    Contention { invoice_id: InvoiceId, attempts: u32 },

    /// The transition is committed but its event did not go out.
    #[error(
        "transition of invoice {} to {} committed but not published: {source}",
        .record.invoice_id,
        .record.to_status
    )]
    Publish {
        invoice: Box<Invoice>,
        record: Box<TransitionRecord>,
        #[source]
        source: PublishError,
    },

    /// The caller's deadline passed before commit; nothing was written.
    #[error("deadline exceeded before invoice {0} was committed")]
    DeadlineExceeded(InvoiceId),

    #[error(transparent)]
    Store(StoreError),
}

impl ReconcileError {
    /// The committed record, if the failure happened after commit.
    pub fn committed_record(&self) -> Option<&TransitionRecord> {
        match self {
            ReconcileError::Publish { record, .. } => Some(record),
            _ => None,
        }
    }
}

impl From<StoreError> for ReconcileError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(id) => ReconcileError::NotFound(id),
            other => ReconcileError::Store(other),
        }
    }
}

/// How an inbound adapter should answer the signal's sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayAck {
    /// Stop redelivering: applied, replayed, or overtaken by the settled outcome.
    Success,
    /// The signal contradicts the invoice, live or settled.
    ClientError,
    /// Try again later.
    Retryable,
    NotFound,
}

impl GatewayAck {
    pub fn from_result(result: &Result<ApplyOutcome, ReconcileError>) -> Self {
        match result {
            Ok(outcome) => Self::from_outcome(outcome),
            Err(err) => Self::from_reconcile_error(err),
        }
    }

    pub fn from_outcome(outcome: &ApplyOutcome) -> Self {
        match outcome {
            ApplyOutcome::Applied { .. } | ApplyOutcome::Acknowledged(_) => GatewayAck::Success,
            ApplyOutcome::Rejected(reason) if reason.is_superseded() => GatewayAck::Success,
            ApplyOutcome::Rejected(_) => GatewayAck::ClientError,
        }
    }

    pub fn from_reconcile_error(err: &ReconcileError) -> Self {
        match err {
            ReconcileError::Publish { .. } => GatewayAck::Success,
            ReconcileError::NotFound(_) => GatewayAck::NotFound,
            ReconcileError::Contention { .. }
            | ReconcileError::DeadlineExceeded(_)
            | ReconcileError::Store(_) => GatewayAck::Retryable,
        }
    }

    /// Conventional HTTP status for webhook responses.
    pub fn http_status(self) -> u16 {
        match self {
            GatewayAck::Success => 200,
            GatewayAck::ClientError => 409,
            GatewayAck::Retryable => 503,
            GatewayAck::NotFound => 404,
        }
    }
}

/// Reconciliation coordinator.
///
/// `S` is the invoice store and `B` the broker behind the event publisher; both
/// are traits so tests run against in-memory versions.
pub struct Coordinator<S, B> {
    store: S,
    publisher: EventPublisher<B>,
    clock: Arc<dyn Clock>,
    timers: TimerRegistry,
    max_attempts: u32,
}

impl<S, B> Coordinator<S, B>
where
    S: InvoiceStore,
    B: EventBus<InvoiceEnvelope> + 'static,
{
    pub fn new(store: S, publisher: EventPublisher<B>) -> Self {
        Self {
            store,
            publisher,
            clock: Arc::new(SystemClock),
            timers: TimerRegistry::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share a timer arena with the expiry watcher so terminal commits can
    /// disarm pending timers.
    pub fn with_timers(mut self, timers: TimerRegistry) -> Self {
        self.timers = timers;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn publisher(&self) -> &EventPublisher<B> {
        &self.publisher
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    /// Reconcile one request without a deadline.
    pub async fn apply(&self, request: TransitionRequest) -> Result<ApplyOutcome, ReconcileError> {
        self.run(request, None).await
    }

    /// Reconcile one request; load and conditional update must finish by `deadline`.
    ///
    /// Hitting the deadline before commit drops the in-flight store call and
    /// returns [`ReconcileError::DeadlineExceeded`] with nothing written. The
    /// post-commit publish is bounded by the publisher's own retry budget instead.
    pub async fn apply_with_deadline(
        &self,
        request: TransitionRequest,
        deadline: Instant,
    ) -> Result<ApplyOutcome, ReconcileError> {
        self.run(request, Some(deadline)).await
    }

    #[instrument(
        skip(self, request, deadline),
        fields(
            invoice_id = %request.invoice_id,
            requested = %request.requested_outcome,
            source = %request.source
        )
    )]
    async fn run(
        &self,
        request: TransitionRequest,
        deadline: Option<Instant>,
    ) -> Result<ApplyOutcome, ReconcileError> {
        let invoice_id = request.invoice_id.clone();

        for attempt in 1..=self.max_attempts {
            let invoice = bounded(deadline, &invoice_id, self.store.load(&invoice_id)).await?;

            if let Some(observed) = request.observed_version {
                if observed != invoice.version() {
                    debug!(observed, current = invoice.version(), "stale observed version; re-evaluating");
                }
            }

            let plan = match decide(&invoice, &request, self.clock.now()) {
                Decision::Transition(plan) => plan,
                Decision::NoOp(reason) => {
                    debug!(status = %invoice.status(), ?reason, "request acknowledged without change");
                    return Ok(ApplyOutcome::Acknowledged(reason));
                }
                Decision::Reject(reason) => {
                    info!(status = %invoice.status(), %reason, "transition rejected");
                    return Ok(ApplyOutcome::Rejected(reason));
                }
            };

            // Taken before the write so the event keeps its place in commit order.
            let slot = self.publisher.reserve(invoice_id.as_str());
            let committed = bounded(
                deadline,
                &invoice_id,
                self.store.conditional_update(
                    &invoice_id,
                    ExpectedVersion::Exact(plan.expected_version),
                    &plan.change,
                    &plan.record,
                ),
            )
            .await;

            match committed {
                Ok(new_version) => {
                    let mut invoice = invoice;
                    invoice.apply_change(&plan.change);
                    debug_assert_eq!(invoice.version(), new_version);
                    let mut record = plan.record;
                    record.version = new_version;
                    return self.after_commit(invoice, record, slot).await;
                }
                Err(ReconcileError::Store(err)) if err.is_version_conflict() => {
                    debug!(attempt, error = %err, "version conflict; reloading");
                }
                Err(err) => return Err(err),
            }
        }

        warn!(attempts = self.max_attempts, "giving up on contended invoice");
        Err(ReconcileError::Contention {
            invoice_id,
            attempts: self.max_attempts,
        })
    }

    async fn after_commit(
        &self,
        invoice: Invoice,
        record: TransitionRecord,
        slot: PublishSlot<B>,
    ) -> Result<ApplyOutcome, ReconcileError> {
        info!(
            from_status = %record.from_status,
            to_status = %record.to_status,
            version = record.version,
            "transition committed"
        );

        if record.is_terminal() && self.timers.cancel(&record.invoice_id) {
            debug!("expiry timer disarmed");
        }

        match slot.publish(&record).await {
            Ok(()) => Ok(ApplyOutcome::Applied { invoice, record }),
            Err(source) => {
                error!(
                    to_status = %record.to_status,
                    error = %source,
                    "committed transition was not published"
                );
                Err(ReconcileError::Publish {
                    invoice: Box::new(invoice),
                    record: Box::new(record),
                    source,
                })
            }
        }
    }
}

async fn bounded<T, F>(
    deadline: Option<Instant>,
    invoice_id: &InvoiceId,
    fut: F,
) -> Result<T, ReconcileError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match deadline {
        None => fut.await.map_err(ReconcileError::from),
        Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result.map_err(ReconcileError::from),
            Err(_) => {
                warn!("deadline exceeded before commit");
                Err(ReconcileError::DeadlineExceeded(invoice_id.clone()))
            }
        },
    }
}
