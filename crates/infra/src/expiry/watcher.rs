use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use payrecon_core::InvoiceId;
use payrecon_events::EventBus;
use payrecon_invoicing::{Invoice, RequestedOutcome, SignalSource, TransitionRequest};

use crate::coordinator::{ApplyOutcome, Coordinator, ReconcileError};
use crate::invoice_store::{InvoiceStore, StoreError};
use crate::publisher::InvoiceEnvelope;

use super::registry::TimerRegistry;

pub const EXPIRY_REASON: &str = "payment window expired";
pub const DEFAULT_PROCESSING_DEADLINE: Duration = Duration::from_secs(30);

/// Turns `expires_at` into a `failed` request through the coordinator.
///
/// Each open invoice gets a one-shot tokio timer in a [`TimerRegistry`] shared
/// with the coordinator, which disarms it on terminal commits. A timer that
/// fires for an invoice that already settled is rejected by the state machine,
/// so disarming is never needed for correctness.
pub struct ExpiryWatcher<S, B> {
    coordinator: Arc<Coordinator<S, B>>,
    timers: TimerRegistry,
    processing_deadline: Duration,
}

impl<S, B> Clone for ExpiryWatcher<S, B> {
    fn clone(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
            timers: self.timers.clone(),
            processing_deadline: self.processing_deadline,
        }
    }
}

impl<S, B> ExpiryWatcher<S, B>
where
    S: InvoiceStore + 'static,
    B: EventBus<InvoiceEnvelope> + 'static,
{
    pub fn new(coordinator: Arc<Coordinator<S, B>>) -> Self {
        let timers = coordinator.timers().clone();
        Self {
            coordinator,
            timers,
            processing_deadline: DEFAULT_PROCESSING_DEADLINE,
        }
    }

    pub fn with_processing_deadline(mut self, deadline: Duration) -> Self {
        self.processing_deadline = deadline;
        self
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    /// Arm a one-shot timer for `expires_at`, replacing any earlier one.
    ///
    /// The timer re-reads the clock when it wakes and sleeps again if it woke
    /// early, so it never fires before `expires_at`.
    pub fn schedule(&self, invoice_id: InvoiceId, expires_at: DateTime<Utc>) {
        let generation = self.timers.next_generation();
        let watcher = self.clone();
        let id = invoice_id.clone();

        let handle = tokio::spawn(async move {
            loop {
                let remaining = expires_at - watcher.coordinator.clock().now();
                match remaining.to_std() {
                    Ok(wait) if !wait.is_zero() => tokio::time::sleep(wait).await,
                    _ => break,
                }
            }
            watcher.timers.release(&id, generation);
            // Outcome is logged inside `expire`.
            let _ = watcher.expire(id).await;
        });

        self.timers.insert(invoice_id, generation, handle);
    }

    /// Arm the invoice's timer unless it is already terminal.
    pub fn schedule_invoice(&self, invoice: &Invoice) -> bool {
        if invoice.is_terminal() {
            return false;
        }
        self.schedule(invoice.invoice_id().clone(), invoice.expires_at());
        true
    }

    pub fn cancel(&self, invoice_id: &InvoiceId) -> bool {
        self.timers.cancel(invoice_id)
    }

    /// Re-arm timers for every open invoice (startup after a restart).
    #[instrument(skip(self), err)]
    pub async fn rearm(&self) -> Result<usize, StoreError> {
        let open = self.coordinator.store().list_open().await?;
        let armed = open
            .iter()
            .filter(|invoice| self.schedule_invoice(invoice))
            .count();
        info!(armed, "expiry timers re-armed");
        Ok(armed)
    }

    /// Submit the expiry request for one invoice, bounded by the processing deadline.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn expire(&self, invoice_id: InvoiceId) -> Result<ApplyOutcome, ReconcileError> {
        let request = TransitionRequest::new(
            invoice_id,
            RequestedOutcome::Failed,
            SignalSource::ExpiryWatcher,
        )
        .with_reason(EXPIRY_REASON);

        let deadline = tokio::time::Instant::now() + self.processing_deadline;
        let result = self.coordinator.apply_with_deadline(request, deadline).await;

        match &result {
            Ok(ApplyOutcome::Applied { record, .. }) => {
                info!(from_status = %record.from_status, "invoice expired");
            }
            Ok(ApplyOutcome::Rejected(reason)) => {
                debug!(%reason, "expiry ignored; invoice already settled");
            }
            Ok(ApplyOutcome::Acknowledged(_)) => debug!("expiry already applied"),
            Err(err) => warn!(error = %err, "expiry could not be applied"),
        }
        result
    }

    /// Abort every pending timer.
    pub fn shutdown(&self) {
        self.timers.clear();
    }
}
