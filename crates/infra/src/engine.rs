//! Reconciliation engine facade.
//!
//! Wires the coordinator and the expiry watcher together and exposes the
//! operations an inbound layer needs: open an invoice, feed it signals, read it back.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use payrecon_core::{CustomerId, DomainError, InvoiceId};
use payrecon_events::EventBus;
use payrecon_invoicing::{
    DEFAULT_EXPIRY_WINDOW_MINUTES, Invoice, InvoiceStatus, NewInvoice, TransitionRecord,
    TransitionRequest,
};

use crate::callback::{CallbackError, CallbackTarget, PaymentCallback};
use crate::config::ReconcileConfig;
use crate::coordinator::{ApplyOutcome, Coordinator, GatewayAck, ReconcileError};
use crate::expiry::ExpiryWatcher;
use crate::invoice_store::{InvoiceStore, StoreError};
use crate::publisher::{EventPublisher, InvoiceEnvelope};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error(transparent)]
    Invalid(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a payment callback did not reach the coordinator, or what it hit there.
#[derive(Debug, Error)]
pub enum CallbackFailure {
    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error("no invoice carries gateway reference '{0}'")]
    UnknownReference(String),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl GatewayAck {
    pub fn from_callback_result(result: &Result<ApplyOutcome, CallbackFailure>) -> Self {
        match result {
            Ok(outcome) => GatewayAck::from_outcome(outcome),
            Err(CallbackFailure::Callback(_)) => GatewayAck::ClientError,
            Err(CallbackFailure::UnknownReference(_)) => GatewayAck::NotFound,
            Err(CallbackFailure::Reconcile(err)) => GatewayAck::from_reconcile_error(err),
        }
    }
}

pub struct ReconciliationEngine<S, B> {
    coordinator: Arc<Coordinator<S, B>>,
    watcher: ExpiryWatcher<S, B>,
    expiry_window: chrono::Duration,
}

impl<S, B> ReconciliationEngine<S, B>
where
    S: InvoiceStore + 'static,
    B: EventBus<InvoiceEnvelope> + 'static,
{
    pub fn new(coordinator: Coordinator<S, B>) -> Self {
        let coordinator = Arc::new(coordinator);
        Self {
            watcher: ExpiryWatcher::new(Arc::clone(&coordinator)),
            coordinator,
            expiry_window: chrono::Duration::minutes(DEFAULT_EXPIRY_WINDOW_MINUTES),
        }
    }

    /// Build store, publisher and timers from configuration.
    pub fn from_config(store: S, bus: B, config: &ReconcileConfig) -> Self {
        let publisher = EventPublisher::new(bus, config.publish_policy());
        let coordinator =
            Coordinator::new(store, publisher).with_max_attempts(config.max_attempts);
        Self::new(coordinator)
            .with_expiry_window(config.expiry_window())
            .with_expiry_deadline(config.expiry_deadline)
    }

    pub fn with_expiry_window(mut self, window: chrono::Duration) -> Self {
        self.expiry_window = window;
        self
    }

    /// Bound on one expiry's load-and-commit.
    pub fn with_expiry_deadline(mut self, deadline: Duration) -> Self {
        self.watcher = self.watcher.with_processing_deadline(deadline);
        self
    }

    pub fn coordinator(&self) -> &Arc<Coordinator<S, B>> {
        &self.coordinator
    }

    pub fn watcher(&self) -> &ExpiryWatcher<S, B> {
        &self.watcher
    }

    /// Persist a new `pending` invoice and arm its expiry timer.
    #[instrument(skip(self, new), fields(invoice_id = %new.invoice_id, customer_id = %new.customer_id), err)]
    pub async fn open_invoice(&self, new: NewInvoice) -> Result<Invoice, IntakeError> {
        let invoice = Invoice::open(new, self.coordinator.clock().now(), self.expiry_window)?;
        self.coordinator.store().create(&invoice).await?;
        self.watcher.schedule_invoice(&invoice);
        info!(
            total = invoice.total().amount,
            currency = %invoice.total().currency,
            expires_at = %invoice.expires_at(),
            "invoice opened"
        );
        Ok(invoice)
    }

    pub async fn apply(&self, request: TransitionRequest) -> Result<ApplyOutcome, ReconcileError> {
        self.coordinator.apply(request).await
    }

    pub async fn apply_with_deadline(
        &self,
        request: TransitionRequest,
        deadline: Instant,
    ) -> Result<ApplyOutcome, ReconcileError> {
        self.coordinator.apply_with_deadline(request, deadline).await
    }

    /// Resolve a callback to its invoice and reconcile it.
    #[instrument(skip(self, callback), fields(gateway = callback.gateway()))]
    pub async fn handle_callback(
        &self,
        callback: &PaymentCallback,
    ) -> Result<ApplyOutcome, CallbackFailure> {
        let invoice_id = match callback.target()? {
            CallbackTarget::Invoice(id) => id,
            CallbackTarget::GatewayReference(reference) => {
                match self.find_by_gateway_reference(&reference).await {
                    Ok(Some(invoice)) => invoice.invoice_id().clone(),
                    Ok(None) => {
                        warn!(%reference, "callback for unknown gateway reference");
                        return Err(CallbackFailure::UnknownReference(reference));
                    }
                    Err(err) => return Err(ReconcileError::from(err).into()),
                }
            }
        };

        let request = callback.to_transition_request(invoice_id)?;
        Ok(self.coordinator.apply(request).await?)
    }

    pub async fn load(&self, invoice_id: &InvoiceId) -> Result<Invoice, StoreError> {
        self.coordinator.store().load(invoice_id).await
    }

    pub async fn find_by_gateway_reference(
        &self,
        gateway_reference: &str,
    ) -> Result<Option<Invoice>, StoreError> {
        self.coordinator
            .store()
            .find_by_gateway_reference(gateway_reference)
            .await
    }

    pub async fn list_by_customer(
        &self,
        customer_id: &CustomerId,
    ) -> Result<Vec<Invoice>, StoreError> {
        self.coordinator.store().list_by_customer(customer_id).await
    }

    pub async fn list_by_order_reference(
        &self,
        order_reference: &str,
    ) -> Result<Vec<Invoice>, StoreError> {
        self.coordinator
            .store()
            .list_by_order_reference(order_reference)
            .await
    }

    /// Most recent paid invoice for an order, i.e. the one that settled it.
    pub async fn latest_paid_for_order(
        &self,
        order_reference: &str,
    ) -> Result<Option<Invoice>, StoreError> {
        Ok(self
            .list_by_order_reference(order_reference)
            .await?
            .into_iter()
            .find(|invoice| invoice.status() == InvoiceStatus::Paid))
    }

    pub async fn history(&self, invoice_id: &InvoiceId) -> Result<Vec<TransitionRecord>, StoreError> {
        self.coordinator.store().history(invoice_id).await
    }

    /// Re-arm expiry timers for every open invoice. Call once at startup.
    pub async fn rearm(&self) -> Result<usize, StoreError> {
        self.watcher.rearm().await
    }

    pub fn shutdown(&self) {
        self.watcher.shutdown();
    }
}
