use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use payrecon_core::{CustomerId, ExpectedVersion, InvoiceId};
use payrecon_invoicing::{Invoice, StatusChange, TransitionRecord};

/// Invoice store operation error.
///
/// These are **infrastructure errors** (missing rows, version races, backend
/// failures) as opposed to state machine rejections, which never reach the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invoice {0} not found")]
    NotFound(InvoiceId),

    /// Compare-and-set on `version` lost a race. Retried by the coordinator.
    #[error("version conflict on invoice {invoice_id}: expected {expected:?}, found {actual}")]
    VersionConflict {
        invoice_id: InvoiceId,
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("invoice {0} already exists")]
    AlreadyExists(InvoiceId),

    /// The value cannot be stored as given, e.g. an amount past the column range.
    #[error("invoice rejected by store: {0}")]
    Validation(String),

    #[error("invoice store backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

/// Durable home of invoices and their transition history.
///
/// ## Write Semantics
///
/// `conditional_update()` is the only status-affecting write. Implementations must,
/// in one atomic unit:
/// - compare the stored `version` against `expected_version`
/// - apply the [`StatusChange`] (status, write-once gateway reference, payment method, `updated_at`)
/// - bump `version` by exactly one
/// - append the [`TransitionRecord`]
///
/// Either all of it is visible or none of it is. A lost race surfaces as
/// [`StoreError::VersionConflict`] with nothing written.
///
/// ## Read Semantics
///
/// Reads never block writers and may be stale by the time the caller acts on
/// them; the version check on write is what keeps them honest.
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Persist a freshly opened invoice. Fails with `AlreadyExists` on id reuse.
    async fn create(&self, invoice: &Invoice) -> Result<(), StoreError>;

    async fn load(&self, invoice_id: &InvoiceId) -> Result<Invoice, StoreError>;

    /// Atomic compare-and-set on `version`; returns the new version.
    async fn conditional_update(
        &self,
        invoice_id: &InvoiceId,
        expected_version: ExpectedVersion,
        change: &StatusChange,
        record: &TransitionRecord,
    ) -> Result<u64, StoreError>;

    async fn find_by_gateway_reference(
        &self,
        gateway_reference: &str,
    ) -> Result<Option<Invoice>, StoreError>;

    /// Newest first.
    async fn list_by_customer(&self, customer_id: &CustomerId) -> Result<Vec<Invoice>, StoreError>;

    /// Invoices opened for one order, newest first.
    async fn list_by_order_reference(
        &self,
        order_reference: &str,
    ) -> Result<Vec<Invoice>, StoreError>;

    /// Every invoice that is not yet terminal, ordered by `expires_at`.
    async fn list_open(&self) -> Result<Vec<Invoice>, StoreError>;

    /// Transition records in version order. Empty for an unknown invoice.
    async fn history(&self, invoice_id: &InvoiceId) -> Result<Vec<TransitionRecord>, StoreError>;
}

#[async_trait]
impl<S> InvoiceStore for Arc<S>
where
    S: InvoiceStore + ?Sized,
{
    async fn create(&self, invoice: &Invoice) -> Result<(), StoreError> {
        (**self).create(invoice).await
    }

    async fn load(&self, invoice_id: &InvoiceId) -> Result<Invoice, StoreError> {
        (**self).load(invoice_id).await
    }

    async fn conditional_update(
        &self,
        invoice_id: &InvoiceId,
        expected_version: ExpectedVersion,
        change: &StatusChange,
        record: &TransitionRecord,
    ) -> Result<u64, StoreError> {
        (**self)
            .conditional_update(invoice_id, expected_version, change, record)
            .await
    }

    async fn find_by_gateway_reference(
        &self,
        gateway_reference: &str,
    ) -> Result<Option<Invoice>, StoreError> {
        (**self).find_by_gateway_reference(gateway_reference).await
    }

    async fn list_by_customer(&self, customer_id: &CustomerId) -> Result<Vec<Invoice>, StoreError> {
        (**self).list_by_customer(customer_id).await
    }

    async fn list_by_order_reference(
        &self,
        order_reference: &str,
    ) -> Result<Vec<Invoice>, StoreError> {
        (**self).list_by_order_reference(order_reference).await
    }

    async fn list_open(&self) -> Result<Vec<Invoice>, StoreError> {
        (**self).list_open().await
    }

    async fn history(&self, invoice_id: &InvoiceId) -> Result<Vec<TransitionRecord>, StoreError> {
        (**self).history(invoice_id).await
    }
}
