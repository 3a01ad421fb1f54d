use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use payrecon_core::{AggregateRoot, CustomerId, ExpectedVersion, InvoiceId};
use payrecon_invoicing::{Invoice, StatusChange, TransitionRecord};

use super::r#trait::{InvoiceStore, StoreError};

#[derive(Debug, Clone)]
struct InvoiceRow {
    invoice: Invoice,
    history: Vec<TransitionRecord>,
}

/// In-memory invoice store.
///
/// Intended for tests/dev. One `RwLock` over the whole table makes every
/// conditional update trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryInvoiceStore {
    rows: RwLock<HashMap<InvoiceId, InvoiceRow>>,
}

impl InMemoryInvoiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::backend("lock poisoned")
    }

    fn select<F>(&self, keep: F) -> Result<Vec<Invoice>, StoreError>
    where
        F: Fn(&Invoice) -> bool,
    {
        let rows = self.rows.read().map_err(|_| Self::poisoned())?;
        Ok(rows
            .values()
            .map(|row| &row.invoice)
            .filter(|invoice| keep(invoice))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl InvoiceStore for InMemoryInvoiceStore {
    async fn create(&self, invoice: &Invoice) -> Result<(), StoreError> {
        let mut rows = self.rows.write().map_err(|_| Self::poisoned())?;
        if rows.contains_key(invoice.invoice_id()) {
            return Err(StoreError::AlreadyExists(invoice.invoice_id().clone()));
        }
        rows.insert(
            invoice.invoice_id().clone(),
            InvoiceRow {
                invoice: invoice.clone(),
                history: Vec::new(),
            },
        );
        Ok(())
    }

    async fn load(&self, invoice_id: &InvoiceId) -> Result<Invoice, StoreError> {
        let rows = self.rows.read().map_err(|_| Self::poisoned())?;
        rows.get(invoice_id)
            .map(|row| row.invoice.clone())
            .ok_or_else(|| StoreError::NotFound(invoice_id.clone()))
    }

    async fn conditional_update(
        &self,
        invoice_id: &InvoiceId,
        expected_version: ExpectedVersion,
        change: &StatusChange,
        record: &TransitionRecord,
    ) -> Result<u64, StoreError> {
        let mut rows = self.rows.write().map_err(|_| Self::poisoned())?;
        let row = rows
            .get_mut(invoice_id)
            .ok_or_else(|| StoreError::NotFound(invoice_id.clone()))?;

        let current = row.invoice.version();
        expected_version
            .check(current)
            .map_err(|_| StoreError::VersionConflict {
                invoice_id: invoice_id.clone(),
                expected: expected_version,
                actual: current,
            })?;

        row.invoice.apply_change(change);
        let mut record = record.clone();
        record.version = row.invoice.version();
        row.history.push(record);

        Ok(row.invoice.version())
    }

    async fn find_by_gateway_reference(
        &self,
        gateway_reference: &str,
    ) -> Result<Option<Invoice>, StoreError> {
        Ok(self
            .select(|invoice| invoice.gateway_reference() == Some(gateway_reference))?
            .into_iter()
            .next())
    }

    async fn list_by_customer(&self, customer_id: &CustomerId) -> Result<Vec<Invoice>, StoreError> {
        let mut invoices = self.select(|invoice| invoice.customer_id() == customer_id)?;
        invoices.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        Ok(invoices)
    }

    async fn list_by_order_reference(
        &self,
        order_reference: &str,
    ) -> Result<Vec<Invoice>, StoreError> {
        let mut invoices = self.select(|invoice| invoice.order_reference() == Some(order_reference))?;
        invoices.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        Ok(invoices)
    }

    async fn list_open(&self) -> Result<Vec<Invoice>, StoreError> {
        let mut invoices = self.select(|invoice| !invoice.is_terminal())?;
        invoices.sort_by_key(|invoice| invoice.expires_at());
        Ok(invoices)
    }

    async fn history(&self, invoice_id: &InvoiceId) -> Result<Vec<TransitionRecord>, StoreError> {
        let rows = self.rows.read().map_err(|_| Self::poisoned())?;
        Ok(rows
            .get(invoice_id)
            .map(|row| row.history.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use payrecon_core::{Currency, Money};
    use payrecon_invoicing::{InvoiceStatus, NewInvoice, SignalSource};

    fn invoice(id: &str, customer: &str, reference: Option<&str>) -> Invoice {
        Invoice::open(
            NewInvoice {
                invoice_id: id.parse().unwrap(),
                customer_id: customer.parse().unwrap(),
                total: Money::new(100_000, Currency::parse("VND").unwrap()).unwrap(),
                payment_method: None,
                gateway_reference: reference.map(str::to_string),
                order_reference: Some(format!("order-{customer}")),
            },
            Utc::now(),
            Duration::minutes(15),
        )
        .unwrap()
    }

    fn paid_change() -> (StatusChange, TransitionRecord) {
        let at = Utc::now();
        (
            StatusChange {
                to_status: InvoiceStatus::Paid,
                gateway_reference: Some("txn-1".to_string()),
                payment_method: None,
                at,
            },
            TransitionRecord {
                invoice_id: "inv-1".parse().unwrap(),
                from_status: InvoiceStatus::Pending,
                to_status: InvoiceStatus::Paid,
                source: SignalSource::gateway("vnpay"),
                source_reference: Some("txn-1".to_string()),
                reason: String::new(),
                applied_at: at,
                version: 2,
                order_reference: None,
            },
        )
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let store = InMemoryInvoiceStore::new();
        let inv = invoice("inv-1", "cust-1", None);

        store.create(&inv).await.unwrap();
        assert!(matches!(
            store.create(&inv).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn conditional_update_is_compare_and_set_on_version() {
        let store = InMemoryInvoiceStore::new();
        let id: InvoiceId = "inv-1".parse().unwrap();
        store.create(&invoice("inv-1", "cust-1", None)).await.unwrap();
        let (change, record) = paid_change();

        let version = store
            .conditional_update(&id, ExpectedVersion::Exact(1), &change, &record)
            .await
            .unwrap();
        assert_eq!(version, 2);

        let err = store
            .conditional_update(&id, ExpectedVersion::Exact(1), &change, &record)
            .await
            .unwrap_err();
        assert!(err.is_version_conflict());

        let loaded = store.load(&id).await.unwrap();
        assert_eq!(loaded.status(), InvoiceStatus::Paid);
        assert_eq!(loaded.version(), 2);
        assert_eq!(store.history(&id).await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn update_of_unknown_invoice_is_not_found() {
        let store = InMemoryInvoiceStore::new();
        let (change, record) = paid_change();
        let err = store
            .conditional_update(&"nope".parse().unwrap(), ExpectedVersion::Exact(1), &change, &record)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn lookups_by_reference_customer_and_openness() {
        let store = InMemoryInvoiceStore::new();
        store.create(&invoice("inv-1", "cust-1", Some("pi_1"))).await.unwrap();
        store.create(&invoice("inv-2", "cust-1", None)).await.unwrap();
        store.create(&invoice("inv-3", "cust-2", None)).await.unwrap();

        let found = store.find_by_gateway_reference("pi_1").await.unwrap().unwrap();
        assert_eq!(found.invoice_id().as_str(), "inv-1");
        assert!(store.find_by_gateway_reference("pi_9").await.unwrap().is_none());

        assert_eq!(
            store.list_by_customer(&"cust-1".parse().unwrap()).await.unwrap().len(),
            2
        );
        assert_eq!(store.list_by_order_reference("order-cust-2").await.unwrap().len(), 1);
        assert!(store.list_by_order_reference("order-cust-9").await.unwrap().is_empty());

        let (change, record) = paid_change();
        store
            .conditional_update(&"inv-1".parse().unwrap(), ExpectedVersion::Exact(1), &change, &record)
            .await
            .unwrap();
        let open: Vec<_> = store
            .list_open()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.invoice_id().to_string())
            .collect();
        assert_eq!(open.len(), 2);
        assert!(!open.contains(&"inv-1".to_string()));
    }
}
