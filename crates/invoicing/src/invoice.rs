use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use payrecon_core::{AggregateRoot, CustomerId, DomainError, InvoiceId, Money};

use crate::transition::StatusChange;

/// Default payment window applied at invoice creation.
pub const DEFAULT_EXPIRY_WINDOW_MINUTES: i64 = 15;

/// Invoice payment lifecycle.
///
/// `Pending` is initial; `Paid`, `Failed` and `Refunded` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    AwaitingConfirmation,
    Paid,
    Failed,
    Refunded,
}

impl InvoiceStatus {
    pub const ALL: [InvoiceStatus; 5] = [
        InvoiceStatus::Pending,
        InvoiceStatus::AwaitingConfirmation,
        InvoiceStatus::Paid,
        InvoiceStatus::Failed,
        InvoiceStatus::Refunded,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InvoiceStatus::Paid | InvoiceStatus::Failed | InvoiceStatus::Refunded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::AwaitingConfirmation => "awaiting_confirmation",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Failed => "failed",
            InvoiceStatus::Refunded => "refunded",
        }
    }
}

impl core::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for InvoiceStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InvoiceStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown invoice status '{s}'")))
    }
}

/// How the customer pays (or paid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Vnpay,
    Stripe,
    Bank,
    StaffCash,
    StaffPosCard,
    StaffTransfer,
    StaffOther,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 7] = [
        PaymentMethod::Vnpay,
        PaymentMethod::Stripe,
        PaymentMethod::Bank,
        PaymentMethod::StaffCash,
        PaymentMethod::StaffPosCard,
        PaymentMethod::StaffTransfer,
        PaymentMethod::StaffOther,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Vnpay => "VNPAY",
            PaymentMethod::Stripe => "STRIPE",
            PaymentMethod::Bank => "BANK",
            PaymentMethod::StaffCash => "STAFF_CASH",
            PaymentMethod::StaffPosCard => "STAFF_POS_CARD",
            PaymentMethod::StaffTransfer => "STAFF_TRANSFER",
            PaymentMethod::StaffOther => "STAFF_OTHER",
        }
    }

    pub fn is_staff_assisted(self) -> bool {
        matches!(
            self,
            PaymentMethod::StaffCash
                | PaymentMethod::StaffPosCard
                | PaymentMethod::StaffTransfer
                | PaymentMethod::StaffOther
        )
    }
}

impl core::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for PaymentMethod {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PaymentMethod::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::validation(format!("unknown payment method '{s}'")))
    }
}

/// Input for opening a new invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInvoice {
    pub invoice_id: InvoiceId,
    pub customer_id: CustomerId,
    pub total: Money,
    pub payment_method: Option<PaymentMethod>,
    /// Gateway transaction identifier, when the gateway minted one before the
    /// customer paid (VNPay txn ref, Stripe payment intent, bank transfer code).
    pub gateway_reference: Option<String>,
    /// The order (ticket) this invoice settles. Copied onto every outbound event.
    #[serde(default)]
    pub order_reference: Option<String>,
}

/// Every persisted field of an invoice, used by storage backends to rebuild one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceParts {
    pub invoice_id: InvoiceId,
    pub customer_id: CustomerId,
    pub total: Money,
    pub payment_method: Option<PaymentMethod>,
    pub status: InvoiceStatus,
    pub gateway_reference: Option<String>,
    pub order_reference: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate root: Invoice.
///
/// Status only changes through [`Invoice::apply_change`], which storage
/// backends call inside their conditional write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    id: InvoiceId,
    customer_id: CustomerId,
    total: Money,
    payment_method: Option<PaymentMethod>,
    status: InvoiceStatus,
    gateway_reference: Option<String>,
    order_reference: Option<String>,
    version: u64,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Invoice {
    /// Open a `pending` invoice at version 1 with a fixed expiry.
    pub fn open(new: NewInvoice, now: DateTime<Utc>, window: Duration) -> Result<Self, DomainError> {
        if window <= Duration::zero() {
            return Err(DomainError::validation("expiry window must be positive"));
        }
        let gateway_reference = new.gateway_reference.filter(|r| !r.trim().is_empty());
        let order_reference = new.order_reference.filter(|r| !r.trim().is_empty());

        Ok(Self {
            id: new.invoice_id,
            customer_id: new.customer_id,
            total: new.total,
            payment_method: new.payment_method,
            status: InvoiceStatus::Pending,
            gateway_reference,
            order_reference,
            version: 1,
            created_at: now,
            expires_at: now + window,
            updated_at: now,
        })
    }

    pub fn restore(parts: InvoiceParts) -> Self {
        Self {
            id: parts.invoice_id,
            customer_id: parts.customer_id,
            total: parts.total,
            payment_method: parts.payment_method,
            status: parts.status,
            gateway_reference: parts.gateway_reference,
            order_reference: parts.order_reference,
            version: parts.version,
            created_at: parts.created_at,
            expires_at: parts.expires_at,
            updated_at: parts.updated_at,
        }
    }

    pub fn into_parts(self) -> InvoiceParts {
        InvoiceParts {
            invoice_id: self.id,
            customer_id: self.customer_id,
            total: self.total,
            payment_method: self.payment_method,
            status: self.status,
            gateway_reference: self.gateway_reference,
            order_reference: self.order_reference,
            version: self.version,
            created_at: self.created_at,
            expires_at: self.expires_at,
            updated_at: self.updated_at,
        }
    }

    pub fn invoice_id(&self) -> &InvoiceId {
        &self.id
    }

    pub fn customer_id(&self) -> &CustomerId {
        &self.customer_id
    }

    pub fn total(&self) -> &Money {
        &self.total
    }

    pub fn payment_method(&self) -> Option<PaymentMethod> {
        self.payment_method
    }

    pub fn status(&self) -> InvoiceStatus {
        self.status
    }

    pub fn gateway_reference(&self) -> Option<&str> {
        self.gateway_reference.as_deref()
    }

    pub fn order_reference(&self) -> Option<&str> {
        self.order_reference.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a committed status change and bump the version by one.
    ///
    /// The gateway reference is write-once: a change never replaces a known one.
    pub fn apply_change(&mut self, change: &StatusChange) {
        self.status = change.to_status;
        if self.gateway_reference.is_none() {
            self.gateway_reference = change.gateway_reference.clone();
        }
        if let Some(method) = change.payment_method {
            self.payment_method = Some(method);
        }
        self.updated_at = change.at;
        self.version += 1;
    }
}

impl AggregateRoot for Invoice {
    type Id = InvoiceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payrecon_core::Currency;

    fn new_invoice(id: &str) -> NewInvoice {
        NewInvoice {
            invoice_id: id.parse().unwrap(),
            customer_id: "cust-1".parse().unwrap(),
            total: Money::new(100_000, Currency::parse("VND").unwrap()).unwrap(),
            payment_method: Some(PaymentMethod::Vnpay),
            gateway_reference: None,
            order_reference: Some("ticket-42".to_string()),
        }
    }

    #[test]
    fn open_invoice_starts_pending_at_version_one() {
        let now = Utc::now();
        let invoice =
            Invoice::open(new_invoice("inv-1"), now, Duration::minutes(15)).unwrap();

        assert_eq!(invoice.status(), InvoiceStatus::Pending);
        assert_eq!(invoice.version(), 1);
        assert_eq!(invoice.expires_at(), now + Duration::minutes(15));
        assert_eq!(invoice.updated_at(), now);
    }

    #[test]
    fn open_rejects_non_positive_window() {
        let err = Invoice::open(new_invoice("inv-1"), Utc::now(), Duration::zero()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn blank_gateway_reference_is_dropped() {
        let mut new = new_invoice("inv-1");
        new.gateway_reference = Some("  ".to_string());
        let invoice = Invoice::open(new, Utc::now(), Duration::minutes(15)).unwrap();
        assert_eq!(invoice.gateway_reference(), None);
    }

    #[test]
    fn order_reference_is_kept_and_blank_one_dropped() {
        let invoice =
            Invoice::open(new_invoice("inv-1"), Utc::now(), Duration::minutes(15)).unwrap();
        assert_eq!(invoice.order_reference(), Some("ticket-42"));

        let mut new = new_invoice("inv-2");
        new.order_reference = Some(String::new());
        let invoice = Invoice::open(new, Utc::now(), Duration::minutes(15)).unwrap();
        assert_eq!(invoice.order_reference(), None);
    }

    #[test]
    fn apply_change_bumps_version_and_keeps_first_reference() {
        let now = Utc::now();
        let mut invoice =
            Invoice::open(new_invoice("inv-1"), now, Duration::minutes(15)).unwrap();

        invoice.apply_change(&StatusChange {
            to_status: InvoiceStatus::AwaitingConfirmation,
            gateway_reference: Some("txn-1".to_string()),
            payment_method: None,
            at: now + Duration::minutes(1),
        });
        invoice.apply_change(&StatusChange {
            to_status: InvoiceStatus::Paid,
            gateway_reference: Some("txn-2".to_string()),
            payment_method: Some(PaymentMethod::StaffCash),
            at: now + Duration::minutes(2),
        });

        assert_eq!(invoice.version(), 3);
        assert_eq!(invoice.status(), InvoiceStatus::Paid);
        assert_eq!(invoice.gateway_reference(), Some("txn-1"));
        assert_eq!(invoice.payment_method(), Some(PaymentMethod::StaffCash));
        assert_eq!(invoice.updated_at(), now + Duration::minutes(2));
    }

    #[test]
    fn status_and_method_round_trip_through_strings() {
        for status in InvoiceStatus::ALL {
            assert_eq!(status.as_str().parse::<InvoiceStatus>().unwrap(), status);
        }
        assert_eq!("staff_cash".parse::<PaymentMethod>().unwrap(), PaymentMethod::StaffCash);
        assert!("paypal".parse::<PaymentMethod>().is_err());
    }

    #[test]
    fn parts_round_trip() {
        let invoice =
            Invoice::open(new_invoice("inv-9"), Utc::now(), Duration::minutes(15)).unwrap();
        assert_eq!(Invoice::restore(invoice.clone().into_parts()), invoice);
    }
}
