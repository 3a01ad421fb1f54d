//! Transition requests (what a signal asks for) and transition records (what
//! actually happened).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use payrecon_core::{DomainError, InvoiceId};

use crate::invoice::{InvoiceStatus, PaymentMethod};

/// Outcome a signal source asks the engine to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestedOutcome {
    ConfirmedPaid,
    Failed,
    Refunded,
    AwaitingConfirmation,
}

impl RequestedOutcome {
    pub const ALL: [RequestedOutcome; 4] = [
        RequestedOutcome::ConfirmedPaid,
        RequestedOutcome::Failed,
        RequestedOutcome::Refunded,
        RequestedOutcome::AwaitingConfirmation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RequestedOutcome::ConfirmedPaid => "confirmed-paid",
            RequestedOutcome::Failed => "failed",
            RequestedOutcome::Refunded => "refunded",
            RequestedOutcome::AwaitingConfirmation => "awaiting-confirmation",
        }
    }
}

impl core::fmt::Display for RequestedOutcome {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a transition request came from.
///
/// Serialized as a bare string: the gateway name, `staff`, or `expiry-watcher`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SignalSource {
    Gateway(String),
    Staff,
    ExpiryWatcher,
}

impl SignalSource {
    const STAFF: &'static str = "staff";
    const EXPIRY_WATCHER: &'static str = "expiry-watcher";

    pub fn gateway(name: impl AsRef<str>) -> Self {
        SignalSource::Gateway(name.as_ref().trim().to_ascii_lowercase())
    }

    pub fn is_gateway(&self) -> bool {
        matches!(self, SignalSource::Gateway(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            SignalSource::Gateway(name) => name,
            SignalSource::Staff => Self::STAFF,
            SignalSource::ExpiryWatcher => Self::EXPIRY_WATCHER,
        }
    }
}

impl core::fmt::Display for SignalSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for SignalSource {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "" => Err(DomainError::validation("signal source must not be empty")),
            Self::STAFF => Ok(SignalSource::Staff),
            Self::EXPIRY_WATCHER => Ok(SignalSource::ExpiryWatcher),
            _ => Ok(SignalSource::Gateway(value)),
        }
    }
}

impl From<SignalSource> for String {
    fn from(value: SignalSource) -> Self {
        value.as_str().to_string()
    }
}

/// Normalized "someone wants this invoice to reach outcome X".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub invoice_id: InvoiceId,
    pub requested_outcome: RequestedOutcome,
    pub source: SignalSource,
    /// Gateway transaction id, staff operator id, or nothing.
    pub source_reference: Option<String>,
    pub reason: String,
    /// Version the source read before deciding to write, if it read at all.
    pub observed_version: Option<u64>,
    /// Payment method confirmed by this signal (e.g. staff took cash).
    pub payment_method: Option<PaymentMethod>,
}

impl TransitionRequest {
    pub fn new(
        invoice_id: InvoiceId,
        requested_outcome: RequestedOutcome,
        source: SignalSource,
    ) -> Self {
        Self {
            invoice_id,
            requested_outcome,
            source,
            source_reference: None,
            reason: String::new(),
            observed_version: None,
            payment_method: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        let reference = reference.into();
        self.source_reference = (!reference.trim().is_empty()).then_some(reference);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_observed_version(mut self, version: u64) -> Self {
        self.observed_version = Some(version);
        self
    }

    pub fn with_payment_method(mut self, method: PaymentMethod) -> Self {
        self.payment_method = Some(method);
        self
    }

    /// The gateway transaction id carried by this request, if it is gateway-origin.
    pub fn gateway_reference(&self) -> Option<&str> {
        if self.source.is_gateway() {
            self.source_reference.as_deref()
        } else {
            None
        }
    }
}

/// Field changes written together with a status update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub to_status: InvoiceStatus,
    pub gateway_reference: Option<String>,
    pub payment_method: Option<PaymentMethod>,
    pub at: DateTime<Utc>,
}

/// Append-only audit entry, written atomically with the status update it describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub invoice_id: InvoiceId,
    pub from_status: InvoiceStatus,
    pub to_status: InvoiceStatus,
    pub source: SignalSource,
    pub source_reference: Option<String>,
    pub reason: String,
    pub applied_at: DateTime<Utc>,
    /// Invoice version produced by this transition.
    pub version: u64,
    /// Order the invoice settles, copied from the invoice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_reference: Option<String>,
}

impl TransitionRecord {
    pub fn is_terminal(&self) -> bool {
        self.to_status.is_terminal()
    }
}
