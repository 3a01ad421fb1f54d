use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use payrecon_core::InvoiceId;
use payrecon_events::{Event, EventEnvelope};

use crate::invoice::InvoiceStatus;
use crate::transition::{SignalSource, TransitionRecord};

/// Published once per committed status transition.
///
/// Wire shape (JSON):
///
/// ```json
/// {
///   "invoice_id": "inv-1",
///   "from_status": "pending",
///   "to_status": "paid",
///   "source": "vnpay",
///   "occurred_at": "2026-01-01T00:00:00Z",
///   "order_reference": "ticket-7"
/// }
/// ```
///
/// `order_reference` is omitted when the invoice has none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceTransitioned {
    pub invoice_id: InvoiceId,
    pub from_status: InvoiceStatus,
    pub to_status: InvoiceStatus,
    pub source: SignalSource,
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_reference: Option<String>,
}

impl InvoiceTransitioned {
    pub const EVENT_TYPE: &'static str = "invoicing.invoice.transitioned";

    pub fn from_record(record: &TransitionRecord) -> Self {
        Self {
            invoice_id: record.invoice_id.clone(),
            from_status: record.from_status,
            to_status: record.to_status,
            source: record.source.clone(),
            occurred_at: record.applied_at,
            order_reference: record.order_reference.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.to_status.is_terminal()
    }

    /// Envelope keyed by invoice id, sequenced by the version the record committed.
    pub fn envelope(record: &TransitionRecord) -> EventEnvelope<Self> {
        EventEnvelope::wrap(
            record.invoice_id.as_str(),
            record.version,
            Self::from_record(record),
        )
    }
}

impl Event for InvoiceTransitioned {
    fn event_type(&self) -> &'static str {
        Self::EVENT_TYPE
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> TransitionRecord {
        TransitionRecord {
            invoice_id: "inv-1".parse().unwrap(),
            from_status: InvoiceStatus::Pending,
            to_status: InvoiceStatus::Paid,
            source: SignalSource::gateway("vnpay"),
            source_reference: Some("14422574".to_string()),
            reason: "IPN 00".to_string(),
            applied_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            version: 2,
            order_reference: None,
        }
    }

    #[test]
    fn serializes_to_flat_json_with_rfc3339_time() {
        let event = InvoiceTransitioned::from_record(&record());
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "invoice_id": "inv-1",
                "from_status": "pending",
                "to_status": "paid",
                "source": "vnpay",
                "occurred_at": "2026-01-01T00:00:00Z",
            })
        );
    }

    #[test]
    fn order_reference_travels_with_the_event() {
        let mut record = record();
        record.order_reference = Some("ticket-7".to_string());
        let json = serde_json::to_value(InvoiceTransitioned::from_record(&record)).unwrap();

        assert_eq!(json["order_reference"], "ticket-7");
        let back: InvoiceTransitioned = serde_json::from_value(json).unwrap();
        assert_eq!(back.order_reference.as_deref(), Some("ticket-7"));
    }

    #[test]
    fn envelope_uses_invoice_key_and_committed_version() {
        let envelope = InvoiceTransitioned::envelope(&record());

        assert_eq!(envelope.key(), "inv-1");
        assert_eq!(envelope.sequence_number(), 2);
        assert_eq!(envelope.event_type(), InvoiceTransitioned::EVENT_TYPE);
        assert_eq!(envelope.schema_version(), 1);
        assert!(envelope.payload().is_terminal());
    }
}
