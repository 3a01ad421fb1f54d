//! Inbound payment signals, normalized into transition requests.
//!
//! Each variant is an already-authenticated callback from one payment path.
//! Signature checks and HTTP parsing happen before a value of this type exists.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use payrecon_core::InvoiceId;
use payrecon_invoicing::{PaymentMethod, RequestedOutcome, SignalSource, TransitionRequest};

pub const VNPAY_SUCCESS_CODE: &str = "00";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallbackError {
    #[error("unsupported {gateway} event '{event_type}'")]
    UnsupportedEvent {
        gateway: &'static str,
        event_type: String,
    },

    #[error("{0} callback carries no gateway reference")]
    MissingReference(&'static str),
}

/// Bank transfer lifecycle as reported by the bank integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BankTransferStatus {
    /// Customer started the transfer; funds not yet seen.
    Initiated,
    Confirmed,
    Rejected,
}

/// What staff did at the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffAction {
    Cash,
    PosCard,
    Transfer,
    Other,
    Refund,
}

impl StaffAction {
    fn payment_method(self) -> Option<PaymentMethod> {
        match self {
            StaffAction::Cash => Some(PaymentMethod::StaffCash),
            StaffAction::PosCard => Some(PaymentMethod::StaffPosCard),
            StaffAction::Transfer => Some(PaymentMethod::StaffTransfer),
            StaffAction::Other => Some(PaymentMethod::StaffOther),
            StaffAction::Refund => None,
        }
    }
}

/// How a callback identifies its invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackTarget {
    Invoice(InvoiceId),
    /// Only the gateway's transaction id is known; resolve it through the store.
    GatewayReference(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentCallback {
    /// VNPay IPN / return URL.
    Vnpay {
        #[serde(default)]
        invoice_id: Option<InvoiceId>,
        txn_ref: String,
        response_code: String,
        #[serde(default)]
        transaction_no: Option<String>,
    },
    /// Stripe webhook event about a payment intent or its charge.
    Stripe {
        event_type: String,
        payment_intent_id: String,
        #[serde(default)]
        invoice_id: Option<InvoiceId>,
        #[serde(default)]
        failure_message: Option<String>,
    },
    BankTransfer {
        #[serde(default)]
        invoice_id: Option<InvoiceId>,
        transfer_code: String,
        status: BankTransferStatus,
    },
    /// Manual entry by a staff member.
    Staff {
        invoice_id: InvoiceId,
        operator_id: String,
        action: StaffAction,
        #[serde(default)]
        note: Option<String>,
    },
}

impl PaymentCallback {
    pub fn gateway(&self) -> &'static str {
        match self {
            PaymentCallback::Vnpay { .. } => "vnpay",
            PaymentCallback::Stripe { .. } => "stripe",
            PaymentCallback::BankTransfer { .. } => "bank",
            PaymentCallback::Staff { .. } => "staff",
        }
    }

    /// Invoice id when the callback carries one, otherwise its gateway reference.
    pub fn target(&self) -> Result<CallbackTarget, CallbackError> {
        let (invoice_id, reference) = match self {
            PaymentCallback::Vnpay {
                invoice_id,
                txn_ref,
                ..
            } => (invoice_id, txn_ref),
            PaymentCallback::Stripe {
                invoice_id,
                payment_intent_id,
                ..
            } => (invoice_id, payment_intent_id),
            PaymentCallback::BankTransfer {
                invoice_id,
                transfer_code,
                ..
            } => (invoice_id, transfer_code),
            PaymentCallback::Staff { invoice_id, .. } => {
                return Ok(CallbackTarget::Invoice(invoice_id.clone()));
            }
        };

        match (invoice_id, reference.trim()) {
            (Some(id), _) => Ok(CallbackTarget::Invoice(id.clone())),
            (None, "") => Err(CallbackError::MissingReference(self.gateway())),
            (None, reference) => Ok(CallbackTarget::GatewayReference(reference.to_string())),
        }
    }

    /// Translate into a request against `invoice_id` (already resolved from [`Self::target`]).
    pub fn to_transition_request(
        &self,
        invoice_id: InvoiceId,
    ) -> Result<TransitionRequest, CallbackError> {
        let source = SignalSource::gateway(self.gateway());

        let request = match self {
            PaymentCallback::Vnpay {
                txn_ref,
                response_code,
                transaction_no,
                ..
            } => {
                let (outcome, reason) = if response_code == VNPAY_SUCCESS_CODE {
                    (RequestedOutcome::ConfirmedPaid, "vnpay payment succeeded".to_string())
                } else {
                    (
                        RequestedOutcome::Failed,
                        format!("vnpay response code {response_code}"),
                    )
                };
                let reason = match transaction_no {
                    Some(no) if !no.is_empty() => format!("{reason} (transaction {no})"),
                    _ => reason,
                };
                TransitionRequest::new(invoice_id, outcome, source)
                    .with_reference(txn_ref.as_str())
                    .with_reason(reason)
                    .with_payment_method(PaymentMethod::Vnpay)
            }

            PaymentCallback::Stripe {
                event_type,
                payment_intent_id,
                failure_message,
                ..
            } => {
                let outcome = match event_type.as_str() {
                    "payment_intent.succeeded" => RequestedOutcome::ConfirmedPaid,
                    "payment_intent.payment_failed" | "payment_intent.canceled" => {
                        RequestedOutcome::Failed
                    }
                    "payment_intent.processing" | "payment_intent.requires_action" => {
                        RequestedOutcome::AwaitingConfirmation
                    }
                    "charge.refunded" => RequestedOutcome::Refunded,
                    other => {
                        return Err(CallbackError::UnsupportedEvent {
                            gateway: "stripe",
                            event_type: other.to_string(),
                        });
                    }
                };
                let reason = match failure_message {
                    Some(message) if outcome == RequestedOutcome::Failed => {
                        format!("{event_type}: {message}")
                    }
                    _ => event_type.clone(),
                };
                TransitionRequest::new(invoice_id, outcome, source)
                    .with_reference(payment_intent_id.as_str())
                    .with_reason(reason)
                    .with_payment_method(PaymentMethod::Stripe)
            }

            PaymentCallback::BankTransfer {
                transfer_code,
                status,
                ..
            } => {
                let (outcome, reason) = match status {
                    BankTransferStatus::Initiated => {
                        (RequestedOutcome::AwaitingConfirmation, "bank transfer initiated")
                    }
                    BankTransferStatus::Confirmed => {
                        (RequestedOutcome::ConfirmedPaid, "bank transfer confirmed")
                    }
                    BankTransferStatus::Rejected => {
                        (RequestedOutcome::Failed, "bank transfer rejected")
                    }
                };
                TransitionRequest::new(invoice_id, outcome, source)
                    .with_reference(transfer_code.as_str())
                    .with_reason(reason)
                    .with_payment_method(PaymentMethod::Bank)
            }

            PaymentCallback::Staff {
                operator_id,
                action,
                note,
                ..
            } => {
                let outcome = match action {
                    StaffAction::Refund => RequestedOutcome::Refunded,
                    _ => RequestedOutcome::ConfirmedPaid,
                };
                let reason = note
                    .clone()
                    .unwrap_or_else(|| format!("staff {}", outcome.as_str()));
                let request = TransitionRequest::new(invoice_id, outcome, SignalSource::Staff)
                    .with_reference(operator_id.as_str())
                    .with_reason(reason);
                match action.payment_method() {
                    Some(method) => request.with_payment_method(method),
                    None => request,
                }
            }
        };

        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> InvoiceId {
        s.parse().unwrap()
    }

    #[test]
    fn vnpay_success_code_confirms_payment() {
        let callback = PaymentCallback::Vnpay {
            invoice_id: None,
            txn_ref: "1234567".into(),
            response_code: "00".into(),
            transaction_no: Some("14012345".into()),
        };
        assert_eq!(
            callback.target().unwrap(),
            CallbackTarget::GatewayReference("1234567".into())
        );

        let request = callback.to_transition_request(id("inv-1")).unwrap();
        assert_eq!(request.requested_outcome, RequestedOutcome::ConfirmedPaid);
        assert_eq!(request.source, SignalSource::gateway("vnpay"));
        assert_eq!(request.gateway_reference(), Some("1234567"));
        assert_eq!(request.payment_method, Some(PaymentMethod::Vnpay));
        assert!(request.reason.contains("14012345"));
    }

    #[test]
    fn vnpay_other_codes_fail_the_invoice() {
        let callback = PaymentCallback::Vnpay {
            invoice_id: Some(id("inv-1")),
            txn_ref: "1234567".into(),
            response_code: "24".into(),
            transaction_no: None,
        };
        assert_eq!(callback.target().unwrap(), CallbackTarget::Invoice(id("inv-1")));
        let request = callback.to_transition_request(id("inv-1")).unwrap();
        assert_eq!(request.requested_outcome, RequestedOutcome::Failed);
        assert_eq!(request.reason, "vnpay response code 24");
    }

    #[test]
    fn stripe_events_map_to_outcomes() {
        let cases = [
            ("payment_intent.succeeded", RequestedOutcome::ConfirmedPaid),
            ("payment_intent.payment_failed", RequestedOutcome::Failed),
            ("payment_intent.canceled", RequestedOutcome::Failed),
            ("payment_intent.processing", RequestedOutcome::AwaitingConfirmation),
            ("payment_intent.requires_action", RequestedOutcome::AwaitingConfirmation),
            ("charge.refunded", RequestedOutcome::Refunded),
        ];
        for (event_type, expected) in cases {
            let callback = PaymentCallback::Stripe {
                event_type: event_type.into(),
                payment_intent_id: "pi_123".into(),
                invoice_id: None,
                failure_message: None,
            };
            let request = callback.to_transition_request(id("inv-1")).unwrap();
            assert_eq!(request.requested_outcome, expected, "{event_type}");
            assert_eq!(request.gateway_reference(), Some("pi_123"));
        }
    }

    #[test]
    fn unknown_stripe_event_is_unsupported() {
        let callback = PaymentCallback::Stripe {
            event_type: "customer.created".into(),
            payment_intent_id: "pi_123".into(),
            invoice_id: None,
            failure_message: None,
        };
        assert_eq!(
            callback.to_transition_request(id("inv-1")),
            Err(CallbackError::UnsupportedEvent {
                gateway: "stripe",
                event_type: "customer.created".into(),
            })
        );
    }

    #[test]
    fn bank_transfer_statuses() {
        for (status, expected) in [
            (BankTransferStatus::Initiated, RequestedOutcome::AwaitingConfirmation),
            (BankTransferStatus::Confirmed, RequestedOutcome::ConfirmedPaid),
            (BankTransferStatus::Rejected, RequestedOutcome::Failed),
        ] {
            let callback = PaymentCallback::BankTransfer {
                invoice_id: None,
                transfer_code: "BT-9".into(),
                status,
            };
            let request = callback.to_transition_request(id("inv-1")).unwrap();
            assert_eq!(request.requested_outcome, expected);
            assert_eq!(request.payment_method, Some(PaymentMethod::Bank));
        }
    }

    #[test]
    fn staff_entry_sets_method_and_is_not_a_gateway_reference() {
        let callback = PaymentCallback::Staff {
            invoice_id: id("inv-1"),
            operator_id: "op-7".into(),
            action: StaffAction::PosCard,
            note: None,
        };
        let request = callback.to_transition_request(id("inv-1")).unwrap();
        assert_eq!(request.source, SignalSource::Staff);
        assert_eq!(request.source_reference.as_deref(), Some("op-7"));
        assert_eq!(request.gateway_reference(), None);
        assert_eq!(request.payment_method, Some(PaymentMethod::StaffPosCard));

        let refund = PaymentCallback::Staff {
            invoice_id: id("inv-1"),
            operator_id: "op-7".into(),
            action: StaffAction::Refund,
            note: Some("customer returned goods".into()),
        };
        let request = refund.to_transition_request(id("inv-1")).unwrap();
        assert_eq!(request.requested_outcome, RequestedOutcome::Refunded);
        assert_eq!(request.payment_method, None);
        assert_eq!(request.reason, "customer returned goods");
    }

    #[test]
    fn callback_without_id_or_reference_cannot_be_targeted() {
        let callback = PaymentCallback::BankTransfer {
            invoice_id: None,
            transfer_code: "  ".into(),
            status: BankTransferStatus::Confirmed,
        };
        assert_eq!(callback.target(), Err(CallbackError::MissingReference("bank")));
    }

    #[test]
    fn deserializes_tagged_json() {
        let callback: PaymentCallback = serde_json::from_str(
            r#"{"kind":"vnpay","txn_ref":"1234567","response_code":"00"}"#,
        )
        .unwrap();
        assert_eq!(
            callback,
            PaymentCallback::Vnpay {
                invoice_id: None,
                txn_ref: "1234567".into(),
                response_code: "00".into(),
                transaction_no: None,
            }
        );

        let staff: PaymentCallback = serde_json::from_str(
            r#"{"kind":"staff","invoice_id":"inv-1","operator_id":"op-1","action":"cash"}"#,
        )
        .unwrap();
        assert!(matches!(staff, PaymentCallback::Staff { action: StaffAction::Cash, .. }));
    }
}
