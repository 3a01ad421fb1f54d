//! Invoice payment state machine.
//!
//! A pure decision over `(current status, requested outcome)`; no IO, no clock,
//! no storage. The coordinator feeds it the invoice it just loaded and persists
//! whatever [`Decision::Transition`] says, nothing else.
//!
//! ```text
//!                 awaiting-confirmation
//!   pending ─────────────────────────────▶ awaiting_confirmation
//!     │  │                                     │        │
//!     │  └──── confirmed-paid ──┐   ┌──────────┘        │
//!     │                         ▼   ▼                   │
//!     │                          paid ── refunded ─▶ refunded
//!     │                                                 │
//!     └────────── failed ───────▶ failed ◀──── failed ──┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::invoice::{Invoice, InvoiceStatus};
use crate::transition::{
    RequestedOutcome, SignalSource, StatusChange, TransitionRecord, TransitionRequest,
};
use payrecon_core::AggregateRoot;

/// Why a request was turned down. Not a system error.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    /// The invoice already settled in a way this late signal agrees with: a
    /// second confirmation of a paid invoice, an expiry that lost the race, or
    /// a progress update overtaken by the final outcome.
    #[error("invoice is already {status}; late {requested} ignored")]
    Superseded {
        status: InvoiceStatus,
        requested: RequestedOutcome,
    },

    /// The invoice already reached a terminal state that this request contradicts.
    #[error("invoice is already {status}; {requested} not permitted")]
    AlreadyTerminal {
        status: InvoiceStatus,
        requested: RequestedOutcome,
    },

    /// The table has no edge for this pair.
    #[error("cannot apply {requested} to a {status} invoice")]
    InvalidTransition {
        status: InvoiceStatus,
        requested: RequestedOutcome,
    },
}

impl RejectionReason {
    /// True when the signal is stale rather than contradictory; the sender can
    /// stop redelivering it.
    pub fn is_superseded(&self) -> bool {
        matches!(self, RejectionReason::Superseded { .. })
    }

    /// True when the invoice is already final, whatever the request asked for.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RejectionReason::Superseded { .. } | RejectionReason::AlreadyTerminal { .. }
        )
    }
}

/// Why a request was absorbed without a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoOpReason {
    /// The invoice is already in the requested state.
    AlreadyInState,
    /// Duplicate gateway confirmation for the transaction that paid the invoice.
    GatewayReplay,
}

/// Outcome of evaluating the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Move(InvoiceStatus),
    NoOp(NoOpReason),
    Reject,
}

/// Raw transition table lookup.
///
/// `replay` is true when a `confirmed-paid` request carries the same gateway
/// reference that is already stored on the invoice.
pub fn next_status(current: InvoiceStatus, requested: RequestedOutcome, replay: bool) -> Transition {
    use InvoiceStatus as S;
    use RequestedOutcome as R;

    match (current, requested) {
        (S::Pending, R::ConfirmedPaid) => Transition::Move(S::Paid),
        (S::Pending, R::Failed) => Transition::Move(S::Failed),
        (S::Pending, R::Refunded) => Transition::Reject,
        (S::Pending, R::AwaitingConfirmation) => Transition::Move(S::AwaitingConfirmation),

        (S::AwaitingConfirmation, R::ConfirmedPaid) => Transition::Move(S::Paid),
        (S::AwaitingConfirmation, R::Failed) => Transition::Move(S::Failed),
        (S::AwaitingConfirmation, R::Refunded) => Transition::Reject,
        (S::AwaitingConfirmation, R::AwaitingConfirmation) => {
            Transition::NoOp(NoOpReason::AlreadyInState)
        }

        (S::Paid, R::ConfirmedPaid) if replay => Transition::NoOp(NoOpReason::GatewayReplay),
        (S::Paid, R::Refunded) => Transition::Move(S::Refunded),
        (S::Paid, _) => Transition::Reject,

        (S::Failed, R::Failed) => Transition::NoOp(NoOpReason::AlreadyInState),
        (S::Failed, _) => Transition::Reject,

        (S::Refunded, R::Refunded) => Transition::NoOp(NoOpReason::AlreadyInState),
        (S::Refunded, _) => Transition::Reject,
    }
}

/// A transition ready to persist: the field changes plus the audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTransition {
    pub expected_version: u64,
    pub change: StatusChange,
    pub record: TransitionRecord,
}

/// What the coordinator should do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Transition(PlannedTransition),
    NoOp(NoOpReason),
    Reject(RejectionReason),
}

/// Evaluate `request` against the invoice's current state.
///
/// `applied_at` stamps the change and the record; it is the only input from
/// outside the invoice and the request.
pub fn decide(invoice: &Invoice, request: &TransitionRequest, applied_at: DateTime<Utc>) -> Decision {
    let current = invoice.status();
    let replay = request.requested_outcome == RequestedOutcome::ConfirmedPaid
        && matches!(
            (request.gateway_reference(), invoice.gateway_reference()),
            (Some(incoming), Some(stored)) if incoming == stored
        );

    match next_status(current, request.requested_outcome, replay) {
        Transition::Move(to_status) => {
            let version = invoice.version() + 1;
            Decision::Transition(PlannedTransition {
                expected_version: invoice.version(),
                change: StatusChange {
                    to_status,
                    gateway_reference: request.gateway_reference().map(str::to_string),
                    payment_method: request.payment_method,
                    at: applied_at,
                },
                record: TransitionRecord {
                    invoice_id: invoice.invoice_id().clone(),
                    from_status: current,
                    to_status,
                    source: request.source.clone(),
                    source_reference: request.source_reference.clone(),
                    reason: request.reason.clone(),
                    applied_at,
                    version,
                    order_reference: invoice.order_reference().map(str::to_string),
                },
            })
        }
        Transition::NoOp(reason) => Decision::NoOp(reason),
        Transition::Reject if current.is_terminal() => {
            let status = current;
            let requested = request.requested_outcome;
            if superseded(current, request) {
                Decision::Reject(RejectionReason::Superseded { status, requested })
            } else {
                Decision::Reject(RejectionReason::AlreadyTerminal { status, requested })
            }
        }
        Transition::Reject => Decision::Reject(RejectionReason::InvalidTransition {
            status: current,
            requested: request.requested_outcome,
        }),
    }
}

/// A rejected request against a terminal invoice that agrees with how it settled.
fn superseded(current: InvoiceStatus, request: &TransitionRequest) -> bool {
    use InvoiceStatus as S;
    use RequestedOutcome as R;

    match (current, request.requested_outcome) {
        (_, R::AwaitingConfirmation) => true,
        (S::Paid, R::ConfirmedPaid) => true,
        (S::Paid | S::Refunded, R::Failed) => request.source == SignalSource::ExpiryWatcher,
        _ => false,
    }
}
