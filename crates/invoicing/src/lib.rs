//! Invoice payment domain.
//!
//! Deterministic business rules only (no IO, no clocks, no storage): the
//! invoice aggregate, the canonical transition request, the audit record, the
//! status state machine and the outbound event describing a realized transition.

pub mod event;
pub mod invoice;
pub mod state_machine;
pub mod transition;

pub use event::InvoiceTransitioned;
pub use invoice::{
    DEFAULT_EXPIRY_WINDOW_MINUTES, Invoice, InvoiceParts, InvoiceStatus, NewInvoice, PaymentMethod,
};
pub use state_machine::{
    Decision, NoOpReason, PlannedTransition, RejectionReason, Transition, decide, next_status,
};
pub use transition::{
    RequestedOutcome, SignalSource, StatusChange, TransitionRecord, TransitionRequest,
};
