//! Infrastructure layer: invoice storage, the reconciliation pipeline, expiry
//! timers, event publication, gateway adapters and configuration.

pub mod callback;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod event_bus;
pub mod expiry;
pub mod invoice_store;
pub mod publisher;


pub use callback::{BankTransferStatus, CallbackError, CallbackTarget, PaymentCallback, StaffAction};
pub use config::{ConfigError, ReconcileConfig};
pub use coordinator::{ApplyOutcome, Coordinator, GatewayAck, ReconcileError};
pub use engine::{CallbackFailure, IntakeError, ReconciliationEngine};
pub use expiry::{ExpiryWatcher, TimerRegistry};
pub use invoice_store::{InMemoryInvoiceStore, InvoiceStore, PostgresInvoiceStore, StoreError};
pub use publisher::{EventPublisher, InvoiceEnvelope, PublishError, PublishPolicy, PublishSlot};
