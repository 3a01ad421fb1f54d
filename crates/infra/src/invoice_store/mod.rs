//! Invoice persistence boundary.
//!
//! Owns invoice rows and their append-only transition history. The only
//! status-affecting write is a versioned compare-and-set; everything else is a read
//! or the initial insert.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryInvoiceStore;
pub use postgres::PostgresInvoiceStore;
pub use r#trait::{InvoiceStore, StoreError};
