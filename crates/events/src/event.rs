use chrono::{DateTime, Utc};

/// An outbound fact about something that was committed.
///
/// The envelope copies `event_type`, `schema_version` and `occurred_at` onto the
/// wire so consumers can route and upcast without decoding the payload.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Dotted name, e.g. `invoicing.invoice.transitioned`.
    fn event_type(&self) -> &'static str;

    /// Payload schema version; bump on breaking changes.
    fn schema_version(&self) -> u32 {
        1
    }

    /// Business time of the change, not the time of publication.
    fn occurred_at(&self) -> DateTime<Utc>;
}
