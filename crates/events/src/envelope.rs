use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Event;

/// Envelope for an event, carrying the partition key and stream position.
///
/// This is the unit handed to a broker.
///
/// Notes:
/// - **Partitioning**: `key` is the aggregate identifier; brokers route all
///   envelopes with the same key to one partition so consumers see them in order.
/// - **Ordering**: `sequence_number` is the aggregate version the event was
///   committed at, so consumers can drop stale or duplicate deliveries.
/// - `payload` is the domain event itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    key: String,
    event_type: String,
    schema_version: u32,
    sequence_number: u64,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        key: impl Into<String>,
        event_type: impl Into<String>,
        schema_version: u32,
        sequence_number: u64,
        occurred_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            key: key.into(),
            event_type: event_type.into(),
            schema_version,
            sequence_number,
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

impl<E: Event> EventEnvelope<E> {
    /// Wrap a typed event, taking type and business time from the event itself.
    pub fn wrap(key: impl Into<String>, sequence_number: u64, event: E) -> Self {
        Self::new(
            Uuid::now_v7(),
            key,
            event.event_type(),
            event.schema_version(),
            sequence_number,
            event.occurred_at(),
            event,
        )
    }
}
