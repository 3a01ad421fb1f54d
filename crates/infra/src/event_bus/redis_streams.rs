//! Redis Streams-backed broker for invoice transition envelopes.
//!
//! - **Stream key**: `payrecon:invoice-events` (one stream, every invoice)
//! - **Entry fields**: `key` (invoice id), `event_type`, `sequence_number`, `payload` (envelope JSON)
//! - **Ordering**: XADD order; the publisher's per-invoice lanes make that
//!   commit order for each key
//! - **Consumers**: consumer groups via XREADGROUP; entries are XACK'd once
//!   handed to the subscription channel
//!
//! The sync `redis` client is used throughout; publishes hop onto the blocking
//! pool so they never stall a runtime worker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::Commands;
use redis::streams::{StreamReadOptions, StreamReadReply};
use tokio::sync::mpsc;
use tracing::{error, instrument, warn};

use payrecon_events::{EventBus, Subscription};

use crate::config::ReconcileConfig;
use crate::publisher::InvoiceEnvelope;

pub const DEFAULT_STREAM_KEY: &str = "payrecon:invoice-events";

const DEFAULT_GROUP: &str = "default";
const READ_COUNT: usize = 10;
const READ_BLOCK_MS: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("blocking task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone)]
pub struct RedisStreamsEventBus {
    client: Arc<redis::Client>,
    stream_key: String,
    max_len: Option<usize>,
}

impl RedisStreamsEventBus {
    /// `stream_key` defaults to `payrecon:invoice-events`.
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: Option<String>,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            stream_key: stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string()),
            max_len: None,
        })
    }

    /// Connect to `REDIS_URL` and publish to `PAYRECON_TOPIC`.
    pub fn from_config(config: &ReconcileConfig) -> Result<Self, RedisStreamsError> {
        let url = config
            .redis_url
            .as_deref()
            .ok_or_else(|| RedisStreamsError::Connection("REDIS_URL is not set".to_string()))?;
        Self::new(url, Some(config.topic.clone()))
    }

    /// Cap the stream at roughly `max_len` entries (`MAXLEN ~`).
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Ensure a consumer group exists (idempotent; BUSYGROUP is ignored).
    pub fn ensure_consumer_group(&self, group_name: &str) -> Result<(), RedisStreamsError> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(group_name)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    fn publish_sync(&self, message: &InvoiceEnvelope) -> Result<(), RedisStreamsError> {
        let payload = serde_json::to_string(message)
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_key);
        if let Some(max_len) = self.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        let _: String = cmd
            .arg("*")
            .arg("key")
            .arg(message.key())
            .arg("event_type")
            .arg(message.event_type())
            .arg("sequence_number")
            .arg(message.sequence_number())
            .arg("payload")
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {e}")))?;

        Ok(())
    }

    /// Subscribe through a consumer group.
    ///
    /// A background thread reads new entries, forwards them in stream order and
    /// acknowledges each one after it is handed off.
    pub fn subscribe_with_group(
        &self,
        group_name: &str,
        consumer_name: &str,
    ) -> Subscription<InvoiceEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();

        if let Err(e) = self.ensure_consumer_group(group_name) {
            error!(group = group_name, error = %e, "failed to create consumer group");
        }

        let bus = self.clone();
        let group = group_name.to_string();
        let consumer = consumer_name.to_string();

        std::thread::spawn(move || {
            let mut conn = match bus.client.get_connection() {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "stream subscriber could not connect");
                    return;
                }
            };
            let options = StreamReadOptions::default()
                .group(&group, &consumer)
                .count(READ_COUNT)
                .block(READ_BLOCK_MS);

            loop {
                let reply: redis::RedisResult<Option<StreamReadReply>> =
                    conn.xread_options(&[&bus.stream_key], &[">"], &options);

                let reply = match reply {
                    Ok(Some(reply)) => reply,
                    Ok(None) => {
                        if tx.is_closed() {
                            return;
                        }
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "XREADGROUP failed");
                        std::thread::sleep(Duration::from_millis(500));
                        continue;
                    }
                };

                for stream in reply.keys {
                    for entry in stream.ids {
                        let envelope = entry
                            .get::<String>("payload")
                            .and_then(|p| serde_json::from_str::<InvoiceEnvelope>(&p).ok());

                        match envelope {
                            Some(envelope) => {
                                if tx.send(envelope).is_err() {
                                    return;
                                }
                            }
                            None => warn!(entry_id = %entry.id, "skipping malformed stream entry"),
                        }

                        let acked: redis::RedisResult<u64> =
                            conn.xack(&bus.stream_key, &group, &[&entry.id]);
                        if let Err(e) = acked {
                            error!(entry_id = %entry.id, error = %e, "XACK failed");
                        }
                    }
                }
            }
        });

        Subscription::new(rx)
    }
}

#[async_trait]
impl EventBus<InvoiceEnvelope> for RedisStreamsEventBus {
    type Error = RedisStreamsError;

    #[instrument(
        skip(self, message),
        fields(stream_key = %self.stream_key, invoice_id = %message.key(), sequence = message.sequence_number()),
        err
    )]
    async fn publish(&self, message: InvoiceEnvelope) -> Result<(), Self::Error> {
        let bus = self.clone();
        tokio::task::spawn_blocking(move || bus.publish_sync(&message))
            .await
            .map_err(|e| RedisStreamsError::Join(e.to_string()))?
    }

    fn subscribe(&self) -> Subscription<InvoiceEnvelope> {
        self.subscribe_with_group(
            DEFAULT_GROUP,
            &format!("consumer-{}", uuid::Uuid::now_v7()),
        )
    }
}
