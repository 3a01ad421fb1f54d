//! Redis key-expiration notifications as an expiry timer source (optional).
//!
//! Each open invoice gets a key `invoice_expiry:{invoice_id}` whose TTL ends at
//! `expires_at`. Redis publishes the key name on `__keyevent@0__:expired` when it
//! lapses; a listener turns that into [`ExpiryWatcher::expire`].
//!
//! Redis only guarantees the event fires at or after the TTL, and a listener
//! that is offline misses it. Run [`ExpiryWatcher::rearm`] at startup to cover
//! anything that lapsed while nobody was listening.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use payrecon_core::InvoiceId;
use payrecon_events::EventBus;

use super::watcher::ExpiryWatcher;
use crate::invoice_store::InvoiceStore;
use crate::publisher::InvoiceEnvelope;

pub const KEY_PREFIX: &str = "invoice_expiry:";
pub const EXPIRED_CHANNEL: &str = "__keyevent@0__:expired";

#[derive(Debug, Error)]
pub enum RedisExpiryError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("blocking task failed: {0}")]
    Join(String),
}

pub fn expiry_key(invoice_id: &InvoiceId) -> String {
    format!("{KEY_PREFIX}{invoice_id}")
}

/// Invoice id carried by an expired key, if the key is one of ours.
pub fn invoice_id_from_key(key: &str) -> Option<InvoiceId> {
    key.strip_prefix(KEY_PREFIX)
        .and_then(|id| InvoiceId::parse(id).ok())
}

/// Arms TTL keys and listens for their expiry.
#[derive(Debug, Clone)]
pub struct RedisExpirySource {
    client: Arc<redis::Client>,
}

impl RedisExpirySource {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, RedisExpiryError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisExpiryError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Turn on expired-key notifications (`Ex`). Needs CONFIG rights.
    pub async fn enable_notifications(&self) -> Result<(), RedisExpiryError> {
        self.blocking(|conn| {
            redis::cmd("CONFIG")
                .arg("SET")
                .arg("notify-keyspace-events")
                .arg("Ex")
                .query::<()>(conn)
        })
        .await
    }

    /// Set `invoice_expiry:{id}` to lapse at `expires_at` (millisecond precision).
    #[instrument(skip(self), fields(invoice_id = %invoice_id), err)]
    pub async fn arm(
        &self,
        invoice_id: &InvoiceId,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RedisExpiryError> {
        let key = expiry_key(invoice_id);
        let at_ms = expires_at.timestamp_millis();
        self.blocking(move |conn| {
            redis::cmd("SET")
                .arg(&key)
                .arg(1)
                .arg("PXAT")
                .arg(at_ms)
                .query::<()>(conn)
        })
        .await
    }

    /// Remove the key so no notification fires.
    pub async fn disarm(&self, invoice_id: &InvoiceId) -> Result<(), RedisExpiryError> {
        let key = expiry_key(invoice_id);
        self.blocking(move |conn| redis::cmd("DEL").arg(&key).query::<()>(conn))
            .await
    }

    async fn blocking<F>(&self, op: F) -> Result<(), RedisExpiryError>
    where
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<()> + Send + 'static,
    {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || {
            let mut conn = client
                .get_connection()
                .map_err(|e| RedisExpiryError::Connection(e.to_string()))?;
            op(&mut conn).map_err(|e| RedisExpiryError::Command(e.to_string()))
        })
        .await
        .map_err(|e| RedisExpiryError::Join(e.to_string()))?
    }

    /// Forward expired-key notifications into the watcher until the connection drops.
    ///
    /// The subscription runs on a dedicated thread (the sync pub/sub API blocks);
    /// ids cross into the runtime over a channel.
    pub fn listen<S, B>(&self, watcher: ExpiryWatcher<S, B>) -> JoinHandle<()>
    where
        S: InvoiceStore + 'static,
        B: EventBus<InvoiceEnvelope> + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<InvoiceId>();
        let client = Arc::clone(&self.client);

        std::thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "expiry listener could not connect");
                    return;
                }
            };
            let mut pubsub = conn.as_pubsub();
            if let Err(e) = pubsub.subscribe(EXPIRED_CHANNEL) {
                error!(error = %e, "expiry listener could not subscribe");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(error = %e, "expiry listener disconnected");
                        return;
                    }
                };
                let key: String = match msg.get_payload() {
                    Ok(key) => key,
                    Err(_) => continue,
                };
                let Some(invoice_id) = invoice_id_from_key(&key) else {
                    continue;
                };
                if tx.send(invoice_id).is_err() {
                    return;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(invoice_id) = rx.recv().await {
                debug!(invoice_id = %invoice_id, "expiry notification received");
                let _ = watcher.expire(invoice_id).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip_to_invoice_ids() {
        let id: InvoiceId = "inv-42".parse().unwrap();
        let key = expiry_key(&id);
        assert_eq!(key, "invoice_expiry:inv-42");
        assert_eq!(invoice_id_from_key(&key), Some(id));
    }

    #[test]
    fn foreign_and_empty_keys_are_ignored() {
        assert_eq!(invoice_id_from_key("session:abc"), None);
        assert_eq!(invoice_id_from_key("invoice_expiry:"), None);
    }
}
