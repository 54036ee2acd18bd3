//! Per-channel timestamps.
//!
//! The shared `__timestamp__` table stores, for each channel, the point up to
//! which remote changes have been applied locally.

use super::{LocalStore, Pool};
use crate::error::SyncResult;
use ebb_engine::Timestamp;
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Table holding channel timestamps.
pub const TIMESTAMP_TABLE: &str = "__timestamp__";

/// Monotonic timestamp store keyed by channel id.
#[derive(Debug)]
pub struct TimestampStore {
    store: LocalStore,
    cache: Mutex<HashMap<String, Timestamp>>,
}

impl TimestampStore {
    pub async fn open(pool: Pool) -> SyncResult<Self> {
        let store = LocalStore::open(pool, TIMESTAMP_TABLE, "channel").await?;

        let mut cache = HashMap::new();
        for row in store.read(None).await? {
            let channel = row.get("channel").and_then(|c| c.as_str());
            let timestamp = row.get("timestamp").and_then(|t| t.as_u64());
            match (channel, timestamp) {
                (Some(channel), Some(timestamp)) => {
                    cache.insert(channel.to_string(), timestamp);
                }
                _ => tracing::warn!(?row, "Skipping malformed timestamp row"),
            }
        }

        Ok(Self {
            store,
            cache: Mutex::new(cache),
        })
    }

    /// Last applied timestamp of a channel, 0 if none.
    pub async fn get(&self, channel: &str) -> Timestamp {
        self.cache.lock().await.get(channel).copied().unwrap_or(0)
    }

    /// Record a new timestamp for a channel.
    ///
    /// Returns `false` without writing if `timestamp` is older than the stored
    /// value.
    pub async fn set(&self, channel: &str, timestamp: Timestamp) -> SyncResult<bool> {
        let mut cache = self.cache.lock().await;
        match cache.get(channel) {
            Some(&current) if current > timestamp => {
                tracing::debug!(channel, current, timestamp, "Ignoring older timestamp");
                return Ok(false);
            }
            Some(&current) if current == timestamp => return Ok(true),
            _ => {}
        }
        self.store
            .put(&[json!({ "channel": channel, "timestamp": timestamp })])
            .await?;
        cache.insert(channel.to_string(), timestamp);
        Ok(true)
    }

    /// Forget a channel's timestamp; the next read starts over.
    pub async fn clear(&self, channel: &str) -> SyncResult<()> {
        let mut cache = self.cache.lock().await;
        self.store.delete(&[channel.to_string()]).await?;
        cache.remove(channel);
        Ok(())
    }
}
