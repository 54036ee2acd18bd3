//! Offline message queue.
//!
//! Pending changes live in the shared `__msg__` table, one row per record
//! (`entity~recordId`). An in-memory copy is kept in replay order so the next
//! message to send is always at the front.

use super::{LocalStore, Pool};
use crate::error::SyncResult;
use ebb_engine::record::set_record_id;
use ebb_engine::{Method, OfflineMessage, Timestamp};
use std::cmp::Ordering;
use tokio::sync::Mutex;

/// Table holding queued messages.
pub const MESSAGE_TABLE: &str = "__msg__";

/// Outcome of queueing a change.
#[derive(Debug, Clone, PartialEq)]
pub struct Enqueued {
    /// The message that was pending for the record before, if any
    pub previous: Option<OfflineMessage>,
    /// The message now pending, or `None` when the changes cancelled out
    pub current: Option<OfflineMessage>,
}

/// How a delivered message was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The message was removed from the queue
    Removed,
    /// A newer change was folded in while the message was in flight; it stays
    /// queued as the contained message
    Superseded(OfflineMessage),
    /// Nothing was queued for the record any more
    Missing,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Pending messages in replay order
    pending: Vec<OfflineMessage>,
    /// Id of the message being delivered
    in_flight: Option<String>,
}

/// Durable queue of offline messages.
#[derive(Debug)]
pub struct MessageQueue {
    store: LocalStore,
    state: Mutex<QueueState>,
}

impl MessageQueue {
    /// Open the queue and load persisted messages.
    ///
    /// Rows that no longer parse as messages are skipped.
    pub async fn open(pool: Pool) -> SyncResult<Self> {
        let store = LocalStore::open(pool, MESSAGE_TABLE, "id").await?;

        let mut pending = Vec::new();
        for row in store.read(None).await? {
            match serde_json::from_value::<OfflineMessage>(row) {
                Ok(message) => pending.push(message),
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable offline message"),
            }
        }
        pending.sort_by(|a, b| a.queue_order(b));
        tracing::debug!(count = pending.len(), "Loaded offline messages");

        Ok(Self {
            store,
            state: Mutex::new(QueueState {
                pending,
                in_flight: None,
            }),
        })
    }

    /// Latest send-intent time of any queued message, 0 if empty.
    pub async fn last_time(&self) -> Timestamp {
        let state = self.state.lock().await;
        state.pending.iter().map(|m| m.time).max().unwrap_or(0)
    }

    /// Queue a change, folding it into the pending message for the same
    /// record if there is one.
    ///
    /// A delete folded into a create that is being delivered stays queued as
    /// a delete: the remote is about to hold the record.
    pub async fn enqueue(&self, message: OfflineMessage) -> SyncResult<Enqueued> {
        let mut state = self.state.lock().await;
        let in_flight = state.in_flight.as_deref() == Some(message.id.as_str());
        let previous = state.pending.iter().position(|m| m.id == message.id);

        let current = match previous {
            Some(index) => {
                let queued = state.pending[index].clone();
                if in_flight && queued.method == Method::Create && message.method == Method::Delete {
                    Some(OfflineMessage {
                        method: Method::Delete,
                        data: message.data.clone(),
                        ..queued
                    })
                } else {
                    queued.merge(message.method, message.data.clone())
                }
            }
            None => Some(message.clone()),
        };
        match &current {
            Some(current) => self.store.put(&[serde_json::to_value(current)?]).await?,
            None => self.store.delete(&[message.id.clone()]).await?,
        }

        let previous = previous.map(|index| state.pending.remove(index));
        if let Some(current) = &current {
            insert_sorted(&mut state.pending, current.clone());
        }

        tracing::debug!(
            message_id = %message.id,
            method = ?current.as_ref().map(|m| m.method),
            merged = previous.is_some(),
            "Queued offline message"
        );
        Ok(Enqueued { previous, current })
    }

    /// Put back what was pending for `id` before a failed change.
    pub async fn restore(&self, id: &str, previous: Option<OfflineMessage>) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        state.pending.retain(|m| m.id != id);
        match previous {
            Some(previous) => {
                self.store.put(&[serde_json::to_value(&previous)?]).await?;
                insert_sorted(&mut state.pending, previous);
            }
            None => self.store.delete(&[id.to_string()]).await?,
        }
        Ok(())
    }

    /// Mark `message` as being delivered.
    pub async fn begin(&self, message: &OfflineMessage) {
        self.state.lock().await.in_flight = Some(message.id.clone());
    }

    /// Clear the in-flight mark without settling the message.
    pub async fn release(&self) {
        self.state.lock().await.in_flight = None;
    }

    /// Settle a message the remote has accepted.
    ///
    /// The message is removed unless a newer change was folded into it while
    /// it was in flight. That change stays queued: a delivered `create` turns
    /// it into an `update`, and when the remote answered with `server_id` the
    /// change moves onto that record.
    pub async fn complete(
        &self,
        delivered: &OfflineMessage,
        server_id: Option<&str>,
        id_attribute: &str,
    ) -> SyncResult<Completion> {
        let mut state = self.state.lock().await;
        state.in_flight = None;
        let Some(index) = state.pending.iter().position(|m| m.id == delivered.id) else {
            return Ok(Completion::Missing);
        };

        if state.pending[index] == *delivered {
            self.store.delete(&[delivered.id.clone()]).await?;
            state.pending.remove(index);
            return Ok(Completion::Removed);
        }

        let mut current = state.pending[index].clone();
        if delivered.method == Method::Create && current.method == Method::Create {
            current.method = Method::Update;
        }
        if let (Some(server_id), Some(entity)) = (server_id, delivered.entity()) {
            current.id = OfflineMessage::message_id(entity, server_id);
            current.record_id = server_id.to_string();
            if current.data.is_object() {
                set_record_id(&mut current.data, id_attribute, server_id);
            }
        }

        self.store.put(&[serde_json::to_value(&current)?]).await?;
        if current.id != delivered.id {
            self.store.delete(&[delivered.id.clone()]).await?;
        }
        state.pending.remove(index);
        state.pending.retain(|m| m.id != current.id);
        insert_sorted(&mut state.pending, current.clone());

        tracing::debug!(
            message_id = %current.id,
            method = ?current.method,
            "Kept change made in flight"
        );
        Ok(Completion::Superseded(current))
    }

    /// Drop a message the remote refused, unless a newer change was folded
    /// into it meanwhile. Returns whether the message was removed.
    pub async fn discard(&self, delivered: &OfflineMessage) -> SyncResult<bool> {
        let mut state = self.state.lock().await;
        state.in_flight = None;
        let Some(index) = state.pending.iter().position(|m| m == delivered) else {
            return Ok(false);
        };
        self.store.delete(&[delivered.id.clone()]).await?;
        state.pending.remove(index);
        Ok(true)
    }

    /// Drop a message regardless of its content.
    pub async fn remove(&self, id: &str) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        state.pending.retain(|m| m.id != id);
        self.store.delete(&[id.to_string()]).await
    }

    pub async fn get(&self, id: &str) -> Option<OfflineMessage> {
        let state = self.state.lock().await;
        state.pending.iter().find(|m| m.id == id).cloned()
    }

    /// Next message to send.
    pub async fn front(&self) -> Option<OfflineMessage> {
        self.state.lock().await.pending.first().cloned()
    }

    /// All pending messages in replay order.
    pub async fn all(&self) -> Vec<OfflineMessage> {
        self.state.lock().await.pending.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }
}

fn insert_sorted(pending: &mut Vec<OfflineMessage>, message: OfflineMessage) {
    let index = pending.partition_point(|m| m.queue_order(&message) != Ordering::Greater);
    pending.insert(index, message);
}
