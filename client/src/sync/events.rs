//! Per-channel notifications.
//!
//! Every change applied to an entity (local or remote), every sync error and
//! every connectivity change is published on the entity's channel. Contexts
//! subscribe by channel id.

use std::sync::Arc;

use dashmap::DashMap;
use ebb_engine::{ChannelId, LiveMessage, RecordId};
use tokio::sync::broadcast;

/// Buffered notices per subscriber before it starts lagging.
const CHANNEL_CAPACITY: usize = 256;

/// Something that happened on a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelNotice {
    /// A change was applied to the local store
    Message(LiveMessage),
    /// A change could not be applied or was rejected by the remote
    Error {
        message: String,
        record_id: Option<RecordId>,
    },
    Connect,
    Disconnect,
}

pub type NoticeReceiver = broadcast::Receiver<ChannelNotice>;

/// Fan-out of channel notices to subscribers.
#[derive(Debug, Default)]
pub struct EventHub {
    channels: DashMap<ChannelId, broadcast::Sender<ChannelNotice>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Create a new hub wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Subscribe to a channel. Only notices published afterwards are seen.
    pub fn subscribe(&self, channel: &str) -> NoticeReceiver {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a notice.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, channel: &str, notice: ChannelNotice) -> usize {
        let Some(sender) = self.channels.get(channel) else {
            return 0;
        };
        match sender.send(notice) {
            Ok(count) => count,
            Err(_) => {
                tracing::trace!(channel, "No subscribers for notice");
                0
            }
        }
    }

    /// Drop a channel; its subscribers see the stream close.
    pub fn remove(&self, channel: &str) {
        self.channels.remove(channel);
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}
