//! Push channel collaborator.
//!
//! A push transport opens one named channel per endpoint. The remote
//! announces connectivity changes and delivers live messages on it; the
//! client emits named events (such as `bind` with its last known timestamp).

use super::HttpError;
use async_trait::async_trait;
use ebb_engine::LiveMessage;
use futures::stream::BoxStream;
use serde_json::Value;

/// Event emitted to bind a channel at a timestamp.
pub const BIND_EVENT: &str = "bind";

/// Something that happened on a push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    Message(LiveMessage),
}

/// An open push channel.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Emit a named event to the remote.
    async fn emit(&self, event: &str, payload: Value) -> Result<(), HttpError>;

    /// Close the channel. Its event stream ends.
    async fn close(&self);
}

/// A freshly opened channel and its incoming events.
pub struct OpenChannel {
    pub channel: Box<dyn PushChannel>,
    pub events: BoxStream<'static, ChannelEvent>,
}

/// Opens push channels.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Open `resource` (a channel id) on `host`.
    async fn open(&self, host: &str, resource: &str) -> Result<OpenChannel, HttpError>;
}
