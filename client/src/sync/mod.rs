//! Synchronization: endpoints, the orchestrator, channel notices and live
//! contexts.

mod context;
mod endpoint;
mod events;
mod store;

pub use context::SyncContext;
pub use endpoint::{ConnectionState, RequestGate, SyncEndpoint};
pub use events::{ChannelNotice, EventHub, NoticeReceiver};
pub use store::{EntityBinding, ReadResult, SyncStore};
