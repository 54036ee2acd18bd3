//! # ebb-client
//!
//! Offline-capable synchronization of entity collections with a remote
//! service.
//!
//! Local changes are written to SQLite first and queued as offline messages;
//! the [`SyncStore`] delivers them when the remote is reachable and folds the
//! remote's answers and push messages back into local storage. A
//! [`SyncContext`] keeps a filtered, sorted, paged view of an entity up to date
//! with both.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ebb_client::{EntityBinding, HttpTransport, SyncConfig, SyncContext, SyncStore};
//! use ebb_engine::{GetQuery, SortField};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! ebb_client::logging::init(ebb_client::logging::DEFAULT_FILTER);
//!
//! let config = SyncConfig::from_env()?;
//! let transport = Arc::new(HttpTransport::new()?);
//! let store = SyncStore::open(config, transport, None).await?;
//!
//! let root = store.config().remote_root.clone();
//! store
//!     .register(EntityBinding::new("tasks", format!("{}/tasks", root)))
//!     .await?;
//! store.create("tasks", json!({"title": "Write docs", "done": false})).await?;
//!
//! let query = GetQuery::new().with_limit(20).with_sort(SortField::asc("title"));
//! let mut tasks = SyncContext::new(&store, "tasks", &query, &GetQuery::new())?;
//! tasks.fetch(&store).await?;
//! tasks.drain();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod session;
pub mod sync;
pub mod transport;

pub use config::{ConfigError, SyncConfig, UnkeyedMessagePolicy};
pub use error::{SyncError, SyncResult};
pub use session::SessionContext;
pub use sync::{
    ChannelNotice, ConnectionState, EntityBinding, EventHub, ReadResult, SyncContext,
    SyncEndpoint, SyncStore,
};
pub use transport::{
    ChannelEvent, HttpError, HttpMethod, HttpTransport, OpenChannel, PushChannel, PushTransport,
    Transport,
};
