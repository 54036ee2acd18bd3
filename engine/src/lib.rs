//! # Ebb Engine
//!
//! The deterministic core of the ebb sync client.
//!
//! This crate holds everything about offline sync that does not touch a
//! network or a disk: compiling declarative queries, describing queued and live
//! changes, deriving channels and keeping in-memory result sets sorted and
//! filtered as changes arrive.
//!
//! ## Design Principles
//!
//! - **No IO**: storage and transports live in `ebb-client`
//! - **Deterministic**: the same inputs always produce the same outputs
//! - **Compile once**: filters and sort orders become closures up front
//!
//! ## Core Concepts
//!
//! ### Queries
//!
//! A [`GetQuery`] carries a window, a [`SortOrder`], a [`Filter`] and a field
//! projection. The [`QueryCompiler`] turns the filter into a [`Predicate`] and
//! the sort order into a [`Comparator`].
//!
//! ### Messages
//!
//! Locally made changes are queued as [`OfflineMessage`]s, stamped by a
//! [`SendClock`] and replayed in `(priority, time, id)` order. Every change,
//! local or remote, is applied as a [`LiveMessage`].
//!
//! ### Live views
//!
//! A [`LiveView`] is the current page of a query. It applies live messages
//! incrementally and reports what changed as [`ViewChange`]s.
//!
//! ## Quick Start
//!
//! ```rust
//! use ebb_engine::{CompileOptions, GetQuery, LiveMessage, LiveView, Method, SortField};
//! use serde_json::json;
//!
//! let query = GetQuery::new().with_sort(SortField::asc("name"));
//! let mut view = LiveView::new(query, CompileOptions::default()).unwrap();
//!
//! view.apply(&LiveMessage::new("2", Method::Create, json!({"id": "2", "name": "Bob"})));
//! view.apply(&LiveMessage::new("1", Method::Create, json!({"id": "1", "name": "Alice"})));
//!
//! assert_eq!(view.records()[0]["name"], "Alice");
//! ```

pub mod channel;
pub mod clock;
pub mod compiler;
pub mod error;
pub mod filter;
pub mod message;
pub mod path;
pub mod query;
pub mod record;
pub mod sort;
pub mod view;

// Re-export main types at crate root
pub use channel::Channel;
pub use clock::SendClock;
pub use compiler::{compare_values, CompileOptions, Comparator, Predicate, QueryCompiler};
pub use error::{Error, Result};
pub use filter::{DateBound, Filter, LogicalOperator};
pub use message::{LiveMessage, Method, OfflineMessage, RESET_ID};
pub use path::FieldPath;
pub use query::GetQuery;
pub use record::{Origin, DEFAULT_ID_ATTRIBUTE};
pub use sort::{parse_sort_order, SortField, SortOrder};
pub use view::{insertion_point, LiveView, ViewChange};

/// Type aliases for clarity
pub type RecordId = String;
pub type EntityName = String;
pub type ChannelId = String;
pub type Timestamp = u64;
pub type Priority = u32;
