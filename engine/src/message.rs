//! Message types.
//!
//! Locally made changes are queued as [`OfflineMessage`]s until the remote
//! side accepts them. Changes from either side are applied through the same
//! [`LiveMessage`] envelope.

use crate::record::merge_patch;
use crate::{Error, Priority, RecordId, Result, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Separator between entity and record id in an offline message id.
pub const MESSAGE_ID_SEPARATOR: char = '~';

/// Id of a live message that replaces a whole view.
pub const RESET_ID: &str = "all";

/// A sync method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Create,
    Update,
    Patch,
    Delete,
    Read,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Create => "create",
            Method::Update => "update",
            Method::Patch => "patch",
            Method::Delete => "delete",
            Method::Read => "read",
        }
    }

    /// Whether the method changes data.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Method::Read)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Method::Create),
            "update" => Ok(Method::Update),
            "patch" => Ok(Method::Patch),
            "delete" => Ok(Method::Delete),
            "read" => Ok(Method::Read),
            _ => Err(Error::UnknownMethod(s.to_string())),
        }
    }
}

/// A queued local change awaiting remote confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineMessage {
    /// `entity~recordId`
    pub id: String,
    pub record_id: RecordId,
    pub method: Method,
    #[serde(default)]
    pub data: Value,
    /// Send-intent time
    pub time: Timestamp,
    #[serde(default)]
    pub priority: Priority,
}

impl OfflineMessage {
    pub fn new(
        entity: &str,
        record_id: impl Into<RecordId>,
        method: Method,
        data: Value,
        time: Timestamp,
        priority: Priority,
    ) -> Self {
        let record_id = record_id.into();
        Self {
            id: Self::message_id(entity, &record_id),
            record_id,
            method,
            data,
            time,
            priority,
        }
    }

    /// Queue key of a record.
    pub fn message_id(entity: &str, record_id: &str) -> String {
        format!("{}{}{}", entity, MESSAGE_ID_SEPARATOR, record_id)
    }

    /// Split a queue key into entity and record id.
    pub fn parse_id(id: &str) -> Result<(&str, &str)> {
        match id.split_once(MESSAGE_ID_SEPARATOR) {
            Some((entity, record_id)) if !entity.is_empty() => Ok((entity, record_id)),
            _ => Err(Error::InvalidMessageId(id.to_string())),
        }
    }

    /// The entity this message belongs to, if its id carries one.
    pub fn entity(&self) -> Option<&str> {
        Self::parse_id(&self.id).ok().map(|(entity, _)| entity)
    }

    /// Replay order: priority, then time, then id.
    pub fn queue_order(&self, other: &OfflineMessage) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.time.cmp(&other.time))
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Fold a newer change to the same record into this message.
    ///
    /// Returns `None` when the two changes cancel out. The original send-intent
    /// time is kept.
    pub fn merge(mut self, method: Method, data: Value) -> Option<OfflineMessage> {
        let merged = |mut base: Value, data: &Value| {
            merge_patch(&mut base, data);
            base
        };

        let (method, data) = match (self.method, method) {
            (Method::Create, Method::Delete) => return None,
            (Method::Create, Method::Update | Method::Patch) => {
                (Method::Create, merged(self.data, &data))
            }
            (Method::Update, Method::Patch) => (Method::Update, merged(self.data, &data)),
            (Method::Patch, Method::Patch) => (Method::Patch, merged(self.data, &data)),
            (Method::Delete, Method::Create) => (Method::Update, data),
            (_, Method::Delete) => (Method::Delete, data),
            (_, method) => (method, data),
        };

        self.method = method;
        self.data = data;
        Some(self)
    }
}

/// A change applied to local state and live views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveMessage {
    /// Record id, or [`RESET_ID`]
    pub id: String,
    pub method: Method,
    #[serde(default)]
    pub data: Value,
    /// Channel time the change was made at, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Timestamp>,
}

impl LiveMessage {
    pub fn new(id: impl Into<String>, method: Method, data: Value) -> Self {
        Self {
            id: id.into(),
            method,
            data,
            time: None,
        }
    }

    pub fn with_time(mut self, time: Timestamp) -> Self {
        self.time = Some(time);
        self
    }

    /// Whether this message replaces the whole view.
    pub fn is_reset(&self) -> bool {
        self.id == RESET_ID
    }
}

impl From<&OfflineMessage> for LiveMessage {
    fn from(message: &OfflineMessage) -> Self {
        LiveMessage::new(message.record_id.clone(), message.method, message.data.clone())
    }
}
