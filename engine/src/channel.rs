//! Channel derivation.
//!
//! A channel scopes local storage and push subscriptions to one
//! (remote root, entity, user) triple. The same inputs always give the same
//! channel; changing any of them gives a different one.

use crate::{ChannelId, EntityName};
use sha2::{Digest, Sha256};

/// Hex digits of the digest kept in ids and table names.
const HASH_LEN: usize = 16;

/// A derived channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    /// Stable channel id, `{entity}@{hash}`
    pub id: ChannelId,
    pub entity: EntityName,
    /// SQL-safe local table name, `{entity}_{hash}`
    pub table: String,
}

impl Channel {
    /// Derive the channel for an entity under a remote root and user.
    pub fn derive(remote_root: &str, entity: &str, user: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize_root(remote_root).as_bytes());
        hasher.update([0u8]);
        hasher.update(entity.as_bytes());
        hasher.update([0u8]);
        hasher.update(user.unwrap_or("").as_bytes());
        let digest = hex::encode(hasher.finalize());
        let hash = &digest[..HASH_LEN];

        Self {
            id: format!("{}@{}", entity, hash),
            entity: entity.to_string(),
            table: format!("{}_{}", sanitize(entity), hash),
        }
    }
}

/// Strip trailing slashes so `https://x/api/` and `https://x/api` agree.
pub fn normalize_root(root: &str) -> &str {
    root.trim().trim_end_matches('/')
}

/// Whether `url` points at or below `root`.
pub fn is_under_root(root: &str, url: &str) -> bool {
    let root = normalize_root(root);
    let url = url.trim();
    match url.strip_prefix(root) {
        Some(rest) => root.is_empty() || rest.is_empty() || rest.starts_with(['/', '?']),
        None => false,
    }
}

fn sanitize(entity: &str) -> String {
    let mut name: String = entity
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        name.insert(0, 't');
    }
    name
}
