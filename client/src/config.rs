//! Configuration management for the sync client.

use ebb_engine::{CompileOptions, GetQuery, Priority};
use std::env;
use std::time::Duration;

/// Default local database.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://ebb.db?mode=rwc";

/// Default de-duplication window for change and metadata fetches.
pub const DEFAULT_REQUEST_WINDOW: Duration = Duration::from_secs(1);

/// What replay does with a queued message whose id names no entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnkeyedMessagePolicy {
    /// Delete the message and continue with the next one
    #[default]
    Discard,
    /// Stop replay with an error
    Fail,
}

/// Sync client configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Remote root every endpoint URL must live under
    pub remote_root: String,
    /// SQLite connection URL
    pub database_url: String,
    /// Entities in replay order; unlisted entities replay first
    pub entity_order: Vec<String>,
    /// Compare filter text case-sensitively
    pub case_sensitive: bool,
    /// Query merged into every context
    pub static_query: GetQuery,
    /// Window in which repeated change/metadata fetches share one request
    pub request_window: Duration,
    pub unkeyed_messages: UnkeyedMessagePolicy,
    /// Do not raise error notices after conflict resolution
    pub silent_conflicts: bool,
    /// Use the push transport when one is provided
    pub push_enabled: bool,
}

impl SyncConfig {
    /// Configuration with defaults for a remote root.
    pub fn new(remote_root: impl Into<String>) -> Self {
        Self {
            remote_root: remote_root.into(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            entity_order: Vec::new(),
            case_sensitive: false,
            static_query: GetQuery::default(),
            request_window: DEFAULT_REQUEST_WINDOW,
            unkeyed_messages: UnkeyedMessagePolicy::default(),
            silent_conflicts: false,
            push_enabled: true,
        }
    }

    /// Load configuration from environment variables (and `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through a variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let remote_root = lookup("EBB_REMOTE_ROOT")
            .filter(|root| !root.trim().is_empty())
            .ok_or(ConfigError::MissingRemoteRoot)?;

        let mut config = Self::new(remote_root);

        if let Some(url) = lookup("EBB_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(order) = lookup("EBB_ENTITY_ORDER") {
            config.entity_order = order
                .split(',')
                .map(str::trim)
                .filter(|entity| !entity.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(value) = lookup("EBB_CASE_SENSITIVE") {
            config.case_sensitive = parse_bool("EBB_CASE_SENSITIVE", &value)?;
        }
        if let Some(value) = lookup("EBB_PUSH_ENABLED") {
            config.push_enabled = parse_bool("EBB_PUSH_ENABLED", &value)?;
        }

        Ok(config)
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_entity_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity_order = order.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    pub fn with_static_query(mut self, query: GetQuery) -> Self {
        self.static_query = query;
        self
    }

    pub fn with_request_window(mut self, window: Duration) -> Self {
        self.request_window = window;
        self
    }

    pub fn with_unkeyed_messages(mut self, policy: UnkeyedMessagePolicy) -> Self {
        self.unkeyed_messages = policy;
        self
    }

    pub fn with_silent_conflicts(mut self, silent: bool) -> Self {
        self.silent_conflicts = silent;
        self
    }

    pub fn with_push_enabled(mut self, enabled: bool) -> Self {
        self.push_enabled = enabled;
        self
    }

    /// Replay priority of an entity: its 1-based position in `entity_order`,
    /// or 0 when unlisted.
    pub fn priority_of(&self, entity: &str) -> Priority {
        self.entity_order
            .iter()
            .position(|e| e == entity)
            .map(|i| i as Priority + 1)
            .unwrap_or(0)
    }

    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            case_sensitive: self.case_sensitive,
        }
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            name,
            value: value.to_string(),
        }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("EBB_REMOTE_ROOT environment variable is required")]
    MissingRemoteRoot,

    #[error("Invalid boolean for {name}: '{value}'")]
    InvalidBool { name: &'static str, value: String },
}
