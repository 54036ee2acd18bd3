//! Unified error handling for the sync client.

/// Sync client error type.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The remote could not be reached. The change stays queued.
    #[error("Connectivity failure: {0}")]
    Connectivity(String),

    /// The remote answered with a status code.
    #[error("Remote rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Local storage error in `{statement}`: {source}")]
    LocalStorage {
        statement: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Engine error: {0}")]
    Engine(#[from] ebb_engine::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The session user differs from the user the entity was bound for.
    #[error("Session changed since '{entity}' was bound")]
    IdentityChanged { entity: String },

    #[error("Entity '{0}' is not registered")]
    NotRegistered(String),

    #[error("Sync store is closed")]
    Closed,
}

impl SyncError {
    /// Wrap a driver error together with the statement that caused it.
    pub fn storage(statement: impl Into<String>, source: sqlx::Error) -> Self {
        SyncError::LocalStorage {
            statement: statement.into(),
            source,
        }
    }

    /// Whether the failure means "not reachable" rather than "refused".
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SyncError::Connectivity(_))
    }

    /// Status code of a remote rejection.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            SyncError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the remote reports the addressed record as gone.
    pub fn is_gone(&self) -> bool {
        matches!(self.status_code(), Some(401 | 404 | 410))
    }
}

/// Result type alias for sync operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;
