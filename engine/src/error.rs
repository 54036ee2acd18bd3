//! Error types for the ebb engine.

use thiserror::Error;

/// All possible errors from the ebb engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Filter compilation errors
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("unknown filter type: {0}")]
    UnknownFilterType(String),

    #[error("unknown logical operation: {0}")]
    UnknownOperation(String),

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid field path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("invalid sort field: {0}")]
    InvalidSortField(String),

    // Message errors
    #[error("record has no '{0}' attribute")]
    MissingId(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid message id: {0}")]
    InvalidMessageId(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
