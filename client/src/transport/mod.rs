//! Remote collaborators.
//!
//! The client talks to the remote through two traits: [`Transport`] for
//! request/response HTTP and [`PushTransport`] for named push channels.
//! A failure without a status code means the remote was not reachable; the
//! sync logic relies on that distinction.

pub mod http;
pub mod push;

pub use http::HttpTransport;
pub use push::{ChannelEvent, OpenChannel, PushChannel, PushTransport};

use crate::error::SyncError;
use async_trait::async_trait;
use ebb_engine::Method;
use serde_json::Value;
use std::fmt;

/// HTTP methods used by the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl From<Method> for HttpMethod {
    fn from(method: Method) -> Self {
        match method {
            Method::Create => HttpMethod::Post,
            Method::Update => HttpMethod::Put,
            Method::Patch => HttpMethod::Patch,
            Method::Delete => HttpMethod::Delete,
            Method::Read => HttpMethod::Get,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    /// Absent when the remote could not be reached
    pub status_code: Option<u16>,
    pub status_message: Option<String>,
}

impl HttpError {
    /// The remote could not be reached.
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self {
            status_code: None,
            status_message: Some(message.into()),
        }
    }

    /// The remote answered with a failure status.
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code: Some(code),
            status_message: Some(message.into()),
        }
    }

    pub fn is_connectivity(&self) -> bool {
        self.status_code.is_none()
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self.status_message.as_deref().unwrap_or("");
        match self.status_code {
            Some(code) => write!(f, "HTTP {} {}", code, message),
            None => write!(f, "unreachable: {}", message),
        }
    }
}

impl std::error::Error for HttpError {}

impl From<HttpError> for SyncError {
    fn from(err: HttpError) -> Self {
        let message = err.status_message.unwrap_or_default();
        match err.status_code {
            Some(status) => SyncError::Rejected { status, message },
            None => SyncError::Connectivity(message),
        }
    }
}

/// Request/response access to the remote.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform `method` against a resolved URL.
    ///
    /// Returns the decoded JSON body (`Value::Null` when empty).
    async fn request(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, HttpError>;
}
