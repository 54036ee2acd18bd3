//! reqwest-backed [`Transport`].

use super::{HttpError, HttpMethod, Transport};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP transport over a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    bearer_token: Option<String>,
}

impl HttpTransport {
    /// Create a transport with its own client.
    pub fn new() -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| HttpError::connectivity(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    /// Use an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            bearer_token: None,
        }
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, HttpError> {
        let mut request = self.client.request(method.into(), url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            tracing::debug!(%method, url, error = %e, "Request did not reach remote");
            HttpError::connectivity(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("").to_string();
            tracing::debug!(%method, url, status = status.as_u16(), "Remote rejected request");
            return Err(HttpError::status(status.as_u16(), reason));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| HttpError::connectivity(e.to_string()))?;
        Ok(decode_body(&bytes))
    }
}

/// Body of an accepted request. An empty or non-JSON body reads as `null`;
/// the request itself still succeeded.
fn decode_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, len = bytes.len(), "Accepted response has no JSON body");
            Value::Null
        }
    }
}
