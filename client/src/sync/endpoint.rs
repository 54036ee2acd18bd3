//! Per-entity endpoint binding.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ebb_engine::{Channel, ChannelId, EntityName, GetQuery, Priority, Timestamp};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::db::LocalStore;
use crate::error::{SyncError, SyncResult};
use crate::transport::PushChannel;

/// Connectivity of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Binding the channel, fetching changes and replaying the queue
    Connecting,
    Connected,
}

/// Collapses concurrent identical requests.
///
/// Callers arriving while a request runs wait for it and share its result; a
/// result stays valid for `window` after it completes.
#[derive(Debug)]
pub struct RequestGate {
    last: Mutex<Option<(Instant, Value)>>,
    window: Duration,
}

impl RequestGate {
    pub fn new(window: Duration) -> Self {
        Self {
            last: Mutex::new(None),
            window,
        }
    }

    /// Run `fetch` unless a result from within the window is available.
    pub async fn run<F, Fut>(&self, fetch: F) -> SyncResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<Value>>,
    {
        let mut last = self.last.lock().await;
        if let Some((at, value)) = last.as_ref() {
            if at.elapsed() < self.window {
                return Ok(value.clone());
            }
        }
        let value = fetch().await?;
        *last = Some((Instant::now(), value.clone()));
        Ok(value)
    }

    /// Run `fetch` even if a cached result is still valid, and cache its
    /// result. Callers already waiting share it.
    pub async fn refresh<F, Fut>(&self, fetch: F) -> SyncResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<Value>>,
    {
        let mut last = self.last.lock().await;
        let value = fetch().await?;
        *last = Some((Instant::now(), value.clone()));
        Ok(value)
    }

    /// Forget the cached result.
    pub async fn invalidate(&self) {
        *self.last.lock().await = None;
    }
}

/// Binding of one entity to its remote url, local table and push channel.
pub struct SyncEndpoint {
    entity: EntityName,
    url: String,
    id_attribute: String,
    channel: Channel,
    user: Option<String>,
    priority: Priority,
    store: LocalStore,
    push: RwLock<Option<Arc<dyn PushChannel>>>,
    state: RwLock<ConnectionState>,
    pub(crate) changes_gate: RequestGate,
    pub(crate) info_gate: RequestGate,
}

impl std::fmt::Debug for SyncEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEndpoint")
            .field("entity", &self.entity)
            .field("url", &self.url)
            .field("channel", &self.channel.id)
            .field("priority", &self.priority)
            .field("state", &self.state())
            .field("push", &self.has_push())
            .finish()
    }
}

impl SyncEndpoint {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        entity: impl Into<EntityName>,
        url: impl Into<String>,
        id_attribute: impl Into<String>,
        channel: Channel,
        user: Option<String>,
        priority: Priority,
        store: LocalStore,
        request_window: Duration,
    ) -> Self {
        Self {
            entity: entity.into(),
            url: url.into().trim_end_matches('/').to_string(),
            id_attribute: id_attribute.into(),
            channel,
            user,
            priority,
            store,
            push: RwLock::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            changes_gate: RequestGate::new(request_window),
            info_gate: RequestGate::new(request_window),
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn id_attribute(&self) -> &str {
        &self.id_attribute
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel.id
    }

    /// User the endpoint was bound for.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) -> ConnectionState {
        std::mem::replace(&mut *self.state.write(), state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn push(&self) -> Option<Arc<dyn PushChannel>> {
        self.push.read().clone()
    }

    pub fn has_push(&self) -> bool {
        self.push.read().is_some()
    }

    pub(crate) fn set_push(&self, channel: Option<Arc<dyn PushChannel>>) {
        *self.push.write() = channel;
    }

    /// Whether the endpoint may talk to the remote for `user`.
    pub fn accepts(&self, user: Option<&str>) -> bool {
        self.user.as_deref() == user
    }

    /// `{url}/{id}`
    pub fn record_url(&self, id: &str) -> String {
        format!("{}/{}", self.url, id)
    }

    /// `{url}/changes/{since}`
    pub fn changes_url(&self, since: Timestamp) -> String {
        format!("{}/changes/{}", self.url, since)
    }

    /// `{url}/info`
    pub fn info_url(&self) -> String {
        format!("{}/info", self.url)
    }

    /// `{url}?{query}`
    pub fn query_url(&self, query: &GetQuery) -> SyncResult<String> {
        let pairs = query.to_query_pairs();
        if pairs.is_empty() {
            return Ok(self.url.clone());
        }
        let url = reqwest::Url::parse_with_params(&self.url, &pairs)
            .map_err(|e| SyncError::Configuration(format!("invalid url '{}': {}", self.url, e)))?;
        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn endpoint() -> SyncEndpoint {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        let channel = Channel::derive("https://api.example.com", "tasks", Some("u1"));
        let store = LocalStore::open(pool, channel.table.clone(), "id")
            .await
            .unwrap();
        SyncEndpoint::new(
            "tasks",
            "https://api.example.com/tasks/",
            "id",
            channel,
            Some("u1".into()),
            2,
            store,
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn urls_follow_remote_conventions() {
        let endpoint = endpoint().await;
        assert_eq!(endpoint.url(), "https://api.example.com/tasks");
        assert_eq!(endpoint.record_url("7"), "https://api.example.com/tasks/7");
        assert_eq!(
            endpoint.changes_url(42),
            "https://api.example.com/tasks/changes/42"
        );
        assert_eq!(endpoint.info_url(), "https://api.example.com/tasks/info");
        assert_eq!(
            endpoint.query_url(&GetQuery::new()).unwrap(),
            "https://api.example.com/tasks"
        );

        let url = endpoint
            .query_url(&GetQuery::new().with_limit(5).with_offset(10))
            .unwrap();
        assert!(url.starts_with("https://api.example.com/tasks?"));
        assert!(url.contains("limit=5"));
        assert!(url.contains("offset=10"));
    }

    #[tokio::test]
    async fn state_and_identity() {
        let endpoint = endpoint().await;
        assert_eq!(endpoint.state(), ConnectionState::Disconnected);
        let previous = endpoint.set_state(ConnectionState::Connected);
        assert_eq!(previous, ConnectionState::Disconnected);
        assert!(endpoint.is_connected());

        assert!(endpoint.accepts(Some("u1")));
        assert!(!endpoint.accepts(Some("u2")));
        assert!(!endpoint.accepts(None));
        assert_eq!(endpoint.priority(), 2);
    }

    #[tokio::test]
    async fn gate_collapses_requests_within_window() {
        let gate = RequestGate::new(Duration::from_secs(60));
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        for _ in 0..3 {
            let value = gate
                .run(move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::from(1))
                })
                .await
                .unwrap();
            assert_eq!(value, Value::from(1));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        gate.invalidate().await;
        gate.run(move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refresh_bypasses_cached_result() {
        let gate = RequestGate::new(Duration::from_secs(60));
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        gate.run(move || async move { Ok(Value::from(calls.fetch_add(1, Ordering::SeqCst))) })
            .await
            .unwrap();
        let fresh = gate
            .refresh(move || async move { Ok(Value::from(calls.fetch_add(1, Ordering::SeqCst))) })
            .await
            .unwrap();
        assert_eq!(fresh, Value::from(1));

        let cached = gate
            .run(move || async move { Ok(Value::from(calls.fetch_add(1, Ordering::SeqCst))) })
            .await
            .unwrap();
        assert_eq!(cached, Value::from(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_result_expires_after_window() {
        let gate = RequestGate::new(Duration::from_secs(1));
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let fetch = move || async move { Ok(Value::from(calls.fetch_add(1, Ordering::SeqCst))) };

        gate.run(fetch).await.unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(gate.run(fetch).await.unwrap(), Value::from(0));

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(gate.run(fetch).await.unwrap(), Value::from(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_window_never_caches() {
        let gate = RequestGate::new(Duration::ZERO);
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        for _ in 0..2 {
            gate.run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            })
            .await
            .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_requests_are_not_cached() {
        let gate = RequestGate::new(Duration::from_secs(60));
        let err = gate
            .run(|| async { Err(SyncError::Connectivity("down".into())) })
            .await
            .unwrap_err();
        assert!(err.is_connectivity());
        let value = gate.run(|| async { Ok(Value::from(2)) }).await.unwrap();
        assert_eq!(value, Value::from(2));
    }
}
