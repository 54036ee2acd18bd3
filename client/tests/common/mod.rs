//! Shared fakes for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ebb_client::transport::{
    ChannelEvent, HttpError, HttpMethod, OpenChannel, PushChannel, PushTransport, Transport,
};
use ebb_client::{EntityBinding, SyncConfig, SyncStore};
use ebb_engine::record::{merge_patch, record_id, set_record_id};
use ebb_engine::{parse_sort_order, CompileOptions, Filter, GetQuery, LiveMessage, LiveView, Method};
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use serde_json::{json, Value};

pub const ROOT: &str = "http://remote.test/api";

pub fn tasks_url() -> String {
    format!("{}/tasks", ROOT)
}

pub fn test_config() -> SyncConfig {
    SyncConfig::new(ROOT)
        .with_database_url("sqlite::memory:")
        .with_request_window(Duration::ZERO)
}

/// Open a store over `remote` without push and register `tasks`.
pub async fn open_store(remote: &Arc<MemoryRemote>) -> SyncStore {
    open_store_with(remote, test_config()).await
}

pub async fn open_store_with(remote: &Arc<MemoryRemote>, config: SyncConfig) -> SyncStore {
    let store = SyncStore::open(config, remote.clone(), None).await.unwrap();
    store
        .register(EntityBinding::new("tasks", tasks_url()))
        .await
        .unwrap();
    store
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ============================================================================
// In-memory remote
// ============================================================================

#[derive(Debug, Default)]
struct RemoteState {
    online: bool,
    clock: u64,
    next_id: u64,
    assign_ids: bool,
    collections: HashMap<String, Vec<Value>>,
    changes: HashMap<String, Vec<LiveMessage>>,
    requests: Vec<(HttpMethod, String)>,
    failures: VecDeque<(HttpMethod, String, HttpError)>,
}

/// A remote service kept in memory.
///
/// Collections live under [`ROOT`]; every accepted mutation is appended to the
/// collection's changes feed at the next tick of the remote clock.
#[derive(Debug)]
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
    held: Mutex<Option<HttpMethod>>,
    arrived: Notify,
    released: Notify,
}

impl MemoryRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RemoteState {
                online: true,
                ..RemoteState::default()
            }),
            held: Mutex::new(None),
            arrived: Notify::new(),
            released: Notify::new(),
        })
    }

    /// Keep the next `method` request waiting until [`release_held`](Self::release_held).
    pub fn hold(&self, method: HttpMethod) {
        *self.held.lock() = Some(method);
    }

    /// Wait for the held request to arrive.
    pub async fn wait_held(&self) {
        self.arrived.notified().await;
    }

    pub fn release_held(&self) {
        *self.held.lock() = None;
        self.released.notify_one();
    }

    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
    }

    /// Give created records a remote id instead of keeping the client's.
    pub fn assign_ids(&self, assign: bool) {
        self.state.lock().assign_ids = assign;
    }

    /// Store records directly, recording them in the changes feed.
    pub fn seed(&self, entity: &str, records: Vec<Value>) {
        let mut state = self.state.lock();
        for record in records {
            let id = record_id(&record, "id").unwrap_or_default();
            state.upsert(entity, &id, record.clone());
            state.log(entity, LiveMessage::new(id, Method::Create, record));
        }
    }

    /// Change a record as another client would.
    pub fn remote_update(&self, entity: &str, record: Value) {
        let mut state = self.state.lock();
        let id = record_id(&record, "id").unwrap_or_default();
        state.upsert(entity, &id, record.clone());
        state.log(entity, LiveMessage::new(id, Method::Update, record));
    }

    /// Remove a record without a trace in the changes feed.
    pub fn silent_remove(&self, entity: &str, id: &str) {
        let mut state = self.state.lock();
        if let Some(records) = state.collections.get_mut(entity) {
            records.retain(|r| record_id(r, "id").as_deref() != Some(id));
        }
    }

    /// Fail the next `method` request whose url ends with `suffix`.
    pub fn fail_next(&self, method: HttpMethod, suffix: &str, status: u16) {
        self.state.lock().failures.push_back((
            method,
            suffix.to_string(),
            HttpError::status(status, "Scripted failure"),
        ));
    }

    pub fn records(&self, entity: &str) -> Vec<Value> {
        self.state
            .lock()
            .collections
            .get(entity)
            .cloned()
            .unwrap_or_default()
    }

    pub fn record(&self, entity: &str, id: &str) -> Option<Value> {
        self.state.lock().find(entity, id).cloned()
    }

    pub fn requests(&self) -> Vec<(HttpMethod, String)> {
        self.state.lock().requests.clone()
    }

    pub fn count_requests(&self, method: HttpMethod, fragment: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(m, url)| *m == method && url.contains(fragment))
            .count()
    }

    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    pub fn clock(&self) -> u64 {
        self.state.lock().clock
    }
}

impl RemoteState {
    fn find(&self, entity: &str, id: &str) -> Option<&Value> {
        self.collections
            .get(entity)?
            .iter()
            .find(|r| record_id(r, "id").as_deref() == Some(id))
    }

    fn upsert(&mut self, entity: &str, id: &str, record: Value) {
        let records = self.collections.entry(entity.to_string()).or_default();
        match records
            .iter_mut()
            .find(|r| record_id(r, "id").as_deref() == Some(id))
        {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    fn remove(&mut self, entity: &str, id: &str) -> bool {
        let Some(records) = self.collections.get_mut(entity) else {
            return false;
        };
        let before = records.len();
        records.retain(|r| record_id(r, "id").as_deref() != Some(id));
        records.len() != before
    }

    fn log(&mut self, entity: &str, message: LiveMessage) {
        self.clock += 1;
        let message = message.with_time(self.clock);
        self.changes.entry(entity.to_string()).or_default().push(message);
    }

    fn query(&self, entity: &str, pairs: &[(String, String)]) -> Result<Value, HttpError> {
        let mut query = GetQuery::new();
        let mut sort = Vec::new();
        for (key, value) in pairs {
            match key.as_str() {
                "limit" => query.limit = value.parse().ok(),
                "offset" => query.offset = value.parse().ok(),
                "sortOrder" => sort.push(value.clone()),
                "field" => query.fields.push(value.clone()),
                "filter" => {
                    let json: Value = serde_json::from_str(value)
                        .map_err(|e| HttpError::status(400, e.to_string()))?;
                    query.filter = Some(
                        Filter::from_json(&json).map_err(|e| HttpError::status(400, e.to_string()))?,
                    );
                }
                _ => {}
            }
        }
        query.sort_order =
            parse_sort_order(&sort[..]).map_err(|e| HttpError::status(400, e.to_string()))?;

        let start = query.start();
        let limit = query.limit;
        let view = LiveView::new(query, CompileOptions::default())
            .map_err(|e| HttpError::status(400, e.to_string()))?;
        let records = self.collections.get(entity).cloned().unwrap_or_default();
        Ok(Value::Array(view.select(records, start, limit)))
    }
}

fn not_found() -> HttpError {
    HttpError::status(404, "Not Found")
}

#[async_trait]
impl Transport for MemoryRemote {
    async fn request(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, HttpError> {
        let held = {
            let mut slot = self.held.lock();
            *slot == Some(method) && slot.take().is_some()
        };
        if held {
            self.arrived.notify_one();
            self.released.notified().await;
        }

        let mut state = self.state.lock();
        state.requests.push((method, url.to_string()));
        if !state.online {
            return Err(HttpError::connectivity("remote offline"));
        }
        if let Some(index) = state
            .failures
            .iter()
            .position(|(m, suffix, _)| *m == method && url.ends_with(suffix.as_str()))
        {
            if let Some((_, _, error)) = state.failures.remove(index) {
                return Err(error);
            }
        }

        let parsed = reqwest::Url::parse(url).map_err(|e| HttpError::status(400, e.to_string()))?;
        let path = parsed
            .path()
            .strip_prefix("/api/")
            .ok_or_else(not_found)?
            .trim_end_matches('/')
            .to_string();
        let segments: Vec<&str> = path.split('/').collect();
        let pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        match (method, segments.as_slice()) {
            (HttpMethod::Get, [_, "info"]) => Ok(json!({ "timestamp": state.clock })),
            (HttpMethod::Get, [entity, "changes", since]) => {
                let since: u64 = since.parse().unwrap_or(0);
                let messages: Vec<&LiveMessage> = state
                    .changes
                    .get(*entity)
                    .map(|log| log.iter().filter(|m| m.time.unwrap_or(0) > since).collect())
                    .unwrap_or_default();
                Ok(json!({ "messages": messages, "timestamp": state.clock }))
            }
            (HttpMethod::Get, [entity]) => state.query(entity, &pairs),
            (HttpMethod::Get, [entity, id]) => state.find(entity, id).cloned().ok_or_else(not_found),
            (HttpMethod::Post, [entity]) => {
                let mut record = body.cloned().unwrap_or(Value::Null);
                let id = match record_id(&record, "id") {
                    Some(_) if state.assign_ids => None,
                    other => other,
                };
                let id = id.unwrap_or_else(|| {
                    state.next_id += 1;
                    format!("srv-{}", state.next_id)
                });
                set_record_id(&mut record, "id", &id);
                state.upsert(entity, &id, record.clone());
                state.log(entity, LiveMessage::new(id, Method::Create, record.clone()));
                Ok(record)
            }
            (HttpMethod::Put, [entity, id]) => {
                if state.find(entity, id).is_none() {
                    return Err(not_found());
                }
                let mut record = body.cloned().unwrap_or(Value::Null);
                set_record_id(&mut record, "id", id);
                state.upsert(entity, id, record.clone());
                state.log(entity, LiveMessage::new(*id, Method::Update, record.clone()));
                Ok(record)
            }
            (HttpMethod::Patch, [entity, id]) => {
                let Some(mut record) = state.find(entity, id).cloned() else {
                    return Err(not_found());
                };
                if let Some(changes) = body {
                    merge_patch(&mut record, changes);
                }
                state.upsert(entity, id, record.clone());
                state.log(entity, LiveMessage::new(*id, Method::Patch, record.clone()));
                Ok(record)
            }
            (HttpMethod::Delete, [entity, id]) => {
                if !state.remove(entity, id) {
                    return Err(not_found());
                }
                let mut gone = Value::Null;
                set_record_id(&mut gone, "id", id);
                state.log(entity, LiveMessage::new(*id, Method::Delete, gone));
                Ok(Value::Null)
            }
            _ => Err(not_found()),
        }
    }
}

// ============================================================================
// Push transport
// ============================================================================

type Emitted = Arc<Mutex<Vec<(String, String, Value)>>>;

/// A push transport whose channel events are injected by the test.
#[derive(Debug, Default)]
pub struct FakePush {
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<ChannelEvent>>>,
    emitted: Emitted,
}

impl FakePush {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver an event on every open channel whose id starts with `prefix`.
    pub fn send(&self, prefix: &str, event: ChannelEvent) -> usize {
        let senders = self.senders.lock();
        senders
            .iter()
            .filter(|(resource, _)| resource.starts_with(prefix))
            .filter(|(_, sender)| sender.unbounded_send(event.clone()).is_ok())
            .count()
    }

    pub fn open_channels(&self) -> Vec<String> {
        self.senders.lock().keys().cloned().collect()
    }

    /// Events emitted by the client: (channel, event name, payload).
    pub fn emitted(&self) -> Vec<(String, String, Value)> {
        self.emitted.lock().clone()
    }
}

struct FakeChannel {
    resource: String,
    emitted: Emitted,
    owner: Arc<FakePush>,
}

#[async_trait]
impl PushChannel for FakeChannel {
    async fn emit(&self, event: &str, payload: Value) -> Result<(), HttpError> {
        self.emitted
            .lock()
            .push((self.resource.clone(), event.to_string(), payload));
        Ok(())
    }

    async fn close(&self) {
        self.owner.senders.lock().remove(&self.resource);
    }
}

/// Opens channels on a shared [`FakePush`].
#[derive(Debug, Clone)]
pub struct FakePushTransport(pub Arc<FakePush>);

#[async_trait]
impl PushTransport for FakePushTransport {
    async fn open(&self, _host: &str, resource: &str) -> Result<OpenChannel, HttpError> {
        let (sender, receiver) = mpsc::unbounded();
        self.0.senders.lock().insert(resource.to_string(), sender);
        Ok(OpenChannel {
            channel: Box::new(FakeChannel {
                resource: resource.to_string(),
                emitted: self.0.emitted.clone(),
                owner: self.0.clone(),
            }),
            events: receiver.boxed(),
        })
    }
}
