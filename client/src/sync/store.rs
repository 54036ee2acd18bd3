//! The sync orchestrator.
//!
//! A [`SyncStore`] owns the endpoints of one remote root, the shared offline
//! queue and channel timestamps, and the per-endpoint connectivity state
//! machine. Every local mutation goes through [`SyncStore::sync`]; every
//! change that reaches local storage, local or remote, goes through one apply
//! path that writes through and then notifies the entity's channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ebb_engine::channel::is_under_root;
use ebb_engine::record::{fix_server_id, record_id, set_record_id};
use ebb_engine::{
    Channel, EntityName, GetQuery, LiveMessage, Method, OfflineMessage, Origin, SendClock,
    Timestamp, DEFAULT_ID_ATTRIBUTE,
};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use super::endpoint::{ConnectionState, SyncEndpoint};
use super::events::{ChannelNotice, EventHub, NoticeReceiver};
use crate::config::{SyncConfig, UnkeyedMessagePolicy};
use crate::db::{create_pool, Completion, MessageQueue, Pool, TimestampStore};
use crate::error::{SyncError, SyncResult};
use crate::session::SessionContext;
use crate::transport::push::BIND_EVENT;
use crate::transport::{ChannelEvent, HttpMethod, OpenChannel, PushTransport, Transport};

/// How an entity is bound to the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityBinding {
    pub entity: EntityName,
    /// Collection url, at or below the remote root
    pub url: String,
    pub id_attribute: String,
}

impl EntityBinding {
    pub fn new(entity: impl Into<EntityName>, url: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            url: url.into(),
            id_attribute: DEFAULT_ID_ATTRIBUTE.to_string(),
        }
    }

    pub fn with_id_attribute(mut self, id_attribute: impl Into<String>) -> Self {
        self.id_attribute = id_attribute.into();
        self
    }
}

/// Records returned by a read, and where they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub records: Vec<Value>,
    /// `Local` results are unfiltered and unsorted
    pub origin: Origin,
}

/// Remote answer to a queued message, kept for the caller waiting on it.
#[derive(Debug, Clone, PartialEq)]
enum Delivery {
    Accepted(Value),
    Rejected { status: u16, message: String },
}

struct Inner {
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    push: Option<Arc<dyn PushTransport>>,
    pool: Pool,
    queue: MessageQueue,
    timestamps: TimestampStore,
    endpoints: DashMap<EntityName, Arc<SyncEndpoint>>,
    events: Arc<EventHub>,
    session: RwLock<SessionContext>,
    clock: Mutex<SendClock>,
    /// Held for the duration of one replay pass
    replay: tokio::sync::Mutex<()>,
    /// Entity whose message is being delivered
    replaying: Mutex<Option<EntityName>>,
    /// Entity whose replay was cut off by a connectivity loss
    disconnected_entity: Mutex<Option<EntityName>>,
    outcomes: DashMap<String, Option<Delivery>>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a sync orchestrator. Clones share state.
#[derive(Clone)]
pub struct SyncStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStore")
            .field("remote_root", &self.inner.config.remote_root)
            .field("endpoints", &self.inner.endpoints.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SyncStore {
    /// Open the store's database and load the offline queue.
    pub async fn open(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        push: Option<Arc<dyn PushTransport>>,
    ) -> SyncResult<Self> {
        let pool = create_pool(&config.database_url)
            .await
            .map_err(|e| SyncError::storage(format!("open {}", config.database_url), e))?;
        Self::with_pool(config, pool, transport, push).await
    }

    /// Build a store over an existing pool.
    pub async fn with_pool(
        config: SyncConfig,
        pool: Pool,
        transport: Arc<dyn Transport>,
        push: Option<Arc<dyn PushTransport>>,
    ) -> SyncResult<Self> {
        if config.remote_root.trim().is_empty() {
            return Err(SyncError::Configuration("remote root is empty".into()));
        }

        let queue = MessageQueue::open(pool.clone()).await?;
        let timestamps = TimestampStore::open(pool.clone()).await?;
        let clock = SendClock::with_last(queue.last_time().await);
        let push = push.filter(|_| config.push_enabled);

        tracing::info!(
            remote_root = %config.remote_root,
            pending = queue.len().await,
            push = push.is_some(),
            "Sync store opened"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                transport,
                push,
                pool,
                queue,
                timestamps,
                endpoints: DashMap::new(),
                events: EventHub::new_shared(),
                session: RwLock::new(SessionContext::anonymous()),
                clock: Mutex::new(clock),
                replay: tokio::sync::Mutex::new(()),
                replaying: Mutex::new(None),
                disconnected_entity: Mutex::new(None),
                outcomes: DashMap::new(),
                closed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.inner.events
    }

    pub fn session(&self) -> SessionContext {
        self.inner.session.read().clone()
    }

    /// Switch the acting identity.
    ///
    /// Endpoints bound for a different user stop talking to the remote until
    /// the matching session is restored.
    pub fn set_session(&self, session: SessionContext) {
        let previous = std::mem::replace(&mut *self.inner.session.write(), session.clone());
        if previous != session {
            tracing::info!(user = ?session.user_id(), "Session changed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        Ok(())
    }

    /// Endpoint of a registered entity.
    pub fn endpoint(&self, entity: &str) -> SyncResult<Arc<SyncEndpoint>> {
        self.find_endpoint(entity)
            .ok_or_else(|| SyncError::NotRegistered(entity.to_string()))
    }

    fn find_endpoint(&self, entity: &str) -> Option<Arc<SyncEndpoint>> {
        self.inner
            .endpoints
            .get(entity)
            .map(|endpoint| Arc::clone(endpoint.value()))
    }

    /// Subscribe to an entity's channel.
    pub fn subscribe(&self, entity: &str) -> SyncResult<NoticeReceiver> {
        let endpoint = self.endpoint(entity)?;
        Ok(self.inner.events.subscribe(endpoint.channel_id()))
    }

    /// Messages still waiting for the remote, in replay order.
    pub async fn pending_messages(&self) -> Vec<OfflineMessage> {
        self.inner.queue.all().await
    }

    /// Current timestamp of an entity's channel.
    pub async fn timestamp(&self, entity: &str) -> SyncResult<Timestamp> {
        let endpoint = self.endpoint(entity)?;
        Ok(self.inner.timestamps.get(endpoint.channel_id()).await)
    }

    /// Forget an entity's channel timestamp so the next read starts over.
    pub async fn clear_timestamp(&self, entity: &str) -> SyncResult<()> {
        let endpoint = self.endpoint(entity)?;
        self.inner.timestamps.clear(endpoint.channel_id()).await?;
        endpoint.changes_gate.invalidate().await;
        endpoint.info_gate.invalidate().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Registration and connectivity
    // ------------------------------------------------------------------

    /// Bind an entity to its remote collection.
    ///
    /// Registering an entity again with the same url returns the existing
    /// endpoint; a different url is a configuration error.
    pub async fn register(&self, binding: EntityBinding) -> SyncResult<Arc<SyncEndpoint>> {
        self.ensure_open()?;
        let root = &self.inner.config.remote_root;
        if !is_under_root(root, &binding.url) {
            return Err(SyncError::Configuration(format!(
                "url '{}' of '{}' is not under remote root '{}'",
                binding.url, binding.entity, root
            )));
        }
        if let Some(existing) = self.find_endpoint(&binding.entity) {
            return check_rebind(existing, &binding);
        }

        let user = self.inner.session.read().user_id().map(str::to_string);
        let channel = Channel::derive(root, &binding.entity, user.as_deref());
        let store = crate::db::LocalStore::open(
            self.inner.pool.clone(),
            channel.table.clone(),
            binding.id_attribute.clone(),
        )
        .await?;
        let endpoint = Arc::new(SyncEndpoint::new(
            binding.entity.clone(),
            binding.url.clone(),
            binding.id_attribute.clone(),
            channel,
            user,
            self.inner.config.priority_of(&binding.entity),
            store,
            self.inner.config.request_window,
        ));

        match self.inner.endpoints.entry(binding.entity.clone()) {
            Entry::Occupied(slot) => return check_rebind(Arc::clone(slot.get()), &binding),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&endpoint));
            }
        }
        tracing::info!(
            entity = %endpoint.entity(),
            channel = %endpoint.channel_id(),
            priority = endpoint.priority(),
            "Registered endpoint"
        );

        match self.inner.push.clone() {
            Some(push) => self.open_push(&endpoint, push).await,
            None => self.connect(endpoint.entity()).await?,
        }
        Ok(endpoint)
    }

    async fn open_push(&self, endpoint: &Arc<SyncEndpoint>, push: Arc<dyn PushTransport>) {
        let host = remote_host(&self.inner.config.remote_root);
        let OpenChannel { channel, events } = match push.open(&host, endpoint.channel_id()).await
        {
            Ok(opened) => opened,
            Err(e) => {
                tracing::warn!(
                    entity = %endpoint.entity(),
                    error = %e,
                    "Could not open push channel"
                );
                return;
            }
        };
        endpoint.set_push(Some(Arc::from(channel)));

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let entity = endpoint.entity().to_string();
        let handle = tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.next().await {
                let Some(inner) = weak.upgrade() else { break };
                let store = SyncStore { inner };
                if let Err(e) = store.handle_channel_event(&entity, event).await {
                    tracing::warn!(entity = %entity, error = %e, "Channel event failed");
                }
            }
            tracing::debug!(entity = %entity, "Push channel closed");
        });
        self.inner.tasks.lock().push(handle);
    }

    /// React to an event of an entity's push channel.
    pub async fn handle_channel_event(&self, entity: &str, event: ChannelEvent) -> SyncResult<()> {
        self.ensure_open()?;
        let endpoint = self.endpoint(entity)?;
        match event {
            ChannelEvent::Connected => self.connect(entity).await,
            ChannelEvent::Disconnected => {
                let was_replaying = self.inner.replaying.lock().as_deref() == Some(entity);
                if was_replaying {
                    *self.inner.disconnected_entity.lock() = Some(entity.to_string());
                }
                self.mark_disconnected(&endpoint);
                Ok(())
            }
            ChannelEvent::Message(message) => self.apply_message(&endpoint, message).await,
        }
    }

    /// Bring an endpoint online.
    ///
    /// Announces the channel timestamp, pulls changes since then and replays
    /// the offline queue. A connectivity failure on the way leaves the
    /// endpoint disconnected without error.
    pub async fn connect(&self, entity: &str) -> SyncResult<()> {
        self.ensure_open()?;
        let endpoint = self.endpoint(entity)?;
        self.check_identity(&endpoint)?;

        endpoint.set_state(ConnectionState::Connecting);
        let channel = endpoint.channel_id().clone();
        let timestamp = self.inner.timestamps.get(&channel).await;
        tracing::debug!(entity, channel = %channel, timestamp, "Connecting");

        if let Some(push) = endpoint.push() {
            let bind = json!({ "channel": channel, "timestamp": timestamp });
            if let Err(e) = push.emit(BIND_EVENT, bind).await {
                tracing::warn!(entity, error = %e, "Could not bind channel");
                self.mark_disconnected(&endpoint);
                return Ok(());
            }
        }

        if timestamp > 0 {
            match self.fetch_changes(&endpoint).await {
                Ok(_) => {}
                Err(e) if e.is_connectivity() => {
                    self.mark_disconnected(&endpoint);
                    return Ok(());
                }
                Err(e) => tracing::warn!(entity, error = %e, "Fetching changes failed"),
            }
        }

        let may_replay = {
            let mut marker = self.inner.disconnected_entity.lock();
            if marker.as_deref() == Some(entity) {
                *marker = None;
            }
            marker.is_none()
        };
        if may_replay {
            self.send_messages().await?;
        }

        if endpoint.state() == ConnectionState::Connecting {
            endpoint.set_state(ConnectionState::Connected);
            self.inner
                .events
                .publish(&channel, ChannelNotice::Connect);
            tracing::info!(entity, channel = %channel, "Connected");
        }
        Ok(())
    }

    fn mark_disconnected(&self, endpoint: &SyncEndpoint) {
        let previous = endpoint.set_state(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            self.inner
                .events
                .publish(endpoint.channel_id(), ChannelNotice::Disconnect);
            tracing::info!(entity = %endpoint.entity(), "Disconnected");
        }
    }

    /// Refuse remote work for an endpoint bound to another user.
    fn check_identity(&self, endpoint: &SyncEndpoint) -> SyncResult<()> {
        if self.identity_matches(endpoint) {
            return Ok(());
        }
        tracing::warn!(
            entity = %endpoint.entity(),
            "Session user differs from bound user"
        );
        self.mark_disconnected(endpoint);
        Err(SyncError::IdentityChanged {
            entity: endpoint.entity().to_string(),
        })
    }

    fn identity_matches(&self, endpoint: &SyncEndpoint) -> bool {
        endpoint.accepts(self.inner.session.read().user_id())
    }

    // ------------------------------------------------------------------
    // Applying changes
    // ------------------------------------------------------------------

    /// Apply a change to local storage and notify the entity's channel.
    ///
    /// The message's time, if any, becomes the channel timestamp. A failed
    /// write leaves the timestamp alone and is reported on the channel as an
    /// error notice as well as returned.
    pub async fn apply_message(&self, endpoint: &SyncEndpoint, message: LiveMessage) -> SyncResult<()> {
        let time = message.time;
        self.apply_unstamped(endpoint, message).await?;
        if let Some(time) = time {
            self.inner
                .timestamps
                .set(endpoint.channel_id(), time)
                .await?;
        }
        Ok(())
    }

    async fn apply_unstamped(&self, endpoint: &SyncEndpoint, message: LiveMessage) -> SyncResult<()> {
        let id = message.id.clone();
        match self.write_through(endpoint, message).await {
            Ok(applied) => {
                self.inner
                    .events
                    .publish(endpoint.channel_id(), ChannelNotice::Message(applied));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    entity = %endpoint.entity(),
                    record_id = %id,
                    error = %e,
                    "Could not apply message"
                );
                self.inner.events.publish(
                    endpoint.channel_id(),
                    ChannelNotice::Error {
                        message: e.to_string(),
                        record_id: Some(id),
                    },
                );
                Err(e)
            }
        }
    }

    /// Write a change to the endpoint's table, returning the message as
    /// subscribers should see it.
    async fn write_through(
        &self,
        endpoint: &SyncEndpoint,
        mut message: LiveMessage,
    ) -> SyncResult<LiveMessage> {
        let store = endpoint.store();
        let id_attribute = endpoint.id_attribute();

        if message.is_reset() {
            let mut records = match std::mem::take(&mut message.data) {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                other => vec![other],
            };
            for record in &mut records {
                fix_server_id(record, id_attribute, None);
            }
            store.replace_all(&records).await?;
            message.data = Value::Array(records);
            return Ok(message);
        }

        fix_server_id(&mut message.data, id_attribute, Some(message.id.as_str()));
        let id = record_id(&message.data, id_attribute).unwrap_or_else(|| message.id.clone());
        match message.method {
            Method::Create | Method::Update => store.put(std::slice::from_ref(&message.data)).await?,
            Method::Patch => message.data = store.patch(&id, &message.data).await?,
            Method::Delete => store.delete(&[id]).await?,
            Method::Read => {}
        }
        Ok(message)
    }

    /// Pull and apply the changes made since the channel timestamp.
    ///
    /// Returns the number of messages applied. Concurrent calls within the
    /// request window share one fetch.
    async fn fetch_changes(&self, endpoint: &SyncEndpoint) -> SyncResult<usize> {
        self.pull_changes(endpoint, false).await
    }

    /// Like [`fetch_changes`](Self::fetch_changes), but always asks the
    /// remote.
    async fn refetch_changes(&self, endpoint: &SyncEndpoint) -> SyncResult<usize> {
        self.pull_changes(endpoint, true).await
    }

    async fn pull_changes(&self, endpoint: &SyncEndpoint, fresh: bool) -> SyncResult<usize> {
        let fetch = move || async move {
            let channel = endpoint.channel_id();
            let since = self.inner.timestamps.get(channel).await;
            let response = self
                .inner
                .transport
                .request(HttpMethod::Get, &endpoint.changes_url(since), None)
                .await?;

            let (messages, timestamp) = split_changes(response);
            let mut applied = 0usize;
            let mut failed = false;
            for item in messages {
                let message = match serde_json::from_value::<LiveMessage>(item) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "Skipping malformed change");
                        failed = true;
                        continue;
                    }
                };
                let time = message.time;
                match self.apply_unstamped(endpoint, message).await {
                    Ok(()) => {
                        applied += 1;
                        if let (Some(time), false) = (time, failed) {
                            self.inner.timestamps.set(channel, time).await?;
                        }
                    }
                    Err(_) => failed = true,
                }
            }
            if let (Some(timestamp), false) = (timestamp, failed) {
                self.inner.timestamps.set(channel, timestamp).await?;
            }
            tracing::debug!(channel = %channel, since, applied, "Fetched changes");
            Ok::<_, SyncError>(Value::from(applied))
        };
        let applied = if fresh {
            endpoint.changes_gate.refresh(fetch).await?
        } else {
            endpoint.changes_gate.run(fetch).await?
        };
        Ok(applied.as_u64().unwrap_or(0) as usize)
    }

    /// Fetch server metadata and start the channel at its timestamp.
    async fn fetch_info(&self, endpoint: &SyncEndpoint) -> SyncResult<()> {
        let info = endpoint
            .info_gate
            .run(move || async move {
                let info = self
                    .inner
                    .transport
                    .request(HttpMethod::Get, &endpoint.info_url(), None)
                    .await?;
                Ok::<_, SyncError>(info)
            })
            .await?;
        if let Some(timestamp) = info.get("timestamp").and_then(Value::as_u64) {
            self.inner
                .timestamps
                .set(endpoint.channel_id(), timestamp)
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Offline queue replay
    // ------------------------------------------------------------------

    /// Deliver queued messages in replay order.
    ///
    /// Only one pass runs at a time; a call made during a pass waits for it
    /// and then runs its own. A pass stops at a message whose entity is not
    /// registered or not acting for the current session, and at the first
    /// connectivity failure.
    pub async fn send_messages(&self) -> SyncResult<()> {
        let _pass = self.inner.replay.lock().await;

        loop {
            if self.is_closed() {
                break;
            }
            let Some(message) = self.inner.queue.front().await else {
                *self.inner.disconnected_entity.lock() = None;
                break;
            };

            let Some(entity) = message.entity().map(str::to_string) else {
                match self.inner.config.unkeyed_messages {
                    UnkeyedMessagePolicy::Discard => {
                        tracing::warn!(message_id = %message.id, "Discarding message without entity");
                        self.inner.queue.remove(&message.id).await?;
                        continue;
                    }
                    UnkeyedMessagePolicy::Fail => {
                        return Err(ebb_engine::Error::InvalidMessageId(message.id).into());
                    }
                }
            };

            let Some(endpoint) = self.find_endpoint(&entity) else {
                tracing::debug!(entity = %entity, "Replay waits for registration");
                break;
            };
            if !self.identity_matches(&endpoint) {
                tracing::debug!(entity = %entity, "Replay waits for matching session");
                break;
            }

            *self.inner.replaying.lock() = Some(entity.clone());
            self.inner.queue.begin(&message).await;
            let outcome = self.deliver(&endpoint, &message).await;
            *self.inner.replaying.lock() = None;

            match outcome {
                Ok(response) => {
                    let server_id = moved_id(&endpoint, &message, &response);
                    let completion = self
                        .inner
                        .queue
                        .complete(&message, server_id.as_deref(), endpoint.id_attribute())
                        .await?;
                    match completion {
                        Completion::Removed | Completion::Missing => {
                            self.absorb_response(&endpoint, &message, server_id, &response)
                                .await;
                        }
                        Completion::Superseded(current) => {
                            if let Some(server_id) = server_id {
                                self.move_local(&endpoint, &message.record_id, &server_id, &current)
                                    .await;
                            }
                        }
                    }
                    self.process_result(&endpoint, &message, None).await;
                    self.settle(&message.id, Delivery::Accepted(response));
                }
                Err(e) if e.is_connectivity() => {
                    self.inner.queue.release().await;
                    tracing::info!(
                        entity = %entity,
                        message_id = %message.id,
                        "Replay stopped, remote unreachable"
                    );
                    self.mark_disconnected(&endpoint);
                    *self.inner.disconnected_entity.lock() = Some(entity);
                    break;
                }
                Err(e) => {
                    self.process_result(&endpoint, &message, Some(&e)).await;
                    self.inner.queue.discard(&message).await?;
                    let delivery = match e {
                        SyncError::Rejected { status, message: text } => Delivery::Rejected {
                            status,
                            message: text,
                        },
                        other => Delivery::Rejected {
                            status: 0,
                            message: other.to_string(),
                        },
                    };
                    self.settle(&message.id, delivery);
                }
            }
        }
        Ok(())
    }

    fn settle(&self, message_id: &str, delivery: Delivery) {
        if let Some(mut slot) = self.inner.outcomes.get_mut(message_id) {
            *slot = Some(delivery);
        }
    }

    /// Send one message, returning the remote's answer with its id fixed up.
    async fn deliver(&self, endpoint: &SyncEndpoint, message: &OfflineMessage) -> SyncResult<Value> {
        let method = HttpMethod::from(message.method);
        let (url, body) = match message.method {
            Method::Create => (endpoint.url().to_string(), Some(&message.data)),
            Method::Delete | Method::Read => (endpoint.record_url(&message.record_id), None),
            Method::Update | Method::Patch => {
                (endpoint.record_url(&message.record_id), Some(&message.data))
            }
        };
        tracing::debug!(
            message_id = %message.id,
            %method,
            url = %url,
            "Delivering offline message"
        );

        let mut response = self.inner.transport.request(method, &url, body).await?;
        if message.method != Method::Delete && response.is_object() {
            fix_server_id(
                &mut response,
                endpoint.id_attribute(),
                Some(message.record_id.as_str()),
            );
        }
        Ok(response)
    }

    /// Apply the remote's version of a delivered record.
    ///
    /// A created record that came back under `server_id` moves to that id.
    async fn absorb_response(
        &self,
        endpoint: &SyncEndpoint,
        message: &OfflineMessage,
        server_id: Option<String>,
        response: &Value,
    ) {
        if message.method == Method::Delete || !response.is_object() {
            return;
        }
        let result = match server_id {
            Some(server_id) => {
                tracing::debug!(
                    entity = %endpoint.entity(),
                    local_id = %message.record_id,
                    server_id = %server_id,
                    "Remote assigned a new id"
                );
                let mut old = Value::Null;
                set_record_id(&mut old, endpoint.id_attribute(), &message.record_id);
                match self
                    .apply_message(endpoint, LiveMessage::new(message.record_id.clone(), Method::Delete, old))
                    .await
                {
                    Ok(()) => {
                        self.apply_message(endpoint, LiveMessage::new(server_id, Method::Create, response.clone()))
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
            None => {
                let method = if message.method == Method::Patch {
                    Method::Patch
                } else {
                    Method::Update
                };
                self.apply_message(
                    endpoint,
                    LiveMessage::new(message.record_id.clone(), method, response.clone()),
                )
                .await
            }
        };
        if let Err(e) = result {
            tracing::debug!(message_id = %message.id, error = %e, "Response not absorbed");
        }
    }

    /// Move the local record of a created message to its server id, keeping
    /// the changes made while the create was in flight.
    async fn move_local(
        &self,
        endpoint: &SyncEndpoint,
        local_id: &str,
        server_id: &str,
        current: &OfflineMessage,
    ) {
        let store = endpoint.store();
        let local = match store.get(local_id).await {
            Ok(local) => local,
            Err(e) => {
                tracing::warn!(local_id, error = %e, "Could not read record to move");
                return;
            }
        };
        let Some(mut record) = local else { return };

        let mut old = Value::Null;
        set_record_id(&mut old, endpoint.id_attribute(), local_id);
        let mut result = self
            .apply_message(endpoint, LiveMessage::new(local_id, Method::Delete, old))
            .await;
        if result.is_ok() && current.method != Method::Delete {
            set_record_id(&mut record, endpoint.id_attribute(), server_id);
            result = self
                .apply_message(endpoint, LiveMessage::new(server_id, Method::Create, record))
                .await;
        }
        if let Err(e) = result {
            tracing::warn!(local_id, server_id, error = %e, "Could not move record to server id");
        }
    }

    /// Settle local state after the remote answered a message.
    ///
    /// On success without a push channel the changes feed is pulled so the
    /// message's own effect is absorbed. On rejection the canonical record is
    /// fetched back: a gone record is deleted locally, otherwise the remote
    /// version replaces the local one. Rejections are then reported on the
    /// channel unless conflicts are silenced.
    async fn process_result(
        &self,
        endpoint: &SyncEndpoint,
        message: &OfflineMessage,
        error: Option<&SyncError>,
    ) {
        let Some(error) = error else {
            if !endpoint.has_push() && self.inner.timestamps.get(endpoint.channel_id()).await > 0 {
                if let Err(e) = self.refetch_changes(endpoint).await {
                    tracing::debug!(entity = %endpoint.entity(), error = %e, "Follow-up fetch failed");
                }
            }
            return;
        };

        tracing::warn!(
            message_id = %message.id,
            error = %error,
            "Remote rejected offline message"
        );

        let url = endpoint.record_url(&message.record_id);
        let canonical = self
            .inner
            .transport
            .request(HttpMethod::Get, &url, None)
            .await
            .map_err(SyncError::from);
        let id_attribute = endpoint.id_attribute();
        let resolution = match canonical {
            Ok(record) => {
                self.apply_message(
                    endpoint,
                    LiveMessage::new(message.record_id.clone(), Method::Update, record),
                )
                .await
            }
            Err(e) if e.is_gone() => {
                let mut gone = Value::Null;
                set_record_id(&mut gone, id_attribute, &message.record_id);
                self.apply_message(
                    endpoint,
                    LiveMessage::new(message.record_id.clone(), Method::Delete, gone),
                )
                .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = resolution {
            tracing::warn!(message_id = %message.id, error = %e, "Conflict left unresolved");
        }

        if !self.inner.config.silent_conflicts {
            self.inner.events.publish(
                endpoint.channel_id(),
                ChannelNotice::Error {
                    message: error.to_string(),
                    record_id: Some(message.record_id.clone()),
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Apply a local change and try to deliver it.
    ///
    /// The change is queued and written to local storage first. If the remote
    /// answers during this call its version is returned (or its rejection);
    /// otherwise the local record is returned and the change stays queued.
    pub async fn sync(&self, entity: &str, method: Method, data: Value) -> SyncResult<Value> {
        self.ensure_open()?;
        let endpoint = self.endpoint(entity)?;
        self.check_identity(&endpoint)?;
        let id_attribute = endpoint.id_attribute();

        if method == Method::Read {
            return match record_id(&data, id_attribute) {
                Some(id) => Ok(self.fetch(entity, &id).await?.unwrap_or(Value::Null)),
                None => Ok(Value::Array(
                    self.read(entity, &GetQuery::new()).await?.records,
                )),
            };
        }

        let mut data = data;
        let id = match record_id(&data, id_attribute) {
            Some(id) => id,
            None if method == Method::Create => {
                let id = uuid::Uuid::new_v4().to_string();
                set_record_id(&mut data, id_attribute, &id);
                id
            }
            None => return Err(ebb_engine::Error::MissingId(id_attribute.to_string()).into()),
        };

        let time = self.inner.clock.lock().next(now_millis());
        let message = OfflineMessage::new(entity, id.clone(), method, data.clone(), time, endpoint.priority());
        let message_id = message.id.clone();
        let enqueued = self.inner.queue.enqueue(message).await?;

        let applied = match self
            .write_through(&endpoint, LiveMessage::new(id, method, data))
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                self.inner.queue.restore(&message_id, enqueued.previous).await?;
                return Err(e);
            }
        };
        self.inner
            .events
            .publish(endpoint.channel_id(), ChannelNotice::Message(applied.clone()));

        if enqueued.current.is_none() {
            return Ok(applied.data);
        }
        let blocked = matches!(
            self.inner.disconnected_entity.lock().as_deref(),
            Some(other) if other != entity
        );
        if blocked {
            return Ok(applied.data);
        }

        self.inner.outcomes.insert(message_id.clone(), None);
        let replayed = self.send_messages().await;
        let outcome = self
            .inner
            .outcomes
            .remove(&message_id)
            .and_then(|(_, outcome)| outcome);
        replayed?;

        match outcome {
            Some(Delivery::Accepted(response)) if response.is_object() => Ok(response),
            Some(Delivery::Rejected { status, message }) => {
                Err(SyncError::Rejected { status, message })
            }
            _ => Ok(applied.data),
        }
    }

    pub async fn create(&self, entity: &str, data: Value) -> SyncResult<Value> {
        self.sync(entity, Method::Create, data).await
    }

    pub async fn update(&self, entity: &str, data: Value) -> SyncResult<Value> {
        self.sync(entity, Method::Update, data).await
    }

    pub async fn patch(&self, entity: &str, data: Value) -> SyncResult<Value> {
        self.sync(entity, Method::Patch, data).await
    }

    pub async fn delete(&self, entity: &str, id: &str) -> SyncResult<Value> {
        let endpoint = self.endpoint(entity)?;
        let mut data = Value::Null;
        set_record_id(&mut data, endpoint.id_attribute(), id);
        self.sync(entity, Method::Delete, data).await
    }

    /// Read an entity's records.
    ///
    /// With a live push channel and a known timestamp only the changes feed is
    /// pulled and local records are returned. Otherwise the remote is queried
    /// and its results are written through; if it cannot be reached the local
    /// records are returned.
    pub async fn read(&self, entity: &str, query: &GetQuery) -> SyncResult<ReadResult> {
        self.ensure_open()?;
        let endpoint = self.endpoint(entity)?;
        self.check_identity(&endpoint)?;
        let timestamp = self.inner.timestamps.get(endpoint.channel_id()).await;

        if timestamp > 0 && endpoint.has_push() && endpoint.is_connected() {
            match self.fetch_changes(&endpoint).await {
                Ok(_) => {}
                Err(e) if e.is_connectivity() => self.mark_disconnected(&endpoint),
                Err(e) => tracing::warn!(entity, error = %e, "Fetching changes failed"),
            }
            return self.read_local(&endpoint).await;
        }

        if timestamp == 0 {
            match self.fetch_info(&endpoint).await {
                Ok(()) => {}
                Err(e) if e.is_connectivity() => {
                    self.mark_disconnected(&endpoint);
                    return self.read_local(&endpoint).await;
                }
                Err(e) => tracing::warn!(entity, error = %e, "Fetching server info failed"),
            }
        }

        let url = endpoint.query_url(query)?;
        match self.inner.transport.request(HttpMethod::Get, &url, None).await {
            Ok(response) => {
                let mut records = match response {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    other => vec![other],
                };
                for record in &mut records {
                    fix_server_id(record, endpoint.id_attribute(), None);
                }
                endpoint.store().put(&records).await?;
                tracing::debug!(entity, count = records.len(), "Read from remote");
                Ok(ReadResult {
                    records,
                    origin: Origin::Remote,
                })
            }
            Err(e) if e.is_connectivity() => {
                self.mark_disconnected(&endpoint);
                self.read_local(&endpoint).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_local(&self, endpoint: &SyncEndpoint) -> SyncResult<ReadResult> {
        Ok(ReadResult {
            records: endpoint.store().read(None).await?,
            origin: Origin::Local,
        })
    }

    /// Fetch one record from the remote, falling back to local storage when
    /// the remote is unreachable. A record the remote reports gone is
    /// deleted locally.
    pub async fn fetch(&self, entity: &str, id: &str) -> SyncResult<Option<Value>> {
        self.ensure_open()?;
        let endpoint = self.endpoint(entity)?;
        self.check_identity(&endpoint)?;

        let result = self
            .inner
            .transport
            .request(HttpMethod::Get, &endpoint.record_url(id), None)
            .await
            .map_err(SyncError::from);
        match result {
            Ok(mut record) => {
                fix_server_id(&mut record, endpoint.id_attribute(), Some(id));
                endpoint.store().put(std::slice::from_ref(&record)).await?;
                Ok(Some(record))
            }
            Err(e) if e.is_gone() => {
                endpoint.store().delete(&[id.to_string()]).await?;
                Ok(None)
            }
            Err(e) if e.is_connectivity() => {
                self.mark_disconnected(&endpoint);
                endpoint.store().get(id).await
            }
            Err(e) => Err(e),
        }
    }

    /// Shut down: stop channel pumps, close push channels and the database.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            task.abort();
        }

        let endpoints: Vec<Arc<SyncEndpoint>> = self
            .inner
            .endpoints
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.inner.endpoints.clear();
        for endpoint in endpoints {
            if let Some(push) = endpoint.push() {
                push.close().await;
            }
            endpoint.set_push(None);
            endpoint.set_state(ConnectionState::Disconnected);
            self.inner.events.remove(endpoint.channel_id());
        }

        self.inner.pool.close().await;
        tracing::info!(remote_root = %self.inner.config.remote_root, "Sync store closed");
    }
}

fn check_rebind(existing: Arc<SyncEndpoint>, binding: &EntityBinding) -> SyncResult<Arc<SyncEndpoint>> {
    if existing.url() != binding.url.trim_end_matches('/') {
        return Err(SyncError::Configuration(format!(
            "'{}' is bound to '{}', cannot rebind to '{}'",
            binding.entity,
            existing.url(),
            binding.url
        )));
    }
    Ok(existing)
}

/// Server id of a created record the remote stored under a new id.
fn moved_id(endpoint: &SyncEndpoint, message: &OfflineMessage, response: &Value) -> Option<String> {
    if message.method != Method::Create {
        return None;
    }
    record_id(response, endpoint.id_attribute()).filter(|id| *id != message.record_id)
}

/// Split a changes response into messages and the feed timestamp.
///
/// Accepts a bare array of messages or `{ "messages": [...], "timestamp": n }`.
fn split_changes(response: Value) -> (Vec<Value>, Option<Timestamp>) {
    match response {
        Value::Array(items) => (items, None),
        Value::Object(mut map) => {
            let timestamp = map.get("timestamp").and_then(Value::as_u64);
            let messages = match map.remove("messages") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            (messages, timestamp)
        }
        _ => (Vec::new(), None),
    }
}

/// Scheme and authority of the remote root.
fn remote_host(root: &str) -> String {
    match reqwest::Url::parse(root) {
        Ok(url) => url.origin().ascii_serialization(),
        Err(_) => root.to_string(),
    }
}

fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}
