//! Live, paged views over an entity.
//!
//! A [`SyncContext`] holds a [`LiveView`] for one entity together with a
//! subscription to the entity's channel. Pages are loaded through the
//! [`SyncStore`]; changes published on the channel are merged in by
//! [`SyncContext::drain`]. A context that fell behind its channel is stale
//! until it loads again; [`SyncContext::catch_up`] does both.

use ebb_engine::{ChannelId, EntityName, GetQuery, LiveView, Origin, ViewChange};
use serde_json::Value;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use super::events::{ChannelNotice, NoticeReceiver};
use super::store::SyncStore;
use crate::error::SyncResult;

/// A filtered, sorted, paged view of one entity.
#[derive(Debug)]
pub struct SyncContext {
    entity: EntityName,
    channel: ChannelId,
    view: LiveView,
    notices: NoticeReceiver,
    /// Offset of the first page the context may show
    base_offset: usize,
    last_error: Option<String>,
    /// Notices were missed; the records may differ from the store
    stale: bool,
}

impl SyncContext {
    /// Create a context for `entity`.
    ///
    /// The query is `transient`, then `collection`, then the store's static
    /// query, merged and optimized.
    pub fn new(
        store: &SyncStore,
        entity: &str,
        transient: &GetQuery,
        collection: &GetQuery,
    ) -> SyncResult<Self> {
        let endpoint = store.endpoint(entity)?;
        let query = transient
            .merge(collection)
            .merge(&store.config().static_query)
            .optimize();
        let base_offset = query.start();
        let view = LiveView::new(query, store.config().compile_options())?
            .with_id_attribute(endpoint.id_attribute());

        Ok(Self {
            entity: entity.to_string(),
            channel: endpoint.channel_id().clone(),
            view,
            notices: store.events().subscribe(endpoint.channel_id()),
            base_offset,
            last_error: None,
            stale: false,
        })
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn channel_id(&self) -> &str {
        &self.channel
    }

    pub fn query(&self) -> &GetQuery {
        self.view.query()
    }

    pub fn view(&self) -> &LiveView {
        &self.view
    }

    pub fn records(&self) -> &[Value] {
        self.view.records()
    }

    pub fn len(&self) -> usize {
        self.view.len()
    }

    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    pub fn has_more(&self) -> bool {
        self.view.has_more()
    }

    pub fn is_end(&self) -> bool {
        self.view.is_end()
    }

    pub fn has_next(&self) -> bool {
        self.view.has_next()
    }

    pub fn has_prev(&self) -> bool {
        self.view.has_prev()
    }

    /// Whether notices were dropped since the last load.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Last error reported on the channel.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn take_error(&mut self) -> Option<String> {
        self.last_error.take()
    }

    /// Load the current window.
    ///
    /// With a limit, one record beyond it is requested to learn whether a
    /// next page exists.
    pub async fn fetch(&mut self, store: &SyncStore) -> SyncResult<&[Value]> {
        self.skip_pending();
        self.stale = false;
        match self.view.query().limit {
            Some(limit) => {
                let offset = self.view.query().start();
                let next = self.load_page(store, offset, limit).await?;
                self.view.set_more(next);
            }
            None => {
                let offset = self.view.query().start();
                let result = store.read(&self.entity, self.view.query()).await?;
                let records = match result.origin {
                    Origin::Local => self.view.select(result.records, offset, None),
                    Origin::Remote => result.records,
                };
                self.view.reset(records);
                self.view.set_more(false);
            }
        }
        Ok(self.view.records())
    }

    /// Append the next `page` records to the view.
    ///
    /// Returns the number of records received. Fewer than `page` means the
    /// end was reached.
    pub async fn fetch_more(&mut self, store: &SyncStore, page: usize) -> SyncResult<usize> {
        let offset = self.base_offset + self.view.len();
        let mut query = self.view.query().clone();
        query.offset = Some(offset);
        query.limit = Some(page);

        let result = store.read(&self.entity, &query).await?;
        let batch = match result.origin {
            Origin::Local => self.view.select(result.records, offset, Some(page)),
            Origin::Remote => result.records,
        };
        let received = batch.len();

        self.view.set_limit(Some(self.view.len() + page));
        let id_attribute = self.view.id_attribute().to_string();
        let fresh: Vec<Value> = batch
            .into_iter()
            .filter(|record| {
                ebb_engine::record::record_id(record, &id_attribute)
                    .map(|id| self.view.position(&id).is_none())
                    .unwrap_or(true)
            })
            .collect();
        self.view.insert_batch(fresh);
        self.view.set_more(received >= page);

        tracing::debug!(entity = %self.entity, offset, received, "Fetched more records");
        Ok(received)
    }

    /// Move the window one page forward. Returns `false` if there is no next
    /// page.
    pub async fn fetch_next(&mut self, store: &SyncStore) -> SyncResult<bool> {
        let Some(limit) = self.view.query().limit else {
            return Ok(false);
        };
        if !self.view.has_next() {
            return Ok(false);
        }
        let offset = self.view.query().start() + limit;
        self.load_page(store, offset, limit).await?;
        Ok(true)
    }

    /// Move the window one page back. Returns `false` if there is no previous
    /// page.
    pub async fn fetch_prev(&mut self, store: &SyncStore) -> SyncResult<bool> {
        let Some(limit) = self.view.query().limit else {
            return Ok(false);
        };
        let start = self.view.query().start();
        if start <= self.base_offset {
            return Ok(false);
        }
        let offset = start.saturating_sub(limit).max(self.base_offset);
        self.load_page(store, offset, limit).await?;
        Ok(true)
    }

    /// Replace the view with the page at `offset`, returning whether a next
    /// page exists.
    async fn load_page(&mut self, store: &SyncStore, offset: usize, limit: usize) -> SyncResult<bool> {
        let mut query = self.view.query().clone();
        query.offset = Some(offset);
        query.limit = Some(limit + 1);

        let result = store.read(&self.entity, &query).await?;
        let mut records = match result.origin {
            Origin::Local => self.view.select(result.records, offset, Some(limit + 1)),
            Origin::Remote => result.records,
        };
        let next = records.len() > limit;
        records.truncate(limit);

        self.view.set_offset(Some(offset));
        self.view.set_limit(Some(limit));
        self.view.reset(records);
        self.view.set_next(next);
        self.view.set_prev(offset > self.base_offset);
        Ok(next)
    }

    /// Merge one channel notice into the view.
    pub fn on_notice(&mut self, notice: ChannelNotice) -> Vec<ViewChange> {
        match notice {
            ChannelNotice::Message(message) => self.view.apply(&message),
            ChannelNotice::Error { message, record_id } => {
                tracing::debug!(entity = %self.entity, ?record_id, error = %message, "Channel error");
                self.last_error = Some(message);
                Vec::new()
            }
            ChannelNotice::Connect | ChannelNotice::Disconnect => Vec::new(),
        }
    }

    /// Apply every notice received so far.
    pub fn drain(&mut self) -> Vec<ViewChange> {
        let mut changes = Vec::new();
        loop {
            match self.notices.try_recv() {
                Ok(notice) => changes.extend(self.on_notice(notice)),
                Err(TryRecvError::Lagged(skipped)) => self.fell_behind(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        changes
    }

    /// Wait for the next notice and apply it.
    ///
    /// Returns `None` once the channel is closed.
    pub async fn next_notice(&mut self) -> Option<Vec<ViewChange>> {
        loop {
            match self.notices.recv().await {
                Ok(notice) => return Some(self.on_notice(notice)),
                Err(RecvError::Lagged(skipped)) => self.fell_behind(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Apply every notice received so far, reloading the window if some were
    /// missed.
    pub async fn catch_up(&mut self, store: &SyncStore) -> SyncResult<Vec<ViewChange>> {
        let mut changes = self.drain();
        if self.stale {
            self.fetch(store).await?;
            changes.push(ViewChange::Reset {
                len: self.view.len(),
            });
        }
        Ok(changes)
    }

    fn fell_behind(&mut self, skipped: u64) {
        tracing::warn!(entity = %self.entity, skipped, "Context fell behind its channel");
        self.stale = true;
    }

    /// Subscribe again, dropping anything not yet applied.
    pub fn subscribe(&mut self, store: &SyncStore) {
        self.notices = store.events().subscribe(&self.channel);
    }

    /// Drop notices a fresh load makes redundant.
    fn skip_pending(&mut self) {
        self.notices = self.notices.resubscribe();
    }
}
