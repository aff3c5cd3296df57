//! Sync coordinator: remote-first reads with stale local fallback.
//!
//! The coordinator combines a [`RemoteClient`] and a [`LocalStore`] for one
//! entity type. Reads go to the remote first; transient failures fall back to
//! the local store and are flagged stale. Permanent failures propagate
//! unmasked. Mutations are remote-first and reach the local store only after
//! the remote confirms them.
//!
//! # Ordering
//!
//! `fetched_at` is stamped when a remote request is issued, not when its
//! response arrives. A slow response that was overtaken by a later request
//! therefore carries an older timestamp and is discarded by the store's
//! greatest-`fetched_at`-wins rule. A confirmed delete leaves a tombstone
//! stamped the same way, so a read issued before the delete cannot bring the
//! entity back.
//!
//! # Page Merge Rule
//!
//! Items of a successful page are merged into the store by id under the same
//! rule, so an id that appears on two pages is stored once with the newest
//! value. The id list of each page is remembered per cursor and replaced
//! wholesale by the next successful fetch of that cursor. Offline, a page is
//! rebuilt from those ids (skipping records evicted since); the first page
//! with no remembered ids falls back to every cached record of the type.

use std::future::Future;
use std::sync::{Arc, Weak};

use async_stream::stream;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::Stream;
use noghre_core::{
    CachedRecord, EntityId, NoghreResult, Page, PageCursor, RemoteError, ResultEnvelope,
    SyncConfig, Syncable, Timestamp,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::remote::RemoteClient;
use crate::store::LocalStore;

/// A remote-first mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation<T> {
    Create(T),
    Update(T),
    Delete(T),
}

impl<T> Mutation<T> {
    /// The entity the mutation applies to.
    pub fn entity(&self) -> &T {
        match self {
            Mutation::Create(entity) | Mutation::Update(entity) | Mutation::Delete(entity) => {
                entity
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Mutation::Create(_) => "create",
            Mutation::Update(_) => "update",
            Mutation::Delete(_) => "delete",
        }
    }
}

type Channels<T> = DashMap<EntityId, broadcast::Sender<CachedRecord<T>>>;

/// An observer's receiver. Dropping the last one for an id removes the id's
/// channel.
struct Subscription<T: Syncable> {
    rx: broadcast::Receiver<CachedRecord<T>>,
    channels: Weak<Channels<T>>,
    id: EntityId,
}

impl<T: Syncable> Drop for Subscription<T> {
    fn drop(&mut self) {
        let Some(channels) = self.channels.upgrade() else {
            return;
        };
        // `self.rx` is still subscribed here.
        channels.remove_if(&self.id, |_, tx| tx.receiver_count() <= 1);
    }
}

/// Ids of a page as last returned by the remote.
#[derive(Debug, Clone)]
struct PageManifest {
    ids: Vec<EntityId>,
    next_cursor: Option<PageCursor>,
}

/// Per-entity-type orchestrator of remote and local stores.
///
/// # Type Parameters
///
/// - `T`: the synced entity
/// - `R`: the remote client for `T`
/// - `S`: the local store
///
/// # Example
///
/// ```ignore
/// let coordinator = SyncCoordinator::new(remote, store, SyncConfig::default());
///
/// match coordinator.get(&EntityId::from(42u64)).await {
///     ResultEnvelope::Success { value, stale } => show(value.value, stale),
///     ResultEnvelope::Error { kind, .. } => show_error(kind),
///     ResultEnvelope::Loading => {}
/// }
/// ```
pub struct SyncCoordinator<T, R, S>
where
    T: Syncable,
    R: RemoteClient<T>,
    S: LocalStore,
{
    remote: Arc<R>,
    store: Arc<S>,
    config: SyncConfig,
    /// Per-id observation channels; an id's entry is removed when its last
    /// observer stream is dropped.
    channels: Arc<Channels<T>>,
    /// Page manifests keyed by the cursor that requested them.
    pages: DashMap<Option<PageCursor>, PageManifest>,
}

impl<T, R, S> SyncCoordinator<T, R, S>
where
    T: Syncable,
    R: RemoteClient<T> + 'static,
    S: LocalStore + 'static,
{
    pub fn new(remote: Arc<R>, store: Arc<S>, config: SyncConfig) -> Self {
        Self {
            remote,
            store,
            config,
            channels: Arc::new(DashMap::new()),
            pages: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Read one entity.
    ///
    /// Returns a fresh record on remote success, a stale local record on
    /// transient remote failure, and an error otherwise. A response overtaken
    /// by a confirmed delete of the same id is reported as not found.
    pub async fn get(&self, id: &EntityId) -> ResultEnvelope<CachedRecord<T>> {
        let fetched_at = Utc::now();
        match self.call_remote("fetch", self.remote.fetch(id)).await {
            Ok(value) => match self.commit(id, CachedRecord::remote(value, fetched_at)).await {
                Some(record) => ResultEnvelope::fresh(record),
                None => ResultEnvelope::error(RemoteError::NotFound { id: id.to_string() }),
            },
            Err(err) => self.fallback_one(id, err).await,
        }
    }

    /// Read one page. `None` requests the first page.
    pub async fn list(
        &self,
        cursor: Option<&PageCursor>,
    ) -> ResultEnvelope<Page<CachedRecord<T>>> {
        let fetched_at = Utc::now();
        match self.call_remote("fetch_page", self.remote.fetch_page(cursor)).await {
            Ok(page) => {
                let page = self.merge_page(cursor, page, fetched_at).await;
                ResultEnvelope::fresh(page)
            }
            Err(err) => self.fallback_page(cursor, err).await,
        }
    }

    /// Apply a mutation remote-first.
    ///
    /// On success the confirmed entity is written locally (or replaced by a
    /// tombstone, for a delete) and returned as the remote confirmed it, even
    /// when the store already holds a newer record. On failure the local store
    /// is left untouched and nothing is queued; the caller decides whether to
    /// retry.
    pub async fn mutate(&self, mutation: Mutation<T>) -> ResultEnvelope<CachedRecord<T>> {
        let id = mutation.entity().entity_id();
        let operation = mutation.name();
        let fetched_at = Utc::now();

        let result = match &mutation {
            Mutation::Create(entity) => {
                self.call_remote(operation, self.remote.create(entity)).await
            }
            Mutation::Update(entity) => {
                self.call_remote(operation, self.remote.update(entity)).await
            }
            Mutation::Delete(entity) => {
                self.call_remote(operation, self.remote.delete(entity)).await
            }
        };

        let confirmed = match result {
            Ok(confirmed) => confirmed,
            Err(err) => {
                tracing::warn!(
                    entity_type = ?T::entity_type(),
                    id = %id,
                    operation,
                    error = %err,
                    "Remote mutation failed; local store left unchanged"
                );
                return ResultEnvelope::error(err);
            }
        };

        let record = CachedRecord::remote(confirmed, fetched_at);
        match mutation {
            Mutation::Delete(_) => match self.store.tombstone::<T>(&id, fetched_at).await {
                Ok(true) => {}
                Ok(false) => tracing::debug!(
                    id = %id,
                    "Stored record is newer than the delete; tombstone skipped"
                ),
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "Failed to tombstone deleted record")
                }
            },
            Mutation::Create(_) | Mutation::Update(_) => {
                // A create may come back under a remote-issued id.
                let confirmed_id = record.value.entity_id();
                self.commit(&confirmed_id, record.clone()).await;
            }
        }
        ResultEnvelope::fresh(record)
    }

    /// Observe one id.
    ///
    /// The stream yields the current local record (if any) immediately, then
    /// every committed record whose `fetched_at` is strictly greater than the
    /// last one yielded. It ends only when the coordinator is dropped.
    /// Deletes are not published. Dropping the stream has no effect on the
    /// store.
    pub fn observe(&self, id: &EntityId) -> impl Stream<Item = CachedRecord<T>> + Send + 'static {
        // Subscribe before reading the store so no commit in between is missed.
        let rx = self
            .channels
            .entry(id.clone())
            .or_insert_with(|| broadcast::channel(self.config.observer_capacity.max(1)).0)
            .subscribe();
        let mut subscription = Subscription {
            rx,
            channels: Arc::downgrade(&self.channels),
            id: id.clone(),
        };
        let store = Arc::clone(&self.store);
        let id = id.clone();

        stream! {
            let mut last: Option<Timestamp> = None;

            match store.get::<T>(&id).await {
                Ok(Some(record)) => {
                    last = Some(record.fetched_at);
                    yield record;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(id = %id, error = %e, "Observer could not read initial record"),
            }

            loop {
                let candidate = match subscription.rx.recv().await {
                    Ok(record) => Some(record),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(id = %id, skipped, "Observer lagged; re-reading store");
                        store.get::<T>(&id).await.ok().flatten()
                    }
                    Err(RecvError::Closed) => break,
                };

                if let Some(record) = candidate {
                    if last.map_or(true, |seen| record.fetched_at > seen) {
                        last = Some(record.fetched_at);
                        yield record;
                    }
                }
            }
        }
    }

    /// Number of live observers of `id`.
    pub fn observer_count(&self, id: &EntityId) -> usize {
        self.channels
            .get(id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Number of ids with at least one live observer.
    pub fn observed_ids(&self) -> usize {
        self.channels.len()
    }

    /// Drop the local record for `id`. Returns whether one was present.
    pub async fn invalidate(&self, id: &EntityId) -> NoghreResult<bool> {
        let removed = self.store.remove::<T>(id).await?;
        tracing::debug!(entity_type = ?T::entity_type(), id = %id, removed, "Invalidated record");
        Ok(removed)
    }

    /// Drop every local record of this entity type and all page manifests.
    pub async fn invalidate_all(&self) -> NoghreResult<u64> {
        self.pages.clear();
        let removed = self.store.invalidate_entity_type(T::entity_type()).await?;
        tracing::info!(entity_type = ?T::entity_type(), removed, "Invalidated entity type");
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------------

    async fn call_remote<V, F>(&self, operation: &'static str, call: F) -> Result<V, RemoteError>
    where
        F: Future<Output = Result<V, RemoteError>>,
    {
        let limit = self.config.remote_timeout;
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => {
                let after_ms = limit.as_millis() as u64;
                tracing::debug!(operation, after_ms, "Remote call timed out");
                Err(RemoteError::Timeout {
                    operation: operation.to_string(),
                    after_ms,
                })
            }
        }
    }

    /// Write a confirmed record and publish it to observers.
    ///
    /// Returns the record now current for `id`: the given one if it was
    /// applied, otherwise the newer record already stored. `None` means a
    /// later delete of `id` superseded the record.
    async fn commit(&self, id: &EntityId, record: CachedRecord<T>) -> Option<CachedRecord<T>> {
        match self.store.put(id, &record).await {
            Ok(true) => {
                self.publish(id, record.clone());
                Some(record)
            }
            Ok(false) => {
                tracing::debug!(
                    entity_type = ?T::entity_type(),
                    id = %id,
                    fetched_at = %record.fetched_at,
                    "Discarded response older than stored record"
                );
                match self.store.get::<T>(id).await {
                    Ok(current) => current,
                    Err(_) => Some(record),
                }
            }
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Failed to persist remote record");
                Some(record)
            }
        }
    }

    fn publish(&self, id: &EntityId, record: CachedRecord<T>) {
        if let Some(tx) = self.channels.get(id) {
            // No receivers means the last observer is being dropped.
            let _ = tx.send(record);
        }
    }

    async fn fallback_one(
        &self,
        id: &EntityId,
        err: RemoteError,
    ) -> ResultEnvelope<CachedRecord<T>> {
        if !err.kind().is_transient() {
            tracing::debug!(id = %id, kind = ?err.kind(), "Remote rejected read; not falling back");
            return ResultEnvelope::error(err);
        }

        match self.store.get::<T>(id).await {
            Ok(Some(record)) => {
                tracing::warn!(
                    entity_type = ?T::entity_type(),
                    id = %id,
                    kind = ?err.kind(),
                    fetched_at = %record.fetched_at,
                    "Serving stale record after remote failure"
                );
                ResultEnvelope::stale(record)
            }
            Ok(None) => ResultEnvelope::error(err),
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Local fallback read failed");
                ResultEnvelope::error(err)
            }
        }
    }

    async fn merge_page(
        &self,
        cursor: Option<&PageCursor>,
        page: Page<T>,
        fetched_at: Timestamp,
    ) -> Page<CachedRecord<T>> {
        let next_cursor = page.next_cursor;
        let mut ids: Vec<EntityId> = Vec::with_capacity(page.items.len());
        let mut items: Vec<CachedRecord<T>> = Vec::with_capacity(page.items.len());

        for value in page.items {
            let id = value.entity_id();
            let Some(record) = self.commit(&id, CachedRecord::remote(value, fetched_at)).await
            else {
                // Deleted after this page was requested.
                continue;
            };
            match ids.iter().position(|seen| *seen == id) {
                Some(index) => items[index] = record,
                None => {
                    ids.push(id);
                    items.push(record);
                }
            }
        }

        self.pages.insert(
            cursor.cloned(),
            PageManifest {
                ids,
                next_cursor: next_cursor.clone(),
            },
        );
        Page::new(items, next_cursor)
    }

    async fn fallback_page(
        &self,
        cursor: Option<&PageCursor>,
        err: RemoteError,
    ) -> ResultEnvelope<Page<CachedRecord<T>>> {
        if !err.kind().is_transient() {
            tracing::debug!(kind = ?err.kind(), "Remote rejected page; not falling back");
            return ResultEnvelope::error(err);
        }

        match self.local_page(cursor).await {
            Ok(Some(page)) if !page.is_empty() => {
                tracing::warn!(
                    entity_type = ?T::entity_type(),
                    items = page.items.len(),
                    kind = ?err.kind(),
                    "Serving stale page after remote failure"
                );
                ResultEnvelope::stale(page)
            }
            Ok(_) => ResultEnvelope::error(err),
            Err(e) => {
                tracing::warn!(error = %e, "Local page fallback failed");
                ResultEnvelope::error(err)
            }
        }
    }

    async fn local_page(
        &self,
        cursor: Option<&PageCursor>,
    ) -> NoghreResult<Option<Page<CachedRecord<T>>>> {
        let manifest = self.pages.get(&cursor.cloned()).map(|m| m.value().clone());

        match (manifest, cursor) {
            (Some(manifest), _) => {
                let mut items = Vec::with_capacity(manifest.ids.len());
                for id in &manifest.ids {
                    if let Some(record) = self.store.get::<T>(id).await? {
                        items.push(record);
                    }
                }
                Ok(Some(Page::new(items, manifest.next_cursor)))
            }
            (None, None) => Ok(Some(Page::last(self.store.list::<T>().await?))),
            (None, Some(_)) => Ok(None),
        }
    }
}
