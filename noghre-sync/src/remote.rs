//! Remote store interface.

use async_trait::async_trait;
use noghre_core::{EntityId, Page, PageCursor, RemoteError, Syncable};

/// Authoritative remote store for one entity type.
///
/// Implementations wrap the HTTP API. They report failures as
/// [`RemoteError`]; the coordinator applies the timeout and decides between
/// local fallback and propagation, so implementations should not retry or
/// cache on their own.
#[async_trait]
pub trait RemoteClient<T: Syncable>: Send + Sync {
    /// Fetch one entity by id.
    async fn fetch(&self, id: &EntityId) -> Result<T, RemoteError>;

    /// Fetch one page. `None` requests the first page.
    async fn fetch_page(&self, cursor: Option<&PageCursor>) -> Result<Page<T>, RemoteError>;

    /// Create an entity; returns the entity as stored by the remote.
    async fn create(&self, entity: &T) -> Result<T, RemoteError>;

    /// Update an entity; returns the entity as stored by the remote.
    async fn update(&self, entity: &T) -> Result<T, RemoteError>;

    /// Delete an entity; returns the deleted entity as last known by the remote.
    async fn delete(&self, entity: &T) -> Result<T, RemoteError>;
}
