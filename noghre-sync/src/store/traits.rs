//! Local store trait and statistics.

use async_trait::async_trait;
use noghre_core::{CachedRecord, EntityId, EntityType, NoghreResult, Syncable, Timestamp};
use std::time::Duration;

/// Durable keyed storage for cached records.
///
/// Records are partitioned by [`EntityType`] and indexed by [`EntityId`]. Each
/// record carries the `fetched_at` instant it was last confirmed, which drives
/// both the merge rule and retention.
///
/// # Merge Rule
///
/// A `put` only replaces an existing record when the incoming `fetched_at` is
/// greater than or equal to the stored one. A late response that was issued
/// before the stored record is discarded, never overwrites it.
///
/// # Tombstones
///
/// A delete leaves a tombstone stamped with the delete's `fetched_at`. It
/// takes part in the merge rule like a record, so a response issued before
/// the delete cannot bring the entity back. Reads, listings and counts skip
/// tombstones; retention purges remove them by age.
///
/// # Concurrency
///
/// Implementations must allow concurrent reads and serialize writes per key.
/// Writes to unrelated keys must not contend on a single global lock. A write
/// either fully replaces a record or has no effect.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Read the record stored under `id`.
    async fn get<T: Syncable>(&self, id: &EntityId) -> NoghreResult<Option<CachedRecord<T>>>;

    /// Store `record` under `id` unless a strictly newer record is present.
    ///
    /// Returns `true` when the write was applied.
    async fn put<T: Syncable>(&self, id: &EntityId, record: &CachedRecord<T>)
        -> NoghreResult<bool>;

    /// Mark `id` as deleted at `deleted_at`, replacing any record that is not
    /// strictly newer.
    ///
    /// Returns `true` when the tombstone was written.
    async fn tombstone<T: Syncable>(&self, id: &EntityId, deleted_at: Timestamp)
        -> NoghreResult<bool>;

    /// Drop whatever is stored under `id`, tombstone included.
    ///
    /// Returns whether a live record was removed.
    async fn remove<T: Syncable>(&self, id: &EntityId) -> NoghreResult<bool>;

    /// Every record of type `T`, ordered by id.
    async fn list<T: Syncable>(&self) -> NoghreResult<Vec<CachedRecord<T>>>;

    /// Remove every record and tombstone of `entity_type`. Returns the number
    /// of live records removed.
    async fn invalidate_entity_type(&self, entity_type: EntityType) -> NoghreResult<u64>;

    /// Remove every record and tombstone with `fetched_at + retention < now`.
    ///
    /// Returns the number of entries removed.
    async fn purge_older_than(&self, retention: Duration) -> NoghreResult<u64>;

    /// Usage statistics.
    async fn stats(&self) -> NoghreResult<StoreStats>;
}

/// Statistics about local store usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Reads that found a record.
    pub hits: u64,
    /// Reads that found nothing.
    pub misses: u64,
    /// Live records currently stored.
    pub entry_count: u64,
    /// Writes discarded because a newer record was stored.
    pub rejected_writes: u64,
    /// Entries removed by retention purges, tombstones included.
    pub purged: u64,
}

impl StoreStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
