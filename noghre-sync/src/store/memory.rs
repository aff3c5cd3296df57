//! In-memory local store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use noghre_core::{
    CachedRecord, EntityId, EntityType, NoghreResult, RecordSource, StorageError, Syncable,
    Timestamp,
};

use super::record_key::RecordKey;
use super::traits::{LocalStore, StoreStats};

/// A record with its value kept as JSON, so one map holds every entity type.
///
/// `json` is `None` for a tombstone left by a delete.
#[derive(Debug, Clone)]
struct StoredRecord {
    json: Option<serde_json::Value>,
    fetched_at: Timestamp,
    source: RecordSource,
}

impl StoredRecord {
    fn tombstone(deleted_at: Timestamp) -> Self {
        Self {
            json: None,
            fetched_at: deleted_at,
            source: RecordSource::Local,
        }
    }

    fn is_live(&self) -> bool {
        self.json.is_some()
    }

    fn encode<T: Syncable>(key: &RecordKey, record: &CachedRecord<T>) -> NoghreResult<Self> {
        let json = serde_json::to_value(&record.value).map_err(|e| StorageError::Serialization {
            reason: format!("{}: {}", key, e),
        })?;
        Ok(Self {
            json: Some(json),
            fetched_at: record.fetched_at,
            source: record.source,
        })
    }

    /// Decode a live record. Tombstones decode to `None`.
    fn decode<T: Syncable>(&self, key: &RecordKey) -> NoghreResult<Option<CachedRecord<T>>> {
        let Some(json) = &self.json else {
            return Ok(None);
        };
        let value = serde_json::from_value(json.clone()).map_err(|e| StorageError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(CachedRecord {
            value,
            fetched_at: self.fetched_at,
            source: self.source,
        }))
    }
}

/// Local store backed by a sharded concurrent map.
///
/// Writes lock only the shard holding the key, so unrelated ids proceed in
/// parallel. Nothing survives a restart; use [`super::LmdbLocalStore`] for
/// durability.
#[derive(Debug, Default)]
pub struct InMemoryLocalStore {
    records: DashMap<RecordKey, StoredRecord>,
    hits: AtomicU64,
    misses: AtomicU64,
    rejected_writes: AtomicU64,
    purged: AtomicU64,
}

impl InMemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records. Tombstones are not counted.
    pub fn len(&self) -> usize {
        self.records.iter().filter(|entry| entry.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write `stored` unless the key holds something strictly newer.
    fn write_if_newer(&self, key: RecordKey, stored: StoredRecord) -> bool {
        // The entry guard holds the shard lock, so compare-and-replace is atomic per key.
        match self.records.entry(key) {
            Entry::Occupied(mut existing) => {
                if stored.fetched_at >= existing.get().fetched_at {
                    existing.insert(stored);
                    true
                } else {
                    self.rejected_writes.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(stored);
                true
            }
        }
    }

    fn purge_expired_at(&self, retention: Duration, now: Timestamp) -> u64 {
        let mut removed = 0u64;
        self.records.retain(|_, stored| {
            let age = now
                .signed_duration_since(stored.fetched_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let keep = age <= retention;
            if !keep {
                removed += 1;
            }
            keep
        });
        self.purged.fetch_add(removed, Ordering::Relaxed);
        removed
    }
}

#[async_trait]
impl LocalStore for InMemoryLocalStore {
    async fn get<T: Syncable>(&self, id: &EntityId) -> NoghreResult<Option<CachedRecord<T>>> {
        let key = RecordKey::new(T::entity_type(), id.clone());
        let stored = self
            .records
            .get(&key)
            .map(|r| r.value().clone())
            .filter(StoredRecord::is_live);
        match stored {
            Some(stored) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                stored.decode(&key)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn put<T: Syncable>(
        &self,
        id: &EntityId,
        record: &CachedRecord<T>,
    ) -> NoghreResult<bool> {
        let key = RecordKey::new(T::entity_type(), id.clone());
        let stored = StoredRecord::encode(&key, record)?;
        Ok(self.write_if_newer(key, stored))
    }

    async fn tombstone<T: Syncable>(
        &self,
        id: &EntityId,
        deleted_at: Timestamp,
    ) -> NoghreResult<bool> {
        let key = RecordKey::new(T::entity_type(), id.clone());
        Ok(self.write_if_newer(key, StoredRecord::tombstone(deleted_at)))
    }

    async fn remove<T: Syncable>(&self, id: &EntityId) -> NoghreResult<bool> {
        let key = RecordKey::new(T::entity_type(), id.clone());
        Ok(self
            .records
            .remove(&key)
            .is_some_and(|(_, stored)| stored.is_live()))
    }

    async fn list<T: Syncable>(&self) -> NoghreResult<Vec<CachedRecord<T>>> {
        let entity_type = T::entity_type();
        let mut matching: Vec<(RecordKey, StoredRecord)> = self
            .records
            .iter()
            .filter(|entry| entry.key().entity_type() == entity_type && entry.is_live())
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        matching.sort_by(|a, b| a.0.cmp(&b.0));

        let mut records = Vec::with_capacity(matching.len());
        for (key, stored) in &matching {
            records.extend(stored.decode(key)?);
        }
        Ok(records)
    }

    async fn invalidate_entity_type(&self, entity_type: EntityType) -> NoghreResult<u64> {
        let mut removed = 0u64;
        self.records.retain(|key, stored| {
            let keep = key.entity_type() != entity_type;
            if !keep && stored.is_live() {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }

    async fn purge_older_than(&self, retention: Duration) -> NoghreResult<u64> {
        Ok(self.purge_expired_at(retention, Utc::now()))
    }

    async fn stats(&self) -> NoghreResult<StoreStats> {
        Ok(StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.len() as u64,
            rejected_writes: self.rejected_writes.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noghre_test_utils::{Order, Product};

    fn product(id: u64, name: &str) -> Product {
        Product::new(id, name, 100_000)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = InMemoryLocalStore::new();
        let item = product(42, "Silver ring");
        let fetched_at = Utc::now();

        let applied = store
            .put(&item.id, &CachedRecord::remote(item.clone(), fetched_at))
            .await
            .expect("put should succeed");
        assert!(applied);

        let cached = store
            .get::<Product>(&item.id)
            .await
            .expect("get should succeed")
            .expect("record should be present");
        assert_eq!(cached.value, item);
        assert_eq!(cached.fetched_at, fetched_at);
        assert_eq!(cached.source, RecordSource::Remote);
    }

    #[tokio::test]
    async fn test_older_write_is_discarded() {
        let store = InMemoryLocalStore::new();
        let now = Utc::now();
        let newer = product(1, "new name");
        let older = product(1, "old name");

        store
            .put(&newer.id, &CachedRecord::remote(newer.clone(), now))
            .await
            .expect("put should succeed");
        let applied = store
            .put(
                &older.id.clone(),
                &CachedRecord::remote(older, now - chrono::Duration::seconds(5)),
            )
            .await
            .expect("put should succeed");
        assert!(!applied);

        let cached = store
            .get::<Product>(&newer.id)
            .await
            .expect("get should succeed")
            .expect("record should be present");
        assert_eq!(cached.value.name, "new name");

        let stats = store.stats().await.expect("stats should succeed");
        assert_eq!(stats.rejected_writes, 1);
    }

    #[tokio::test]
    async fn test_equal_fetched_at_accepts_incoming() {
        let store = InMemoryLocalStore::new();
        let now = Utc::now();
        let first = product(1, "first");
        let second = product(1, "second");

        store
            .put(&first.id.clone(), &CachedRecord::remote(first, now))
            .await
            .expect("put should succeed");
        let applied = store
            .put(&second.id.clone(), &CachedRecord::local(second, now))
            .await
            .expect("put should succeed");
        assert!(applied);
    }

    #[tokio::test]
    async fn test_entity_types_are_partitioned() {
        let store = InMemoryLocalStore::new();
        let item = product(7, "Anklet");
        store
            .put(&item.id, &CachedRecord::remote(item.clone(), Utc::now()))
            .await
            .expect("put should succeed");

        let as_order = store
            .get::<Order>(&item.id)
            .await
            .expect("get should succeed");
        assert!(as_order.is_none());
    }

    #[tokio::test]
    async fn test_purge_older_than_seven_days() {
        let store = InMemoryLocalStore::new();
        let now = Utc::now();
        let old = product(1, "eight days");
        let recent = product(2, "six days");

        store
            .put(&old.id, &CachedRecord::remote(old.clone(), now - chrono::Duration::days(8)))
            .await
            .expect("put should succeed");
        store
            .put(
                &recent.id,
                &CachedRecord::remote(recent.clone(), now - chrono::Duration::days(6)),
            )
            .await
            .expect("put should succeed");

        let removed = store
            .purge_older_than(Duration::from_secs(7 * 24 * 3600))
            .await
            .expect("purge should succeed");
        assert_eq!(removed, 1);
        assert!(store
            .get::<Product>(&old.id)
            .await
            .expect("get should succeed")
            .is_none());
        assert!(store
            .get::<Product>(&recent.id)
            .await
            .expect("get should succeed")
            .is_some());
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_id() {
        let store = InMemoryLocalStore::new();
        for id in [3u64, 1, 2] {
            let item = product(id, "p");
            store
                .put(&item.id, &CachedRecord::remote(item.clone(), Utc::now()))
                .await
                .expect("put should succeed");
        }

        let listed = store.list::<Product>().await.expect("list should succeed");
        let ids: Vec<_> = listed.iter().map(|r| r.value.id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_invalidate_entity_type() {
        let store = InMemoryLocalStore::new();
        for id in 0..3u64 {
            let item = product(id, "p");
            store
                .put(&item.id, &CachedRecord::remote(item.clone(), Utc::now()))
                .await
                .expect("put should succeed");
        }
        let order = Order::pending("o-1", 250_000);
        store
            .put(&order.id, &CachedRecord::remote(order.clone(), Utc::now()))
            .await
            .expect("put should succeed");

        let removed = store
            .invalidate_entity_type(EntityType::Product)
            .await
            .expect("invalidate should succeed");
        assert_eq!(removed, 3);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_stats_hits_and_misses() {
        let store = InMemoryLocalStore::new();
        let item = product(9, "Bangle");

        let _ = store.get::<Product>(&item.id).await;
        store
            .put(&item.id, &CachedRecord::remote(item.clone(), Utc::now()))
            .await
            .expect("put should succeed");
        let _ = store.get::<Product>(&item.id).await;
        let _ = store.get::<Product>(&item.id).await;

        let stats = store.stats().await.expect("stats should succeed");
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn test_tombstone_hides_record_and_rejects_older_puts() {
        let store = InMemoryLocalStore::new();
        let now = Utc::now();
        let item = product(4, "Cufflinks");

        store
            .put(&item.id, &CachedRecord::remote(item.clone(), now - chrono::Duration::seconds(10)))
            .await
            .expect("put should succeed");
        assert!(store
            .tombstone::<Product>(&item.id, now)
            .await
            .expect("tombstone should succeed"));

        assert!(store
            .get::<Product>(&item.id)
            .await
            .expect("get should succeed")
            .is_none());
        assert!(store.list::<Product>().await.expect("list should succeed").is_empty());
        assert!(store.is_empty());

        // A response issued before the delete stays out.
        let late = store
            .put(&item.id, &CachedRecord::remote(item.clone(), now - chrono::Duration::seconds(1)))
            .await
            .expect("put should succeed");
        assert!(!late);
        assert!(store
            .get::<Product>(&item.id)
            .await
            .expect("get should succeed")
            .is_none());

        // One issued after it brings the record back.
        let recreated = store
            .put(&item.id, &CachedRecord::remote(item.clone(), now + chrono::Duration::seconds(1)))
            .await
            .expect("put should succeed");
        assert!(recreated);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_tombstone_older_than_record_is_ignored() {
        let store = InMemoryLocalStore::new();
        let now = Utc::now();
        let item = product(5, "Tiara");

        store
            .put(&item.id, &CachedRecord::remote(item.clone(), now))
            .await
            .expect("put should succeed");
        let applied = store
            .tombstone::<Product>(&item.id, now - chrono::Duration::seconds(3))
            .await
            .expect("tombstone should succeed");
        assert!(!applied);
        assert!(store
            .get::<Product>(&item.id)
            .await
            .expect("get should succeed")
            .is_some());
    }

    #[tokio::test]
    async fn test_purge_clears_expired_tombstones() {
        let store = InMemoryLocalStore::new();
        let now = Utc::now();
        let item = product(6, "Locket");

        store
            .tombstone::<Product>(&item.id, now - chrono::Duration::days(8))
            .await
            .expect("tombstone should succeed");
        let removed = store.purge_expired_at(Duration::from_secs(7 * 24 * 3600), now);
        assert_eq!(removed, 1);
        assert_eq!(store.records.len(), 0);

        // With the tombstone gone an old write is accepted again.
        assert!(store
            .put(&item.id.clone(), &CachedRecord::remote(item, now - chrono::Duration::days(1)))
            .await
            .expect("put should succeed"));
    }
}
