//! LMDB-backed local store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a durable,
//! memory-mapped store that survives process restarts.
//!
//! # Record Format
//!
//! Values are stored as `[fetched_at micros: 8 bytes LE][source: 1 byte][json]`
//! under keys produced by [`RecordKey::encode`]. A tombstone is a bare header
//! whose source byte is `0xFF`; its `fetched_at` is the instant of the delete.
//!
//! # Atomicity
//!
//! The compare-and-put of the merge rule runs inside a single write
//! transaction: the stored `fetched_at` is read, compared and replaced before
//! commit. A dropped transaction aborts, so a write either fully replaces a
//! record or has no effect.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use noghre_core::{
    CachedRecord, EntityId, EntityType, NoghreError, NoghreResult, RecordSource, StorageError,
    Syncable, Timestamp,
};

use super::record_key::RecordKey;
use super::traits::{LocalStore, StoreStats};

/// Length of the `[fetched_at][source]` header preceding the JSON payload.
const HEADER_LEN: usize = 9;

/// Source byte marking a tombstone.
const TOMBSTONE: u8 = 0xFF;

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A stored value could not be decoded.
    #[error("Corrupt record under {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for NoghreError {
    fn from(e: LmdbStoreError) -> Self {
        match e {
            LmdbStoreError::Serialization(reason) => {
                NoghreError::Storage(StorageError::Serialization { reason })
            }
            LmdbStoreError::Corrupt { key, reason } => {
                NoghreError::Storage(StorageError::Corrupt { key, reason })
            }
            other => NoghreError::Storage(StorageError::Backend {
                reason: other.to_string(),
            }),
        }
    }
}

fn txn_err(e: heed::Error) -> LmdbStoreError {
    LmdbStoreError::Transaction(e.to_string())
}

/// Decoded value header. `source` is `None` for a tombstone.
struct Header {
    fetched_at: Timestamp,
    source: Option<RecordSource>,
}

fn decode_header(key: &RecordKey, bytes: &[u8]) -> Result<Header, LmdbStoreError> {
    let corrupt = |reason: &str| LmdbStoreError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    if bytes.len() < HEADER_LEN {
        return Err(corrupt("value shorter than header"));
    }
    let micros_bytes: [u8; 8] = bytes[0..8]
        .try_into()
        .map_err(|_| corrupt("invalid timestamp"))?;
    let fetched_at = DateTime::from_timestamp_micros(i64::from_le_bytes(micros_bytes))
        .ok_or_else(|| corrupt("timestamp out of range"))?;
    let source = match bytes[8] {
        TOMBSTONE => None,
        byte => Some(RecordSource::from_byte(byte).ok_or_else(|| corrupt("unknown source"))?),
    };

    Ok(Header { fetched_at, source })
}

fn encode_value<T: Syncable>(record: &CachedRecord<T>) -> Result<Vec<u8>, LmdbStoreError> {
    let json = serde_json::to_vec(&record.value)
        .map_err(|e| LmdbStoreError::Serialization(e.to_string()))?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + json.len());
    bytes.extend_from_slice(&record.fetched_at.timestamp_micros().to_le_bytes());
    bytes.push(record.source.as_byte());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

fn encode_tombstone(deleted_at: Timestamp) -> [u8; HEADER_LEN] {
    let mut bytes = [TOMBSTONE; HEADER_LEN];
    bytes[..8].copy_from_slice(&deleted_at.timestamp_micros().to_le_bytes());
    bytes
}

fn is_tombstone(bytes: &[u8]) -> bool {
    bytes.len() == HEADER_LEN && bytes[8] == TOMBSTONE
}

/// Decode a live record. Tombstones decode to `None`.
fn decode_value<T: Syncable>(
    key: &RecordKey,
    bytes: &[u8],
) -> Result<Option<CachedRecord<T>>, LmdbStoreError> {
    let header = decode_header(key, bytes)?;
    let Some(source) = header.source else {
        return Ok(None);
    };
    let value = serde_json::from_slice(&bytes[HEADER_LEN..]).map_err(|e| {
        LmdbStoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        }
    })?;
    Ok(Some(CachedRecord {
        value,
        fetched_at: header.fetched_at,
        source,
    }))
}

/// Durable local store on LMDB.
///
/// # Example
///
/// ```ignore
/// use noghre_sync::store::LmdbLocalStore;
///
/// let store = LmdbLocalStore::new("/data/noghre/cache", 64)?;
/// store.put(&id, &CachedRecord::remote(product, Utc::now())).await?;
/// let cached = store.get::<Product>(&id).await?;
/// ```
pub struct LmdbLocalStore {
    env: Env,
    db: Database<Bytes, Bytes>,
    hits: AtomicU64,
    misses: AtomicU64,
    rejected_writes: AtomicU64,
    purged: AtomicU64,
}

impl LmdbLocalStore {
    /// Open (or create) a store.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per store and the directory is
        // not shared with another process that could truncate the map.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        Ok(Self {
            env,
            db,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            rejected_writes: AtomicU64::new(0),
            purged: AtomicU64::new(0),
        })
    }

    /// Collect keys starting with `prefix`, in key order, each paired with
    /// whether it holds a live record.
    fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, bool)>, LmdbStoreError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let iter = self.db.prefix_iter(&rtxn, prefix).map_err(txn_err)?;

        let mut keys = Vec::new();
        for result in iter {
            let (key, bytes) = result.map_err(txn_err)?;
            keys.push((key.to_vec(), !is_tombstone(bytes)));
        }
        Ok(keys)
    }

    /// Write `value` under `key` unless a strictly newer value is stored.
    ///
    /// The read, compare and write share one write transaction.
    fn write_if_newer(
        &self,
        key: &RecordKey,
        fetched_at: Timestamp,
        value: &[u8],
    ) -> Result<bool, LmdbStoreError> {
        let encoded_key = key.encode();
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;

        let existing = match self.db.get(&wtxn, &encoded_key).map_err(txn_err)? {
            Some(bytes) => match decode_header(key, bytes) {
                Ok(header) => Some(header.fetched_at),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Overwriting corrupt record");
                    None
                }
            },
            None => None,
        };

        if let Some(existing_fetched_at) = existing {
            if fetched_at < existing_fetched_at {
                // Dropping the transaction aborts it.
                drop(wtxn);
                self.rejected_writes.fetch_add(1, Ordering::Relaxed);
                return Ok(false);
            }
        }

        self.db
            .put(&mut wtxn, &encoded_key, value)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(true)
    }

    fn purge_expired_at(&self, retention: Duration, now: Timestamp) -> Result<u64, LmdbStoreError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;

        let expired: Vec<Vec<u8>> = {
            let mut expired = Vec::new();
            for result in self.db.iter(&wtxn).map_err(txn_err)? {
                let (raw_key, bytes) = result.map_err(txn_err)?;
                let Some(key) = RecordKey::decode(raw_key) else {
                    tracing::warn!(key_len = raw_key.len(), "Skipping undecodable store key");
                    continue;
                };
                let header = match decode_header(&key, bytes) {
                    Ok(header) => header,
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Purging corrupt record");
                        expired.push(raw_key.to_vec());
                        continue;
                    }
                };
                let age = now
                    .signed_duration_since(header.fetched_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if age > retention {
                    expired.push(raw_key.to_vec());
                }
            }
            expired
        };

        let mut deleted = 0u64;
        for key in &expired {
            if self.db.delete(&mut wtxn, key).map_err(txn_err)? {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(txn_err)?;

        self.purged.fetch_add(deleted, Ordering::Relaxed);
        Ok(deleted)
    }
}

#[async_trait]
impl LocalStore for LmdbLocalStore {
    async fn get<T: Syncable>(&self, id: &EntityId) -> NoghreResult<Option<CachedRecord<T>>> {
        let key = RecordKey::new(T::entity_type(), id.clone());
        let encoded_key = key.encode();

        let rtxn = self.env.read_txn().map_err(txn_err)?;
        match self.db.get(&rtxn, &encoded_key).map_err(txn_err)? {
            Some(bytes) if !is_tombstone(bytes) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(decode_value(&key, bytes)?)
            }
            _ => {
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
        let value = encode_value(record)?;
        Ok(self.write_if_newer(&key, record.fetched_at, &value)?)
    }

    async fn tombstone<T: Syncable>(
        &self,
        id: &EntityId,
        deleted_at: Timestamp,
    ) -> NoghreResult<bool> {
        let key = RecordKey::new(T::entity_type(), id.clone());
        Ok(self.write_if_newer(&key, deleted_at, &encode_tombstone(deleted_at))?)
    }

    async fn remove<T: Syncable>(&self, id: &EntityId) -> NoghreResult<bool> {
        let key = RecordKey::new(T::entity_type(), id.clone());
        let encoded_key = key.encode();

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let live = match self.db.get(&wtxn, &encoded_key).map_err(txn_err)? {
            Some(bytes) => !is_tombstone(bytes),
            None => false,
        };
        self.db.delete(&mut wtxn, &encoded_key).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(live)
    }

    async fn list<T: Syncable>(&self) -> NoghreResult<Vec<CachedRecord<T>>> {
        let prefix = RecordKey::type_prefix(T::entity_type());

        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let iter = self.db.prefix_iter(&rtxn, &prefix).map_err(txn_err)?;

        let mut records = Vec::new();
        for result in iter {
            let (raw_key, bytes) = result.map_err(txn_err)?;
            let key = RecordKey::decode(raw_key).ok_or_else(|| LmdbStoreError::Corrupt {
                key: format!("{:?}", raw_key),
                reason: "undecodable key".to_string(),
            })?;
            records.extend(decode_value(&key, bytes)?);
        }
        Ok(records)
    }

    async fn invalidate_entity_type(&self, entity_type: EntityType) -> NoghreResult<u64> {
        let keys = self.keys_with_prefix(&RecordKey::type_prefix(entity_type))?;

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut deleted = 0u64;
        for (key, live) in &keys {
            if self.db.delete(&mut wtxn, key).map_err(txn_err)? && *live {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(deleted)
    }

    async fn purge_older_than(&self, retention: Duration) -> NoghreResult<u64> {
        Ok(self.purge_expired_at(retention, Utc::now())?)
    }

    async fn stats(&self) -> NoghreResult<StoreStats> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut entry_count = 0u64;
        for result in self.db.iter(&rtxn).map_err(txn_err)? {
            let (_, bytes) = result.map_err(txn_err)?;
            if !is_tombstone(bytes) {
                entry_count += 1;
            }
        }

        Ok(StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count,
            rejected_writes: self.rejected_writes.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
        })
    }
}
