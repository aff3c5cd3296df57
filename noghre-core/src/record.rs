//! Cached records and the marker trait for syncable entities.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

use crate::ids::{EntityId, PageCursor};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Entity type discriminator used to partition the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    Product,
    Category,
    Order,
    CartItem,
    Address,
    Review,
    UserProfile,
}

impl EntityType {
    /// Every entity type, in discriminant order.
    pub const ALL: [EntityType; 7] = [
        EntityType::Product,
        EntityType::Category,
        EntityType::Order,
        EntityType::CartItem,
        EntityType::Address,
        EntityType::Review,
        EntityType::UserProfile,
    ];

    /// Stable single-byte discriminant for key encoding.
    pub fn as_byte(self) -> u8 {
        match self {
            EntityType::Product => 0,
            EntityType::Category => 1,
            EntityType::Order => 2,
            EntityType::CartItem => 3,
            EntityType::Address => 4,
            EntityType::Review => 5,
            EntityType::UserProfile => 6,
        }
    }

    /// Inverse of [`EntityType::as_byte`].
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.get(byte as usize).copied()
    }
}

/// Marker trait for entities that can be synced between remote and local stores.
///
/// # Implementation Requirements
///
/// - `entity_type()` must return the same value for all instances
/// - `entity_id()` must return the remote-issued identifier of this instance
/// - Implementations must be `Clone`, `Serialize` and `DeserializeOwned` so the
///   local store can persist them
pub trait Syncable: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Get the entity type for this syncable.
    fn entity_type() -> EntityType;

    /// Get the unique identifier for this entity.
    fn entity_id(&self) -> EntityId;
}

/// Where a cached value was last confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordSource {
    /// Confirmed by a successful remote read or mutation.
    Remote,
    /// Written locally without remote confirmation.
    Local,
}

impl RecordSource {
    pub fn as_byte(self) -> u8 {
        match self {
            RecordSource::Remote => 0,
            RecordSource::Local => 1,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(RecordSource::Remote),
            1 => Some(RecordSource::Local),
            _ => None,
        }
    }
}

/// A locally stored value plus the instant it was last confirmed fresh.
///
/// `fetched_at` always travels with the value, so callers can derive staleness
/// even when the record is returned as a fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord<T> {
    pub value: T,
    pub fetched_at: Timestamp,
    pub source: RecordSource,
}

impl<T> CachedRecord<T> {
    /// Record confirmed by the remote store at `fetched_at`.
    pub fn remote(value: T, fetched_at: Timestamp) -> Self {
        Self {
            value,
            fetched_at,
            source: RecordSource::Remote,
        }
    }

    /// Record written locally at `fetched_at`.
    pub fn local(value: T, fetched_at: Timestamp) -> Self {
        Self {
            value,
            fetched_at,
            source: RecordSource::Local,
        }
    }

    /// Whether this record should replace `existing` under the
    /// greatest-`fetched_at`-wins rule. Ties accept the incoming write.
    pub fn supersedes<U>(&self, existing: &CachedRecord<U>) -> bool {
        self.fetched_at >= existing.fetched_at
    }

    /// Age of the record relative to `now` (zero if `fetched_at` is in the future).
    pub fn age_at(&self, now: Timestamp) -> Duration {
        now.signed_duration_since(self.fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Age of the record relative to the wall clock.
    pub fn age(&self) -> Duration {
        self.age_at(Utc::now())
    }

    /// Whether the record has outlived `retention` as of `now`.
    pub fn is_expired_at(&self, retention: Duration, now: Timestamp) -> bool {
        self.age_at(now) > retention
    }

    /// Map the inner value, keeping the freshness metadata.
    pub fn map<U, F>(self, f: F) -> CachedRecord<U>
    where
        F: FnOnce(T) -> U,
    {
        CachedRecord {
            value: f(self.value),
            fetched_at: self.fetched_at,
            source: self.source,
        }
    }

    /// Consume the record and return the value.
    pub fn into_value(self) -> T {
        self.value
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor of the following page, `None` on the last page.
    pub next_cursor: Option<PageCursor>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next_cursor: Option<PageCursor>) -> Self {
        Self { items, next_cursor }
    }

    pub fn last(items: Vec<T>) -> Self {
        Self::new(items, None)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn map<U, F>(self, f: F) -> Page<U>
    where
        F: FnMut(T) -> U,
    {
        Page {
            items: self.items.into_iter().map(f).collect(),
            next_cursor: self.next_cursor,
        }
    }
}
