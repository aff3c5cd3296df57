//! Local record store.
//!
//! The [`LocalStore`] trait abstracts the durable cache the coordinator falls
//! back to. Two implementations are provided:
//!
//! - [`InMemoryLocalStore`]: sharded `DashMap`, for tests and ephemeral use
//! - [`LmdbLocalStore`]: LMDB via `heed`, survives process restarts

pub mod lmdb_backend;
pub mod memory;
pub mod record_key;
pub mod traits;

pub use lmdb_backend::{LmdbLocalStore, LmdbStoreError};
pub use memory::InMemoryLocalStore;
pub use record_key::RecordKey;
pub use traits::{LocalStore, StoreStats};
