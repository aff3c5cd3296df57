//! Noghre Sync - Offline-first record synchronization
//!
//! Every read goes to the remote store first and falls back to the local
//! store on transient failure. Every mutation is remote-first and only
//! touches the local store once the remote confirms it.
//!
//! # Components
//!
//! - [`SyncCoordinator`]: remote-first reads, stale fallback, mutations,
//!   per-id observation streams
//! - [`LocalStore`]: durable record store keyed by entity type and id, with
//!   in-memory and LMDB implementations
//! - [`RemoteClient`]: interface to the remote API
//! - [`maintenance`]: background retention sweep

pub mod coordinator;
pub mod maintenance;
pub mod remote;
pub mod store;

pub use coordinator::{Mutation, SyncCoordinator};
pub use maintenance::{retention_sweep_task, SweepMetrics, SweepMetricsSnapshot};
pub use remote::RemoteClient;
pub use store::{InMemoryLocalStore, LmdbLocalStore, LmdbStoreError, LocalStore, RecordKey, StoreStats};
