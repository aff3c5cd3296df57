//! Noghre Core - Shared Types
//!
//! Pure data structures used by every other crate in the workspace: entity
//! identity, cached records, the result envelope, the error taxonomy and the
//! injected configuration surface. No I/O happens here.

pub mod config;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod record;

pub use config::{NoghreConfig, PaymentConfig, SyncConfig};
pub use envelope::ResultEnvelope;
pub use error::{
    ConfigError, ErrorKind, NoghreError, NoghreResult, PaymentError, RemoteError, StorageError,
};
pub use ids::{Amount, Authority, EntityId, GatewayId, Identity, OrderId, PageCursor};
pub use record::{CachedRecord, EntityType, Page, RecordSource, Syncable, Timestamp};
