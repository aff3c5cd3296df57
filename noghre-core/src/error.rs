//! Error types for Noghre operations

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR KIND
// ============================================================================

/// High-level error categorization shared by the sync and payment paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NetworkUnavailable,
    Timeout,
    /// Remote returned a 5xx status.
    ServerError,
    /// Remote returned a 4xx status not covered by a more specific kind.
    ClientError,
    Unauthorized,
    Forbidden,
    NotFound,
    ValidationError,
    /// Payment initiation refused by the rate limiter.
    PaymentDenied,
    PaymentVerificationFailed,
    Unknown,
}

impl ErrorKind {
    /// Whether the failure is transient infrastructure trouble.
    ///
    /// Transient kinds allow a stale local fallback; every other kind is a
    /// definitive answer from the remote (or from policy) and must reach the
    /// caller unmasked.
    pub fn is_transient(self) -> bool {
        match self {
            ErrorKind::NetworkUnavailable | ErrorKind::Timeout | ErrorKind::ServerError => true,
            ErrorKind::ClientError
            | ErrorKind::Unauthorized
            | ErrorKind::Forbidden
            | ErrorKind::NotFound
            | ErrorKind::ValidationError
            | ErrorKind::PaymentDenied
            | ErrorKind::PaymentVerificationFailed
            | ErrorKind::Unknown => false,
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retriable(self) -> bool {
        match self {
            ErrorKind::NetworkUnavailable
            | ErrorKind::Timeout
            | ErrorKind::ServerError
            | ErrorKind::PaymentDenied
            | ErrorKind::PaymentVerificationFailed => true,
            ErrorKind::ClientError
            | ErrorKind::Unauthorized
            | ErrorKind::Forbidden
            | ErrorKind::NotFound
            | ErrorKind::ValidationError
            | ErrorKind::Unknown => false,
        }
    }
}

// ============================================================================
// REMOTE ERRORS
// ============================================================================

/// Failures reported by the remote store or a payment gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Network unavailable: {reason}")]
    NetworkUnavailable { reason: String },

    #[error("Remote {operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("Remote responded with status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Entity not found: {id}")]
    NotFound { id: String },

    #[error("Invalid value for {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Unexpected remote failure: {reason}")]
    Unknown { reason: String },
}

impl RemoteError {
    /// Build an error from an HTTP status line.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        RemoteError::Http {
            status,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::NetworkUnavailable { .. } => ErrorKind::NetworkUnavailable,
            RemoteError::Timeout { .. } => ErrorKind::Timeout,
            RemoteError::Http { status, .. } => match *status {
                401 => ErrorKind::Unauthorized,
                403 => ErrorKind::Forbidden,
                404 => ErrorKind::NotFound,
                422 => ErrorKind::ValidationError,
                400..=499 => ErrorKind::ClientError,
                500..=599 => ErrorKind::ServerError,
                _ => ErrorKind::Unknown,
            },
            RemoteError::NotFound { .. } => ErrorKind::NotFound,
            RemoteError::Validation { .. } => ErrorKind::ValidationError,
            RemoteError::Unknown { .. } => ErrorKind::Unknown,
        }
    }
}

// ============================================================================
// STORAGE ERRORS
// ============================================================================

/// Local store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend failure: {reason}")]
    Backend { reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Corrupt record under key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

// ============================================================================
// PAYMENT ERRORS
// ============================================================================

/// Payment-path outcomes surfaced as errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PaymentError {
    #[error("Payment attempts exhausted for {identity}, retry after {retry_after_secs}s")]
    RateLimited {
        identity: String,
        retry_after_secs: u64,
    },

    #[error("Verification of {authority} failed: {reason}")]
    VerificationFailed { authority: String, reason: String },
}

// ============================================================================
// CONFIG ERRORS
// ============================================================================

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

// ============================================================================
// MASTER ERROR
// ============================================================================

/// Master error type for all Noghre errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NoghreError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl NoghreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NoghreError::Remote(e) => e.kind(),
            NoghreError::Storage(_) => ErrorKind::Unknown,
            NoghreError::Payment(PaymentError::RateLimited { .. }) => ErrorKind::PaymentDenied,
            NoghreError::Payment(PaymentError::VerificationFailed { .. }) => {
                ErrorKind::PaymentVerificationFailed
            }
            NoghreError::Config(_) => ErrorKind::ValidationError,
        }
    }
}

/// Result type alias for Noghre operations.
pub type NoghreResult<T> = Result<T, NoghreError>;

// =============================================================================
// TESTS
// =============================================================================
