//! Uniform outcome container for sync and payment operations.
//!
//! `ResultEnvelope<T>` is what callers at the boundary receive. Internally the
//! crates use `NoghreResult<T>` and `?`; the envelope is produced at the edge
//! where staleness and the error taxonomy matter to the caller.
//!
//! ```rust,ignore
//! match coordinator.get(&id).await {
//!     ResultEnvelope::Success { value, stale: false } => render(value),
//!     ResultEnvelope::Success { value, stale: true } => render_with_banner(value),
//!     ResultEnvelope::Error { kind, .. } if kind.is_retriable() => offer_retry(),
//!     ResultEnvelope::Error { cause, .. } => show_error(cause),
//!     ResultEnvelope::Loading => spinner(),
//! }
//! ```

use crate::error::{ErrorKind, NoghreError, NoghreResult};

/// Outcome of an operation as seen by the caller.
///
/// # Variants
///
/// - `Success`: a value, flagged `stale` when it came from local fallback
/// - `Error`: a categorized failure plus its cause
/// - `Loading`: placeholder for callers that render in-progress state
#[derive(Debug, Clone, PartialEq)]
pub enum ResultEnvelope<T> {
    Success { value: T, stale: bool },
    Error { kind: ErrorKind, cause: NoghreError },
    Loading,
}

impl<T> ResultEnvelope<T> {
    /// A fresh value confirmed by the remote.
    pub fn fresh(value: T) -> Self {
        ResultEnvelope::Success {
            value,
            stale: false,
        }
    }

    /// A value served from local fallback.
    pub fn stale(value: T) -> Self {
        ResultEnvelope::Success { value, stale: true }
    }

    /// An error envelope; the kind is derived from the cause.
    pub fn error(cause: impl Into<NoghreError>) -> Self {
        let cause = cause.into();
        ResultEnvelope::Error {
            kind: cause.kind(),
            cause,
        }
    }

    pub fn loading() -> Self {
        ResultEnvelope::Loading
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResultEnvelope::Success { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ResultEnvelope::Error { .. })
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, ResultEnvelope::Loading)
    }

    /// True only for a successful value served from local fallback.
    pub fn is_stale(&self) -> bool {
        matches!(self, ResultEnvelope::Success { stale: true, .. })
    }

    /// Error kind, if this is an error envelope.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ResultEnvelope::Error { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            ResultEnvelope::Success { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            ResultEnvelope::Success { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Map the success value, keeping the staleness flag.
    pub fn map<U, F>(self, f: F) -> ResultEnvelope<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            ResultEnvelope::Success { value, stale } => ResultEnvelope::Success {
                value: f(value),
                stale,
            },
            ResultEnvelope::Error { kind, cause } => ResultEnvelope::Error { kind, cause },
            ResultEnvelope::Loading => ResultEnvelope::Loading,
        }
    }

    /// Chain an operation on the success value.
    ///
    /// Staleness is sticky: if `self` was stale, a successful result of `f`
    /// is stale too.
    pub fn and_then<U, F>(self, f: F) -> ResultEnvelope<U>
    where
        F: FnOnce(T) -> ResultEnvelope<U>,
    {
        match self {
            ResultEnvelope::Success { value, stale } => match f(value) {
                ResultEnvelope::Success {
                    value,
                    stale: inner,
                } => ResultEnvelope::Success {
                    value,
                    stale: stale || inner,
                },
                other => other,
            },
            ResultEnvelope::Error { kind, cause } => ResultEnvelope::Error { kind, cause },
            ResultEnvelope::Loading => ResultEnvelope::Loading,
        }
    }

    /// Transform the error cause; the kind is re-derived from the new cause.
    pub fn map_err<F>(self, f: F) -> Self
    where
        F: FnOnce(NoghreError) -> NoghreError,
    {
        match self {
            ResultEnvelope::Error { cause, .. } => ResultEnvelope::error(f(cause)),
            other => other,
        }
    }

    /// Collapse the envelope into a single value.
    pub fn fold<U>(
        self,
        on_success: impl FnOnce(T, bool) -> U,
        on_error: impl FnOnce(ErrorKind, NoghreError) -> U,
        on_loading: impl FnOnce() -> U,
    ) -> U {
        match self {
            ResultEnvelope::Success { value, stale } => on_success(value, stale),
            ResultEnvelope::Error { kind, cause } => on_error(kind, cause),
            ResultEnvelope::Loading => on_loading(),
        }
    }

    /// Convert to a `Result`, dropping the staleness flag.
    ///
    /// Returns `None` for `Loading`, which has no result yet.
    pub fn into_result(self) -> Option<NoghreResult<T>> {
        self.fold(
            |value, _| Some(Ok(value)),
            |_, cause| Some(Err(cause)),
            || None,
        )
    }
}

impl<T, E: Into<NoghreError>> From<Result<T, E>> for ResultEnvelope<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => ResultEnvelope::fresh(value),
            Err(e) => ResultEnvelope::error(e),
        }
    }
}
