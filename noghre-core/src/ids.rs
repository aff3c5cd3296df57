//! Identity types for synced entities and payment correlation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declares a string-backed identifier newtype.
///
/// Remote ids arrive as opaque strings (or numbers rendered as strings), so
/// every identifier wraps a `String` and is ordered lexicographically.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Borrow the raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume the wrapper and return the raw identifier.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a synced entity, as issued by the remote store.
    EntityId
);

string_id!(
    /// Caller identity used to key payment-initiation quotas.
    ///
    /// Supplied by the credential provider; never derived from secrets here.
    Identity
);

string_id!(
    /// Correlation token a payment gateway issues for one payment attempt.
    Authority
);

string_id!(
    /// Storefront order identifier.
    OrderId
);

string_id!(
    /// Name of the payment gateway handling a request (e.g. `zarinpal`).
    GatewayId
);

string_id!(
    /// Opaque pagination cursor returned by the remote store.
    PageCursor
);

impl From<u64> for EntityId {
    fn from(raw: u64) -> Self {
        Self(raw.to_string())
    }
}

/// Monetary amount in the smallest currency unit (rials).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(pub u64);

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} IRR", self.0)
    }
}
