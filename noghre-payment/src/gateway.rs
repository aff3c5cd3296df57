//! Payment gateway interface and verification outcomes.

use async_trait::async_trait;
use noghre_core::{Amount, Authority, ErrorKind, GatewayId, OrderId, RemoteError};
use serde::{Deserialize, Serialize};

/// Where to send the buyer to complete a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRedirect {
    /// Correlation token for this attempt; the key for verification.
    pub authority: Authority,
    pub redirect_url: String,
}

/// Result of verifying one payment authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// The gateway confirmed the payment.
    Confirmed { ref_id: String },
    /// The gateway definitively refused the payment.
    Rejected { reason: String },
    /// No definitive answer (timeout, transport failure, gateway fault).
    Transient { error: RemoteError },
}

impl VerificationOutcome {
    /// Whether the gateway gave a definitive answer that may be cached.
    pub fn is_terminal(&self) -> bool {
        match self {
            VerificationOutcome::Confirmed { .. } | VerificationOutcome::Rejected { .. } => true,
            VerificationOutcome::Transient { .. } => false,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, VerificationOutcome::Confirmed { .. })
    }

    /// Error kind of a transient outcome.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            VerificationOutcome::Transient { error } => Some(error.kind()),
            _ => None,
        }
    }
}

impl From<RemoteError> for VerificationOutcome {
    /// A failed gateway call never counts as a definitive answer.
    fn from(error: RemoteError) -> Self {
        VerificationOutcome::Transient { error }
    }
}

/// Payment provider.
///
/// Implementations report transport and protocol failures as
/// [`RemoteError`]; a payment the gateway refuses is an `Ok` carrying
/// [`VerificationOutcome::Rejected`].
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Open a payment attempt for an order.
    async fn request_payment(
        &self,
        order_id: &OrderId,
        amount: Amount,
        gateway: &GatewayId,
    ) -> Result<PaymentRedirect, RemoteError>;

    /// Ask the gateway whether the attempt identified by `authority` succeeded.
    async fn verify_payment(
        &self,
        authority: &Authority,
        amount: Amount,
    ) -> Result<VerificationOutcome, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_outcomes() {
        let confirmed = VerificationOutcome::Confirmed {
            ref_id: "201".to_string(),
        };
        let rejected = VerificationOutcome::Rejected {
            reason: "cancelled by buyer".to_string(),
        };
        let transient = VerificationOutcome::from(RemoteError::Timeout {
            operation: "verify_payment".to_string(),
            after_ms: 30_000,
        });

        assert!(confirmed.is_terminal());
        assert!(confirmed.is_confirmed());
        assert!(rejected.is_terminal());
        assert!(!rejected.is_confirmed());
        assert!(!transient.is_terminal());
        assert_eq!(transient.error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(confirmed.error_kind(), None);
    }
}
