//! The payment path.
//!
//! Initiation is rate limited per identity before the gateway is contacted.
//! Verification goes through the verification cache so duplicate requests
//! for one authority reach the gateway at most once at a time, and a
//! terminal answer is reused until its TTL lapses or the payment is settled.

use std::sync::Arc;

use noghre_core::{
    Amount, Authority, GatewayId, Identity, OrderId, PaymentConfig, PaymentError, RemoteError,
    ResultEnvelope,
};

use crate::gateway::{PaymentGateway, PaymentRedirect, VerificationOutcome};
use crate::rate_limit::PaymentRateLimiter;
use crate::verification::PaymentVerificationCache;

/// Payment operations for one gateway.
pub struct PaymentService<G: PaymentGateway> {
    gateway: Arc<G>,
    limiter: Arc<PaymentRateLimiter>,
    verifications: Arc<PaymentVerificationCache>,
    config: PaymentConfig,
}

impl<G: PaymentGateway> PaymentService<G> {
    /// Build a service with its own limiter and verification cache.
    pub fn new(gateway: Arc<G>, config: PaymentConfig) -> Self {
        let limiter = Arc::new(PaymentRateLimiter::from_config(&config));
        let verifications = Arc::new(PaymentVerificationCache::from_config(&config));
        Self::with_components(gateway, limiter, verifications, config)
    }

    /// Build a service around a limiter and cache shared with other services.
    pub fn with_components(
        gateway: Arc<G>,
        limiter: Arc<PaymentRateLimiter>,
        verifications: Arc<PaymentVerificationCache>,
        config: PaymentConfig,
    ) -> Self {
        Self {
            gateway,
            limiter,
            verifications,
            config,
        }
    }

    pub fn limiter(&self) -> &Arc<PaymentRateLimiter> {
        &self.limiter
    }

    pub fn verifications(&self) -> &Arc<PaymentVerificationCache> {
        &self.verifications
    }

    /// Start a payment for `order_id`.
    ///
    /// Returns `Error(PaymentDenied)` without contacting the gateway when
    /// `identity` has used up its quota.
    pub async fn initiate(
        &self,
        identity: &Identity,
        order_id: &OrderId,
        amount: Amount,
        gateway_id: &GatewayId,
    ) -> ResultEnvelope<PaymentRedirect> {
        if !self.limiter.try_acquire(identity) {
            let retry_after_secs = self
                .limiter
                .retry_after(identity)
                .map(|wait| wait.as_secs().max(1))
                .unwrap_or(1);
            tracing::info!(
                identity = %identity,
                order_id = %order_id,
                retry_after_secs,
                "Payment initiation throttled"
            );
            return ResultEnvelope::error(PaymentError::RateLimited {
                identity: identity.to_string(),
                retry_after_secs,
            });
        }

        let limit = self.config.gateway_timeout;
        let request = self.gateway.request_payment(order_id, amount, gateway_id);
        match tokio::time::timeout(limit, request).await {
            Ok(Ok(redirect)) => {
                tracing::info!(
                    order_id = %order_id,
                    amount = %amount,
                    authority = %redirect.authority,
                    "Payment initiated"
                );
                ResultEnvelope::fresh(redirect)
            }
            Ok(Err(e)) => {
                tracing::warn!(order_id = %order_id, error = %e, "Payment request failed");
                ResultEnvelope::error(e)
            }
            Err(_) => ResultEnvelope::error(RemoteError::Timeout {
                operation: "request_payment".to_string(),
                after_ms: limit.as_millis() as u64,
            }),
        }
    }

    /// Verify the payment identified by `authority`.
    ///
    /// A confirmed payment is a success. A rejection is
    /// `Error(PaymentVerificationFailed)` and is cached like a confirmation.
    /// An inconclusive answer carries the underlying error kind and is not
    /// cached.
    pub async fn verify(
        &self,
        authority: &Authority,
        amount: Amount,
    ) -> ResultEnvelope<VerificationOutcome> {
        let gateway = Arc::clone(&self.gateway);
        let limit = self.config.gateway_timeout;

        let outcome = self
            .verifications
            .verify_once(authority, || async move {
                match tokio::time::timeout(limit, gateway.verify_payment(authority, amount)).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) => VerificationOutcome::from(e),
                    Err(_) => VerificationOutcome::from(RemoteError::Timeout {
                        operation: "verify_payment".to_string(),
                        after_ms: limit.as_millis() as u64,
                    }),
                }
            })
            .await;

        match outcome {
            VerificationOutcome::Confirmed { .. } => ResultEnvelope::fresh(outcome),
            VerificationOutcome::Rejected { reason } => {
                ResultEnvelope::error(PaymentError::VerificationFailed {
                    authority: authority.to_string(),
                    reason,
                })
            }
            VerificationOutcome::Transient { error } => ResultEnvelope::error(error),
        }
    }

    /// Forget the verification of a settled payment.
    pub fn settle(&self, authority: &Authority) -> bool {
        let removed = self.verifications.invalidate(authority);
        tracing::debug!(authority = %authority, removed, "Payment settled");
        removed
    }
}
