//! Noghre Payment - Payment-path safety
//!
//! Guards monetary operations against abuse and duplicate processing:
//!
//! - [`PaymentRateLimiter`]: sliding-window quota of payment initiations per identity
//! - [`PaymentVerificationCache`]: idempotent, single-flight verification per authority
//! - [`PaymentGateway`]: interface to the payment provider
//! - [`PaymentService`]: the payment path composing the three

pub mod gateway;
pub mod rate_limit;
pub mod service;
pub mod verification;

pub use gateway::{PaymentGateway, PaymentRedirect, VerificationOutcome};
pub use rate_limit::PaymentRateLimiter;
pub use service::PaymentService;
pub use verification::{PaymentVerificationCache, VerificationEntry, VerificationStats};
