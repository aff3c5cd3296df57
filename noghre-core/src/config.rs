//! Configuration Module
//!
//! Injected configuration for the sync coordinator and the payment-safety
//! components. Values are loaded from environment variables with defaults that
//! match production behaviour; tests build configs directly with the `with_*`
//! builders.

use crate::error::{ConfigError, NoghreError, NoghreResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default timeout for every remote call (30 seconds).
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default retention for cached records (7 days).
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default interval between retention sweeps (1 hour).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default buffer of the per-id observation channel.
pub const DEFAULT_OBSERVER_CAPACITY: usize = 64;

/// Default sliding window for payment initiation (60 seconds).
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Default quota of payment initiations per window.
pub const DEFAULT_RATE_LIMIT_MAX_ATTEMPTS: usize = 5;

/// Default lifetime of a cached verification outcome (5 minutes).
pub const DEFAULT_VERIFICATION_TTL: Duration = Duration::from_secs(300);

// ============================================================================
// SYNC CONFIGURATION
// ============================================================================

/// Configuration for the sync coordinator and local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Upper bound on any remote fetch or mutation.
    pub remote_timeout: Duration,
    /// Records older than this are eligible for eviction.
    pub retention: Duration,
    /// How often the retention sweep runs.
    pub sweep_interval: Duration,
    /// Buffered updates per observed id before slow observers lag.
    pub observer_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            retention: DEFAULT_RETENTION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            observer_capacity: DEFAULT_OBSERVER_CAPACITY,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_observer_capacity(mut self, capacity: usize) -> Self {
        self.observer_capacity = capacity;
        self
    }

    /// Create SyncConfig from environment variables.
    ///
    /// Environment variables:
    /// - `NOGHRE_REMOTE_TIMEOUT_SECS`: Remote call timeout (default: 30)
    /// - `NOGHRE_RETENTION_SECS`: Local record retention (default: 604800)
    /// - `NOGHRE_SWEEP_INTERVAL_SECS`: Retention sweep interval (default: 3600)
    /// - `NOGHRE_OBSERVER_CAPACITY`: Observation channel buffer (default: 64)
    ///
    /// Unset or unparsable variables keep their defaults. The result is
    /// validated, so a zero timeout or capacity is an error.
    pub fn from_env() -> NoghreResult<Self> {
        let defaults = Self::default();
        let config = Self {
            remote_timeout: env_secs("NOGHRE_REMOTE_TIMEOUT_SECS")
                .unwrap_or(defaults.remote_timeout),
            retention: env_secs("NOGHRE_RETENTION_SECS").unwrap_or(defaults.retention),
            sweep_interval: env_secs("NOGHRE_SWEEP_INTERVAL_SECS")
                .unwrap_or(defaults.sweep_interval),
            observer_capacity: env_parse("NOGHRE_OBSERVER_CAPACITY")
                .unwrap_or(defaults.observer_capacity),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NoghreResult<()> {
        require_positive("sync.remote_timeout", self.remote_timeout)?;
        require_positive("sync.retention", self.retention)?;
        require_positive("sync.sweep_interval", self.sweep_interval)?;
        if self.observer_capacity == 0 {
            return Err(invalid(
                "sync.observer_capacity",
                "0",
                "observer_capacity must be at least 1",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// PAYMENT CONFIGURATION
// ============================================================================

/// Configuration for the payment rate limiter and verification cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Sliding window for counting initiation attempts.
    pub rate_limit_window: Duration,
    /// Attempts allowed per identity within the window.
    pub rate_limit_max_attempts: usize,
    /// How long a terminal verification outcome is reused.
    pub verification_ttl: Duration,
    /// Upper bound on a gateway request or verification call.
    pub gateway_timeout: Duration,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            rate_limit_window: DEFAULT_RATE_LIMIT_WINDOW,
            rate_limit_max_attempts: DEFAULT_RATE_LIMIT_MAX_ATTEMPTS,
            verification_ttl: DEFAULT_VERIFICATION_TTL,
            gateway_timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }
}

impl PaymentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate_limit(mut self, max_attempts: usize, window: Duration) -> Self {
        self.rate_limit_max_attempts = max_attempts;
        self.rate_limit_window = window;
        self
    }

    pub fn with_verification_ttl(mut self, ttl: Duration) -> Self {
        self.verification_ttl = ttl;
        self
    }

    pub fn with_gateway_timeout(mut self, timeout: Duration) -> Self {
        self.gateway_timeout = timeout;
        self
    }

    /// Create PaymentConfig from environment variables.
    ///
    /// Environment variables:
    /// - `NOGHRE_PAYMENT_WINDOW_SECS`: Rate limit window (default: 60)
    /// - `NOGHRE_PAYMENT_MAX_ATTEMPTS`: Attempts per window (default: 5)
    /// - `NOGHRE_VERIFICATION_TTL_SECS`: Verification reuse TTL (default: 300)
    /// - `NOGHRE_GATEWAY_TIMEOUT_SECS`: Gateway call timeout (default: 30)
    ///
    /// The result is validated, so a zero window, quota or TTL is an error.
    pub fn from_env() -> NoghreResult<Self> {
        let defaults = Self::default();
        let config = Self {
            rate_limit_window: env_secs("NOGHRE_PAYMENT_WINDOW_SECS")
                .unwrap_or(defaults.rate_limit_window),
            rate_limit_max_attempts: env_parse("NOGHRE_PAYMENT_MAX_ATTEMPTS")
                .unwrap_or(defaults.rate_limit_max_attempts),
            verification_ttl: env_secs("NOGHRE_VERIFICATION_TTL_SECS")
                .unwrap_or(defaults.verification_ttl),
            gateway_timeout: env_secs("NOGHRE_GATEWAY_TIMEOUT_SECS")
                .unwrap_or(defaults.gateway_timeout),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NoghreResult<()> {
        require_positive("payment.rate_limit_window", self.rate_limit_window)?;
        require_positive("payment.verification_ttl", self.verification_ttl)?;
        require_positive("payment.gateway_timeout", self.gateway_timeout)?;
        if self.rate_limit_max_attempts == 0 {
            return Err(invalid(
                "payment.rate_limit_max_attempts",
                "0",
                "rate_limit_max_attempts must be at least 1",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// MASTER CONFIGURATION
// ============================================================================

/// Every injected value, grouped per subsystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoghreConfig {
    pub sync: SyncConfig,
    pub payment: PaymentConfig,
}

impl NoghreConfig {
    pub fn from_env() -> NoghreResult<Self> {
        Ok(Self {
            sync: SyncConfig::from_env()?,
            payment: PaymentConfig::from_env()?,
        })
    }

    pub fn validate(&self) -> NoghreResult<()> {
        self.sync.validate()?;
        self.payment.validate()
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_secs)
}

fn invalid(field: &str, value: &str, reason: &str) -> NoghreError {
    NoghreError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

fn require_positive(field: &str, value: Duration) -> NoghreResult<()> {
    if value.is_zero() {
        return Err(invalid(
            field,
            &format!("{:?}", value),
            "duration must be positive",
        ));
    }
    Ok(())
}
