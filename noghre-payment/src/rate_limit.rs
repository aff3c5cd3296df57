//! Sliding-window rate limiting of payment initiation.
//!
//! Each identity owns a queue of attempt instants. A decision purges attempts
//! that have left the trailing window, then accepts and records the attempt
//! only if fewer than `max_attempts` remain. The queue lives behind its
//! `DashMap` entry, so purge-check-record is atomic per identity while
//! different identities only contend when they share a shard.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use noghre_core::{Identity, PaymentConfig};
use tokio::time::Instant;

/// Per-identity quota of payment initiations (default 5 per 60 seconds).
///
/// Construct one per process and share it by reference; a fresh instance has
/// no history, which is what tests rely on.
#[derive(Debug)]
pub struct PaymentRateLimiter {
    windows: DashMap<Identity, VecDeque<Instant>>,
    window: Duration,
    max_attempts: usize,
}

impl PaymentRateLimiter {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            max_attempts,
        }
    }

    pub fn from_config(config: &PaymentConfig) -> Self {
        Self::new(config.rate_limit_max_attempts, config.rate_limit_window)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Record an attempt for `identity` if the quota allows it.
    ///
    /// Returns `false` without recording when the window is full. Denial is
    /// a normal outcome, not an error.
    pub fn try_acquire(&self, identity: &Identity) -> bool {
        let now = Instant::now();
        let mut attempts = self.windows.entry(identity.clone()).or_default();
        purge(&mut attempts, now, self.window);

        if attempts.len() < self.max_attempts {
            attempts.push_back(now);
            true
        } else {
            tracing::debug!(
                identity = %identity,
                attempts = attempts.len(),
                max_attempts = self.max_attempts,
                "Payment initiation denied"
            );
            false
        }
    }

    /// Attempts currently inside the window.
    pub fn attempt_count(&self, identity: &Identity) -> usize {
        let now = Instant::now();
        match self.windows.get_mut(identity) {
            Some(mut attempts) => {
                purge(&mut attempts, now, self.window);
                attempts.len()
            }
            None => 0,
        }
    }

    /// Clear the window of `identity`.
    pub fn reset(&self, identity: &Identity) {
        if self.windows.remove(identity).is_some() {
            tracing::info!(identity = %identity, "Payment rate limit reset");
        }
    }

    /// Time until `identity` may attempt again, or `None` if it may now.
    pub fn retry_after(&self, identity: &Identity) -> Option<Duration> {
        let now = Instant::now();
        let mut attempts = self.windows.get_mut(identity)?;
        purge(&mut attempts, now, self.window);

        if attempts.len() < self.max_attempts {
            return None;
        }
        let oldest = *attempts.front()?;
        Some(self.window.saturating_sub(now.duration_since(oldest)))
    }

    /// Drop identities whose window has emptied. Returns how many were dropped.
    pub fn purge_idle(&self) -> usize {
        let now = Instant::now();
        let mut dropped = 0;
        self.windows.retain(|_, attempts| {
            purge(attempts, now, self.window);
            let keep = !attempts.is_empty();
            if !keep {
                dropped += 1;
            }
            keep
        });
        dropped
    }

    /// Identities with a tracked window.
    pub fn tracked_identities(&self) -> usize {
        self.windows.len()
    }
}

/// Drop attempts that are `window` or more in the past.
fn purge(attempts: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = attempts.front() {
        if now.duration_since(oldest) >= window {
            attempts.pop_front();
        } else {
            break;
        }
    }
}
