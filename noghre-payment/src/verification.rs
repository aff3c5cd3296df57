//! Idempotent payment verification.
//!
//! Duplicate gateway callbacks, retried network calls and double taps can all
//! ask to verify the same authority. [`PaymentVerificationCache::verify_once`]
//! collapses them: a cached terminal outcome is returned without touching the
//! gateway, and while no outcome is cached at most one verification per
//! authority is in flight. Concurrent callers wait for that call and receive
//! its outcome.
//!
//! Only terminal outcomes are cached. A transient failure reaches every
//! waiting caller but leaves nothing behind, so the next attempt verifies
//! again.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use noghre_core::{Authority, PaymentConfig};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::gateway::VerificationOutcome;

/// A cached terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationEntry {
    pub outcome: VerificationOutcome,
    pub verified_at: Instant,
    pub ttl: Duration,
}

impl VerificationEntry {
    /// Live while `now - verified_at < ttl`.
    pub fn is_live_at(&self, now: Instant) -> bool {
        now.duration_since(self.verified_at) < self.ttl
    }
}

/// Counters for verification reuse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that found nothing live.
    pub misses: u64,
    /// Callers that waited on another caller's in-flight verification.
    pub joined: u64,
    /// Verifications actually run.
    pub executed: u64,
}

/// The slot of an in-flight verification.
struct InFlight {
    generation: u64,
    rx: watch::Receiver<Option<VerificationOutcome>>,
}

/// Releases an in-flight slot when its leader finishes or is dropped.
///
/// The generation check keeps a guard from removing a slot that a later
/// leader has since taken.
struct InFlightGuard<'a> {
    cache: &'a PaymentVerificationCache,
    authority: Authority,
    generation: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let generation = self.generation;
        self.cache
            .in_flight
            .remove_if(&self.authority, |_, slot| slot.generation == generation);
    }
}

/// Verification outcomes keyed by payment authority.
pub struct PaymentVerificationCache {
    entries: DashMap<Authority, VerificationEntry>,
    in_flight: DashMap<Authority, InFlight>,
    next_generation: AtomicU64,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    joined: AtomicU64,
    executed: AtomicU64,
}

impl PaymentVerificationCache {
    /// Create a cache whose `verify_once` records outcomes for `default_ttl`.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            next_generation: AtomicU64::new(0),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            joined: AtomicU64::new(0),
            executed: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &PaymentConfig) -> Self {
        Self::new(config.verification_ttl)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Store a terminal outcome for `ttl`.
    ///
    /// Transient outcomes are refused; returns whether the outcome was stored.
    pub fn record_verification(
        &self,
        authority: &Authority,
        outcome: VerificationOutcome,
        ttl: Duration,
    ) -> bool {
        if !outcome.is_terminal() {
            tracing::debug!(authority = %authority, "Not caching transient verification outcome");
            return false;
        }

        self.entries.insert(
            authority.clone(),
            VerificationEntry {
                outcome,
                verified_at: Instant::now(),
                ttl,
            },
        );
        true
    }

    /// The live outcome for `authority`, if any. Expired entries are dropped.
    pub fn get_cached(&self, authority: &Authority) -> Option<VerificationOutcome> {
        let now = Instant::now();
        let live = match self.entries.get(authority) {
            Some(entry) => entry.is_live_at(now).then(|| entry.outcome.clone()),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match live {
            Some(outcome) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(outcome)
            }
            None => {
                self.entries
                    .remove_if(authority, |_, entry| !entry.is_live_at(now));
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Verify `authority` at most once at a time.
    ///
    /// A live cached outcome is returned without calling `verify`. Otherwise
    /// the first caller runs `verify` and every concurrent caller for the
    /// same authority receives its outcome. A terminal outcome is cached for
    /// the default TTL. If the running caller is dropped before finishing, a
    /// waiting caller takes over.
    pub async fn verify_once<F, Fut>(&self, authority: &Authority, verify: F) -> VerificationOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = VerificationOutcome>,
    {
        let (tx, _guard) = loop {
            if let Some(outcome) = self.get_cached(authority) {
                return outcome;
            }

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let mut rx = match self.in_flight.entry(authority.clone()) {
                Entry::Occupied(slot) => slot.get().rx.clone(),
                Entry::Vacant(slot) => {
                    let (tx, rx) = watch::channel(None);
                    slot.insert(InFlight { generation, rx });
                    let guard = InFlightGuard {
                        cache: self,
                        authority: authority.clone(),
                        generation,
                    };
                    break (tx, guard);
                }
            };

            self.joined.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(authority = %authority, "Joining in-flight verification");

            let shared = match rx.wait_for(Option::is_some).await {
                Ok(value) => (*value).clone(),
                Err(_) => None,
            };
            match shared {
                Some(outcome) => return outcome,
                None => tracing::debug!(
                    authority = %authority,
                    "In-flight verification abandoned; retrying"
                ),
            }
        };

        // A previous leader may have cached an outcome after our lookup.
        if let Some(outcome) = self.get_cached(authority) {
            tx.send_replace(Some(outcome.clone()));
            return outcome;
        }

        self.executed.fetch_add(1, Ordering::Relaxed);
        let outcome = verify().await;

        if outcome.is_terminal() {
            self.record_verification(authority, outcome.clone(), self.default_ttl);
            tracing::info!(
                authority = %authority,
                confirmed = outcome.is_confirmed(),
                "Payment verification recorded"
            );
        } else {
            tracing::warn!(
                authority = %authority,
                kind = ?outcome.error_kind(),
                "Payment verification inconclusive; will retry on next attempt"
            );
        }

        tx.send_replace(Some(outcome.clone()));
        outcome
    }

    /// Forget the outcome for `authority` (after settlement).
    pub fn invalidate(&self, authority: &Authority) -> bool {
        self.entries.remove(authority).is_some()
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut dropped = 0;
        self.entries.retain(|_, entry| {
            let keep = entry.is_live_at(now);
            if !keep {
                dropped += 1;
            }
            keep
        });
        dropped
    }

    /// Entries currently stored, live or not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Authorities with a verification in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> VerificationStats {
        VerificationStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noghre_core::RemoteError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn confirmed() -> VerificationOutcome {
        VerificationOutcome::Confirmed {
            ref_id: "ref-77".to_string(),
        }
    }

    fn transient() -> VerificationOutcome {
        VerificationOutcome::Transient {
            error: RemoteError::NetworkUnavailable {
                reason: "connection reset".to_string(),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_boundary() {
        let cache = PaymentVerificationCache::new(Duration::from_secs(300));
        let authority = Authority::new("A1");

        assert!(cache.record_verification(&authority, confirmed(), Duration::from_secs(300)));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.get_cached(&authority), Some(confirmed()));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get_cached(&authority), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_outcome_is_refused() {
        let cache = PaymentVerificationCache::new(Duration::from_secs(300));
        let authority = Authority::new("A2");

        assert!(!cache.record_verification(&authority, transient(), Duration::from_secs(300)));
        assert_eq!(cache.get_cached(&authority), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_once_uses_cache() {
        let cache = PaymentVerificationCache::new(Duration::from_secs(300));
        let authority = Authority::new("A3");
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let outcome = cache
                .verify_once(&authority, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    confirmed()
                })
                .await;
            assert_eq!(outcome, confirmed());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_outcome_is_retried() {
        let cache = PaymentVerificationCache::new(Duration::from_secs(300));
        let authority = Authority::new("A4");

        let first = cache.verify_once(&authority, || async { transient() }).await;
        assert_eq!(first, transient());
        assert_eq!(cache.get_cached(&authority), None);

        let second = cache.verify_once(&authority, || async { confirmed() }).await;
        assert_eq!(second, confirmed());
        assert_eq!(cache.stats().executed, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_call() {
        let cache = Arc::new(PaymentVerificationCache::new(Duration::from_secs(300)));
        let authority = Authority::new("A5");
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let authority = authority.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .verify_once(&authority, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        confirmed()
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.expect("task should join"), confirmed());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_leader_hands_over() {
        let cache = Arc::new(PaymentVerificationCache::new(Duration::from_secs(300)));
        let authority = Authority::new("A6");

        let leader = {
            let cache = Arc::clone(&cache);
            let authority = authority.clone();
            tokio::spawn(async move {
                cache
                    .verify_once(&authority, || async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        confirmed()
                    })
                    .await
            })
        };
        // Let the leader take the slot.
        tokio::task::yield_now().await;
        assert_eq!(cache.in_flight_count(), 1);

        let follower = {
            let cache = Arc::clone(&cache);
            let authority = authority.clone();
            tokio::spawn(async move {
                cache
                    .verify_once(&authority, || async {
                        VerificationOutcome::Rejected {
                            reason: "expired".to_string(),
                        }
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        leader.abort();
        let outcome = follower.await.expect("follower should join");
        assert!(matches!(outcome, VerificationOutcome::Rejected { .. }));
        assert_eq!(cache.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_purge() {
        let cache = PaymentVerificationCache::new(Duration::from_secs(300));
        let settled = Authority::new("A7");
        let short = Authority::new("A8");

        cache.record_verification(&settled, confirmed(), Duration::from_secs(300));
        cache.record_verification(&short, confirmed(), Duration::from_secs(10));

        assert!(cache.invalidate(&settled));
        assert_eq!(cache.get_cached(&settled), None);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }
}
