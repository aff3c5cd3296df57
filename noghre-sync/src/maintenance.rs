//! Retention Sweep Background Task
//!
//! Periodically evicts local records whose `fetched_at` is older than the
//! configured retention (default 7 days). Records are also removed on explicit
//! invalidation; the sweep only bounds how long an untouched record lingers.
//!
//! ```ignore
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handle = tokio::spawn(retention_sweep_task(store, SyncConfig::from_env()?, shutdown_rx));
//!
//! // Later, trigger shutdown
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use noghre_core::SyncConfig;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::store::LocalStore;

// ============================================================================
// METRICS
// ============================================================================

/// Counters for retention sweeps.
#[derive(Debug, Default)]
pub struct SweepMetrics {
    /// Total records evicted since startup
    pub records_purged: AtomicU64,

    /// Total sweep cycles completed
    pub sweep_cycles: AtomicU64,

    /// Total errors encountered during sweeps
    pub sweep_errors: AtomicU64,
}

impl SweepMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> SweepMetricsSnapshot {
        SweepMetricsSnapshot {
            records_purged: self.records_purged.load(Ordering::Relaxed),
            sweep_cycles: self.sweep_cycles.load(Ordering::Relaxed),
            sweep_errors: self.sweep_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of sweep metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepMetricsSnapshot {
    pub records_purged: u64,
    pub sweep_cycles: u64,
    pub sweep_errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Run retention sweeps every `config.sweep_interval` until shutdown.
///
/// The first sweep runs immediately. The task stops when `true` is sent on
/// the shutdown channel or when its sender is dropped. Returns the metrics
/// collected during the task's lifetime.
pub async fn retention_sweep_task<S>(
    store: Arc<S>,
    config: SyncConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<SweepMetrics>
where
    S: LocalStore,
{
    let metrics = Arc::new(SweepMetrics::new());

    let mut sweep_interval = interval(config.sweep_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        sweep_interval_secs = config.sweep_interval.as_secs(),
        retention_secs = config.retention.as_secs(),
        "Retention sweep task started"
    );

    loop {
        tokio::select! {
            res = shutdown_rx.changed() => {
                // A dropped sender counts as shutdown.
                if res.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Retention sweep task shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                sweep_once(store.as_ref(), &config, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        records_purged = snapshot.records_purged,
        sweep_cycles = snapshot.sweep_cycles,
        sweep_errors = snapshot.sweep_errors,
        "Retention sweep task completed"
    );

    metrics
}

/// Perform one retention sweep.
async fn sweep_once<S>(store: &S, config: &SyncConfig, metrics: &SweepMetrics)
where
    S: LocalStore,
{
    metrics.sweep_cycles.fetch_add(1, Ordering::Relaxed);

    match store.purge_older_than(config.retention).await {
        Ok(0) => tracing::trace!("Retention sweep found nothing to evict"),
        Ok(purged) => {
            metrics.records_purged.fetch_add(purged, Ordering::Relaxed);
            tracing::info!(purged, "Retention sweep evicted records");
        }
        Err(e) => {
            tracing::error!(error = %e, "Retention sweep failed");
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}
