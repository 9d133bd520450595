use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, FactStore};
use crate::model::Ms;
use crate::observability;
use crate::reconciler::Reconciler;

/// Background task that re-triggers professionals whose status is due to
/// change on its own, plus any left stale by a failed reconciliation.
pub async fn run_sweeper<S: FactStore + 'static>(reconciler: Arc<Reconciler<S>>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let now = reconciler.now();
        let triggered = reconciler.sweep(now).await;
        if triggered > 0 {
            metrics::counter!(observability::SWEEP_TRIGGERED_TOTAL).increment(triggered as u64);
            debug!(triggered, "sweep triggered reconciliation");
        }
    }
}

/// Background task that snapshots the WAL once enough appends pile up.
/// Finished facts older than `retention_ms` are dropped from the snapshot.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, retention_ms: Ms, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Some(kept) = compact_if_due(&engine, threshold, retention_ms).await {
            info!(events = kept, "WAL compacted");
        }
    }
}

/// One compactor step. Returns the number of events kept when it ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64, retention_ms: Ms) -> Option<usize> {
    if engine.wal_appends_since_compact().await < threshold {
        return None;
    }
    let horizon = crate::engine::now_ms().saturating_sub(retention_ms);
    match engine.compact_wal(horizon).await {
        Ok(kept) => Some(kept),
        Err(e) => {
            warn!(error = %e, "WAL compaction failed");
            None
        }
    }
}
