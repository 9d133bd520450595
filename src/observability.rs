use std::net::SocketAddr;

// ── Fact writes ─────────────────────────────────────────────────

/// Counter: fact events persisted. Labels: kind.
pub const FACT_MUTATIONS_TOTAL: &str = "onduty_fact_mutations_total";

/// Counter: booking requests rejected by the conflict detector.
pub const BOOKING_CONFLICTS_TOTAL: &str = "onduty_booking_conflicts_total";

// ── Reconciliation ──────────────────────────────────────────────

/// Counter: resolution passes. Labels: outcome (changed, unchanged, failed, dropped).
pub const RECONCILIATIONS_TOTAL: &str = "onduty_reconciliations_total";

/// Counter: retries after a transient store failure.
pub const RECONCILE_RETRIES_TOTAL: &str = "onduty_reconcile_retries_total";

/// Histogram: duration of one resolution pass in seconds.
pub const RECONCILE_DURATION_SECONDS: &str = "onduty_reconcile_duration_seconds";

/// Counter: appended availability records. Labels: status.
pub const STATUS_CHANGES_TOTAL: &str = "onduty_status_changes_total";

/// Gauge: professionals waiting in the reconcile queue.
pub const RECONCILE_PENDING: &str = "onduty_reconcile_pending";

/// Gauge: professionals whose availability could not be brought up to date.
pub const STALE_PROFESSIONALS: &str = "onduty_stale_professionals";

/// Counter: professionals enqueued by the periodic sweep.
pub const SWEEP_TRIGGERED_TOTAL: &str = "onduty_sweep_triggered_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "onduty_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "onduty_wal_flush_batch_size";

/// Gauge: registered professionals.
pub const PROFESSIONALS_ACTIVE: &str = "onduty_professionals_active";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
