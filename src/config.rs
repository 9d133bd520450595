use std::path::PathBuf;
use std::time::Duration;

use crate::engine::ConflictPolicy;
use crate::model::Ms;
use crate::reconciler::{ReconcileMode, ReconcileOptions};

/// Runtime settings, read once from `ONDUTY_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub conflict_policy: ConflictPolicy,
    pub reconcile: ReconcileOptions,
    pub sweep_interval: Duration,
    /// Appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    /// How long finished facts are kept in the log after they end.
    pub retention_ms: Ms,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            conflict_policy: ConflictPolicy::Overlap,
            reconcile: ReconcileOptions {
                mode: ReconcileMode::Queued,
                ..ReconcileOptions::default()
            },
            sweep_interval: Duration::from_secs(5),
            compact_threshold: 1000,
            retention_ms: 30 * 24 * 3_600_000,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let d = Self::default();
        Self {
            data_dir: lookup("ONDUTY_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            metrics_port: lookup("ONDUTY_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            conflict_policy: lookup("ONDUTY_CONFLICT_POLICY")
                .and_then(|s| ConflictPolicy::parse(&s))
                .unwrap_or(d.conflict_policy),
            reconcile: ReconcileOptions {
                mode: lookup("ONDUTY_RECONCILE_MODE")
                    .and_then(|s| ReconcileMode::parse(&s))
                    .unwrap_or(d.reconcile.mode),
                store_timeout: parsed("ONDUTY_STORE_TIMEOUT_MS")
                    .map_or(d.reconcile.store_timeout, Duration::from_millis),
                max_attempts: parsed("ONDUTY_RECONCILE_RETRIES")
                    .map_or(d.reconcile.max_attempts, |n| n.clamp(1, 100) as u32),
                retry_backoff: parsed("ONDUTY_RETRY_BACKOFF_MS")
                    .map_or(d.reconcile.retry_backoff, Duration::from_millis),
            },
            sweep_interval: parsed("ONDUTY_SWEEP_INTERVAL_MS")
                .filter(|&ms| ms > 0)
                .map_or(d.sweep_interval, Duration::from_millis),
            compact_threshold: parsed("ONDUTY_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            retention_ms: parsed("ONDUTY_RETENTION_MS").map_or(d.retention_ms, |ms| ms as Ms),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("facts.wal")
    }
}
