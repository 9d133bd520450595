use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::engine::{EngineError, FactStore, now_ms, resolve, timed};
use crate::limits::RECONCILE_QUEUE_CAPACITY;
use crate::model::*;
use crate::notify::{Notifier, StatusChange};
use crate::observability;

/// When resolution runs relative to the mutation that triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    /// Resolve and persist before `on_fact_changed` returns.
    Inline,
    /// Mark the professional pending and let the background worker resolve.
    Queued,
}

impl ReconcileMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "inline" | "sync" => Some(ReconcileMode::Inline),
            "queued" | "async" => Some(ReconcileMode::Queued),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub mode: ReconcileMode,
    /// Bound on every individual store call.
    pub store_timeout: Duration,
    /// Attempts per request before the professional is marked stale.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub retry_backoff: Duration,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            mode: ReconcileMode::Inline,
            store_timeout: Duration::from_secs(2),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

/// Result of one successful resolution pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub resolution: ResolvedAvailability,
    /// The appended record, or `None` when the status was unchanged.
    pub record: Option<AvailabilityRecord>,
}

/// What `on_fact_changed` did with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Reconciled(Reconciled),
    Queued,
    /// A request for this professional was already waiting.
    AlreadyPending,
    /// Resolution failed; the professional is stale and will be retried.
    Stale(EngineError),
    /// The professional no longer exists.
    Dropped,
}

pub type Clock = Arc<dyn Fn() -> Ms + Send + Sync>;

/// Keeps each professional's derived availability in step with its facts.
///
/// Resolution for one professional is serialized by a per-professional mutex
/// spanning resolve + append, so records land in timestamp order. Failures
/// never propagate to the mutation that triggered them.
pub struct Reconciler<S: FactStore + 'static> {
    store: Arc<S>,
    notifier: Option<Arc<dyn Notifier>>,
    options: ReconcileOptions,
    clock: Clock,
    locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Professionals with a queued, not yet started, resolution.
    pending: DashMap<Ulid, ()>,
    /// Professionals whose last resolution failed → time of that failure.
    stale: DashMap<Ulid, Ms>,
    /// Next instant each professional's status is expected to change.
    wakeups: DashMap<Ulid, Ms>,
    queue_tx: mpsc::Sender<Ulid>,
    queue_rx: Mutex<Option<mpsc::Receiver<Ulid>>>,
}

impl<S: FactStore + 'static> Reconciler<S> {
    pub fn new(store: Arc<S>, options: ReconcileOptions) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(RECONCILE_QUEUE_CAPACITY);
        Self {
            store,
            notifier: None,
            options,
            clock: Arc::new(now_ms),
            locks: DashMap::new(),
            pending: DashMap::new(),
            stale: DashMap::new(),
            wakeups: DashMap::new(),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    pub fn mode(&self) -> ReconcileMode {
        self.options.mode
    }

    pub fn now(&self) -> Ms {
        (self.clock)()
    }

    pub fn is_pending(&self, professional_id: &Ulid) -> bool {
        self.pending.contains_key(professional_id)
    }

    pub fn is_stale(&self, professional_id: &Ulid) -> bool {
        self.stale.contains_key(professional_id)
    }

    pub fn wakeup_for(&self, professional_id: &Ulid) -> Option<Ms> {
        self.wakeups.get(professional_id).map(|e| *e.value())
    }

    /// Entry point after any fact mutation for `professional_id`.
    pub async fn on_fact_changed(&self, professional_id: Ulid) -> Trigger {
        match self.options.mode {
            ReconcileMode::Inline => self.reconcile_now(professional_id).await,
            ReconcileMode::Queued => self.enqueue(professional_id),
        }
    }

    fn enqueue(&self, professional_id: Ulid) -> Trigger {
        if self.pending.insert(professional_id, ()).is_some() {
            return Trigger::AlreadyPending;
        }
        metrics::gauge!(observability::RECONCILE_PENDING).set(self.pending.len() as f64);
        // Never wait on the queue: a full or closed queue leaves the
        // professional stale for the sweeper to pick up.
        let err = match self.queue_tx.try_send(professional_id) {
            Ok(()) => return Trigger::Queued,
            Err(TrySendError::Full(_)) => EngineError::StoreUnavailable("reconcile queue full".into()),
            Err(TrySendError::Closed(_)) => EngineError::StoreUnavailable("reconcile worker shut down".into()),
        };
        self.pending.remove(&professional_id);
        self.mark_stale(professional_id, &err);
        Trigger::Stale(err)
    }

    /// Resolve now with retries; failures are absorbed into the stale set.
    async fn reconcile_now(&self, professional_id: Ulid) -> Trigger {
        match self.reconcile_with_retry(professional_id).await {
            Ok(done) => Trigger::Reconciled(done),
            Err(EngineError::ProfessionalNotFound(_)) => {
                debug!(professional = %professional_id, "dropping reconciliation for unknown professional");
                self.forget(&professional_id);
                metrics::counter!(observability::RECONCILIATIONS_TOTAL, "outcome" => "dropped").increment(1);
                Trigger::Dropped
            }
            Err(e) => {
                self.mark_stale(professional_id, &e);
                Trigger::Stale(e)
            }
        }
    }

    /// Retry retryable store failures with exponential backoff, re-reading
    /// the clock each attempt.
    pub async fn reconcile_with_retry(&self, professional_id: Ulid) -> Result<Reconciled, EngineError> {
        let mut delay = self.options.retry_backoff;
        let attempts = self.options.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.reconcile_at(professional_id, self.now()).await {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!(professional = %professional_id, attempt, error = %e, "retrying reconciliation");
                    metrics::counter!(observability::RECONCILE_RETRIES_TOTAL).increment(1);
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// One resolution pass at `as_of`. Appends a record only if the status
    /// differs from the latest one; identical consecutive states are not
    /// re-recorded.
    pub async fn reconcile_at(&self, professional_id: Ulid, as_of: Ms) -> Result<Reconciled, EngineError> {
        let lock = self
            .locks
            .entry(professional_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _serial = lock.lock().await;
        let started = Instant::now();
        let limit = self.options.store_timeout;
        let store = &*self.store;

        let resolution = resolve(store, professional_id, as_of, limit).await?;
        let boundary = timed(
            limit,
            "next_override_boundary",
            store.next_override_boundary(professional_id, as_of),
        )
        .await?;
        let latest = timed(limit, "latest_record", store.latest_record(professional_id)).await?;

        if let Some(at) = [resolution.next_change_at, boundary].into_iter().flatten().min() {
            self.wakeups.insert(professional_id, at);
        } else {
            self.wakeups.remove(&professional_id);
        }

        let record = match latest {
            Some(ref prev) if prev.status == resolution.status => None,
            _ => {
                let timestamp = latest.as_ref().map_or(as_of, |prev| prev.timestamp.max(as_of));
                let record = AvailabilityRecord {
                    professional_id,
                    status: resolution.status,
                    timestamp,
                    next_change_at: resolution.next_change_at,
                };
                timed(
                    limit,
                    "append_availability_record",
                    store.append_availability_record(record.clone()),
                )
                .await?;
                Some(record)
            }
        };

        if self.stale.remove(&professional_id).is_some() {
            metrics::gauge!(observability::STALE_PROFESSIONALS).set(self.stale.len() as f64);
            info!(professional = %professional_id, "availability caught up");
        }
        metrics::histogram!(observability::RECONCILE_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        match &record {
            Some(rec) => {
                metrics::counter!(observability::RECONCILIATIONS_TOTAL, "outcome" => "changed").increment(1);
                metrics::counter!(observability::STATUS_CHANGES_TOTAL, "status" => rec.status.as_str())
                    .increment(1);
                debug!(professional = %professional_id, status = %rec.status, "availability changed");
                self.notify(rec);
            }
            None => {
                metrics::counter!(observability::RECONCILIATIONS_TOTAL, "outcome" => "unchanged").increment(1);
            }
        }

        Ok(Reconciled { resolution, record })
    }

    fn notify(&self, record: &AvailabilityRecord) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        let change = StatusChange {
            professional_id: record.professional_id,
            status: record.status,
            timestamp: record.timestamp,
            next_change_at: record.next_change_at,
        };
        tokio::spawn(async move {
            notifier.availability_changed(change).await;
        });
    }

    fn mark_stale(&self, professional_id: Ulid, cause: &EngineError) {
        let now = self.now();
        self.stale.entry(professional_id).or_insert(now);
        metrics::counter!(observability::RECONCILIATIONS_TOTAL, "outcome" => "failed").increment(1);
        metrics::gauge!(observability::STALE_PROFESSIONALS).set(self.stale.len() as f64);
        warn!(
            professional = %professional_id,
            error = %cause,
            "{}",
            EngineError::ResolutionStale(professional_id)
        );
    }

    /// Drop all bookkeeping for a professional that no longer exists.
    pub fn forget(&self, professional_id: &Ulid) {
        self.locks.remove(professional_id);
        self.pending.remove(professional_id);
        self.wakeups.remove(professional_id);
        self.stale.remove(professional_id);
    }

    /// Professionals whose expected change instant has passed, plus every
    /// stale professional.
    pub fn collect_due(&self, now: Ms) -> Vec<Ulid> {
        let mut due: Vec<Ulid> = self
            .wakeups
            .iter()
            .filter(|e| *e.value() <= now)
            .map(|e| *e.key())
            .collect();
        due.extend(self.stale.iter().map(|e| *e.key()));
        due.sort();
        due.dedup();
        due
    }

    /// Trigger every due professional. Returns how many were triggered.
    pub async fn sweep(&self, now: Ms) -> usize {
        let due = self.collect_due(now);
        for &pid in &due {
            self.wakeups.remove(&pid);
            self.on_fact_changed(pid).await;
        }
        due.len()
    }

    /// Drain the queue. Each request is resolved on its own task, so different
    /// professionals proceed in parallel. Returns once the queue is closed or
    /// the worker was already started.
    pub async fn run_worker(self: Arc<Self>) {
        let Some(mut rx) = self.queue_rx.lock().await.take() else {
            error!("reconcile worker already running");
            return;
        };
        info!("reconcile worker started");
        while let Some(professional_id) = rx.recv().await {
            // Cleared before resolving: a change arriving mid-resolution queues
            // a fresh pass.
            self.pending.remove(&professional_id);
            metrics::gauge!(observability::RECONCILE_PENDING).set(self.pending.len() as f64);
            let this = self.clone();
            tokio::spawn(async move {
                this.reconcile_now(professional_id).await;
            });
        }
        info!("reconcile worker stopped");
    }
}
