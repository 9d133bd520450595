use std::io;
use std::sync::Arc;

use tracing::{debug, info};
use ulid::Ulid;

use crate::config::Config;
use crate::engine::{Engine, EngineError, FactStore, resolve};
use crate::model::*;
use crate::notify::Notifier;
use crate::reconciler::{ReconcileMode, Reconciler, Trigger};
use crate::sweeper;

/// Collaborator-facing entry point: fact mutations that keep derived
/// availability current, plus read-only resolution and queries.
///
/// A mutation's result is decided by the fact write alone. Reconciliation
/// runs afterwards and its failures only leave the professional stale.
pub struct AvailabilityService {
    engine: Arc<Engine>,
    reconciler: Arc<Reconciler<Engine>>,
}

impl AvailabilityService {
    pub fn new(engine: Arc<Engine>, reconciler: Arc<Reconciler<Engine>>) -> Self {
        Self { engine, reconciler }
    }

    /// Open the fact log under `config.data_dir` and wire a reconciler to it.
    /// Background tasks are not started; see [`AvailabilityService::start`].
    pub fn open(config: &Config, notifier: Option<Arc<dyn Notifier>>) -> io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let engine = Arc::new(Engine::new(config.wal_path(), config.conflict_policy)?);
        let mut reconciler = Reconciler::new(engine.clone(), config.reconcile.clone());
        if let Some(notifier) = notifier {
            reconciler = reconciler.with_notifier(notifier);
        }
        Ok(Self::new(engine, Arc::new(reconciler)))
    }

    /// Spawn the reconcile worker (queued mode), the sweeper and the WAL
    /// compactor, then bring every professional up to date.
    pub async fn start(&self, config: &Config) -> usize {
        if self.reconciler.mode() == ReconcileMode::Queued {
            tokio::spawn(self.reconciler.clone().run_worker());
        }
        tokio::spawn(sweeper::run_sweeper(self.reconciler.clone(), config.sweep_interval));
        tokio::spawn(sweeper::run_compactor(
            self.engine.clone(),
            config.compact_threshold,
            config.retention_ms,
            config.sweep_interval,
        ));
        self.reconcile_all().await
    }

    /// Trigger every registered professional once. Used after replay, when
    /// time has moved on since the last record was written.
    pub async fn reconcile_all(&self) -> usize {
        let ids = self.engine.professional_ids();
        for &pid in &ids {
            self.reconciler.on_fact_changed(pid).await;
        }
        info!(professionals = ids.len(), "startup reconciliation triggered");
        ids.len()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn reconciler(&self) -> &Arc<Reconciler<Engine>> {
        &self.reconciler
    }

    // ── Resolution ──────────────────────────────────────────────

    /// Compute availability at `as_of` (default: now). Pure read; nothing is
    /// persisted.
    pub async fn resolve_availability(
        &self,
        professional_id: Ulid,
        as_of: Option<Ms>,
    ) -> Result<ResolvedAvailability, EngineError> {
        let as_of = as_of.unwrap_or_else(|| self.reconciler.now());
        resolve(
            &*self.engine,
            professional_id,
            as_of,
            self.reconciler.options().store_timeout,
        )
        .await
    }

    pub async fn check_booking_conflict(&self, professional_id: Ulid, window: Span) -> Result<(), EngineError> {
        self.engine.check_booking_conflict(professional_id, window).await
    }

    pub async fn on_fact_changed(&self, professional_id: Ulid) -> Trigger {
        self.reconciler.on_fact_changed(professional_id).await
    }

    async fn after_change(&self, professional_id: Ulid) {
        let trigger = self.reconciler.on_fact_changed(professional_id).await;
        debug!(professional = %professional_id, ?trigger, "fact change reconciled");
    }

    // ── Mutations ───────────────────────────────────────────────

    pub async fn register_professional(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        self.engine.register_professional(id, name).await?;
        self.after_change(id).await;
        Ok(())
    }

    pub async fn remove_professional(&self, id: Ulid) -> Result<(), EngineError> {
        self.engine.remove_professional(id).await?;
        self.reconciler.forget(&id);
        Ok(())
    }

    pub async fn create_booking(
        &self,
        id: Ulid,
        professional_id: Ulid,
        user_id: Ulid,
        window: Span,
    ) -> Result<Booking, EngineError> {
        let booking = self
            .engine
            .create_booking(id, professional_id, user_id, window)
            .await?;
        self.after_change(professional_id).await;
        Ok(booking)
    }

    pub async fn confirm_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.engine.confirm_booking(id).await?;
        self.after_change(booking.professional_id).await;
        Ok(booking)
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.engine.cancel_booking(id).await?;
        self.after_change(booking.professional_id).await;
        Ok(booking)
    }

    pub async fn complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.engine.complete_booking(id).await?;
        self.after_change(booking.professional_id).await;
        Ok(booking)
    }

    pub async fn reschedule_booking(&self, id: Ulid, window: Span) -> Result<Booking, EngineError> {
        let booking = self.engine.reschedule_booking(id, window).await?;
        self.after_change(booking.professional_id).await;
        Ok(booking)
    }

    pub async fn upsert_calendar_entry(
        &self,
        id: Ulid,
        professional_id: Ulid,
        window: Span,
        source: CalendarSource,
        external_event_id: Option<String>,
    ) -> Result<CalendarEntry, EngineError> {
        let entry = self
            .engine
            .upsert_calendar_entry(id, professional_id, window, source, external_event_id)
            .await?;
        self.after_change(professional_id).await;
        Ok(entry)
    }

    pub async fn remove_calendar_entry(&self, id: Ulid) -> Result<CalendarEntry, EngineError> {
        let entry = self.engine.remove_calendar_entry(id).await?;
        self.after_change(entry.professional_id).await;
        Ok(entry)
    }

    pub async fn set_override(
        &self,
        professional_id: Ulid,
        status: AvailabilityStatus,
        effective_from: Ms,
        effective_until: Option<Ms>,
    ) -> Result<ManualOverride, EngineError> {
        let o = self
            .engine
            .set_override(professional_id, status, effective_from, effective_until)
            .await?;
        self.after_change(professional_id).await;
        Ok(o)
    }

    // ── Queries ─────────────────────────────────────────────────

    pub async fn availability_history(&self, professional_id: Ulid) -> Result<Vec<AvailabilityRecord>, EngineError> {
        self.engine.availability_history(professional_id).await
    }

    /// Last persisted status, which may lag `resolve_availability` while a
    /// reconciliation is queued or the professional is stale.
    pub async fn latest_availability(
        &self,
        professional_id: Ulid,
    ) -> Result<Option<AvailabilityRecord>, EngineError> {
        if !self.engine.professional_exists(professional_id).await? {
            return Err(EngineError::ProfessionalNotFound(professional_id));
        }
        self.engine.latest_record(professional_id).await
    }

    pub async fn bookings(&self, professional_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        self.engine.bookings(professional_id).await
    }

    pub async fn calendar_entries(&self, professional_id: Ulid) -> Result<Vec<CalendarEntry>, EngineError> {
        self.engine.calendar_entries(professional_id).await
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.engine.get_booking(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ConflictPolicy;
    use crate::reconciler::{Clock, ReconcileOptions};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;
    /// 2026-01-01T00:00:00Z
    const DAY: Ms = 1_767_225_600_000;

    fn at(hour: Ms, minute: Ms) -> Ms {
        DAY + hour * H + minute * M
    }

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("onduty_test_service");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    struct Harness {
        svc: AvailabilityService,
        now: Arc<AtomicI64>,
        pid: Ulid,
    }

    impl Harness {
        fn set_now(&self, t: Ms) {
            self.now.store(t, Ordering::SeqCst);
        }

        async fn statuses(&self) -> Vec<AvailabilityStatus> {
            self.svc
                .availability_history(self.pid)
                .await
                .unwrap()
                .into_iter()
                .map(|r| r.status)
                .collect()
        }
    }

    async fn harness(name: &str, policy: ConflictPolicy) -> Harness {
        let engine = Arc::new(Engine::new(test_wal_path(name), policy).unwrap());
        let now = Arc::new(AtomicI64::new(at(9, 0)));
        let clock_now = now.clone();
        let clock: Clock = Arc::new(move || clock_now.load(Ordering::SeqCst));
        let options = ReconcileOptions {
            mode: ReconcileMode::Inline,
            store_timeout: Duration::from_millis(500),
            max_attempts: 2,
            retry_backoff: Duration::from_millis(1),
        };
        let reconciler = Arc::new(Reconciler::new(engine.clone(), options).with_clock(clock));
        let svc = AvailabilityService::new(engine, reconciler);
        let pid = Ulid::new();
        svc.register_professional(pid, Some("Dr. Ada".into())).await.unwrap();
        Harness { svc, now, pid }
    }

    async fn confirmed(h: &Harness, window: Span) -> Booking {
        let b = h
            .svc
            .create_booking(Ulid::new(), h.pid, Ulid::new(), window)
            .await
            .unwrap();
        h.svc.confirm_booking(b.id).await.unwrap()
    }

    #[tokio::test]
    async fn new_professional_is_available_with_no_next_change() {
        let h = harness("empty.wal", ConflictPolicy::Overlap).await;
        let r = h.svc.resolve_availability(h.pid, None).await.unwrap();
        assert_eq!(r.status, AvailabilityStatus::Available);
        assert_eq!(r.next_change_at, None);
        assert_eq!(h.statuses().await, vec![AvailabilityStatus::Available]);
    }

    #[tokio::test]
    async fn busy_during_confirmed_booking_until_its_end() {
        let h = harness("busy.wal", ConflictPolicy::Overlap).await;
        confirmed(&h, Span::new(at(10, 0), at(11, 0))).await;

        let r = h.svc.resolve_availability(h.pid, Some(at(10, 30))).await.unwrap();
        assert_eq!(r.status, AvailabilityStatus::Busy);
        assert_eq!(r.next_change_at, Some(at(11, 0)));

        let before = h.svc.resolve_availability(h.pid, Some(at(9, 0))).await.unwrap();
        assert_eq!(before.status, AvailabilityStatus::Available);
        assert_eq!(before.next_change_at, Some(at(10, 0)));
    }

    #[tokio::test]
    async fn unknown_professional_is_reported() {
        let h = harness("unknown.wal", ConflictPolicy::Overlap).await;
        let ghost = Ulid::new();
        assert_eq!(
            h.svc.resolve_availability(ghost, None).await,
            Err(EngineError::ProfessionalNotFound(ghost))
        );
        assert_eq!(
            h.svc.latest_availability(ghost).await,
            Err(EngineError::ProfessionalNotFound(ghost))
        );
    }

    #[tokio::test]
    async fn contained_booking_conflicts_adjacent_does_not() {
        let h = harness("containment.wal", ConflictPolicy::Containment).await;
        let existing = confirmed(&h, Span::new(at(10, 0), at(11, 0))).await;

        let inside = Span::new(at(10, 15), at(10, 45));
        assert_eq!(
            h.svc.check_booking_conflict(h.pid, inside).await,
            Err(EngineError::SlotUnavailable(existing.id))
        );
        assert_eq!(
            h.svc.create_booking(Ulid::new(), h.pid, Ulid::new(), inside).await,
            Err(EngineError::SlotUnavailable(existing.id))
        );

        let adjacent = Span::new(at(11, 0), at(12, 0));
        assert_ok!(h.svc.check_booking_conflict(h.pid, adjacent).await);
        assert_ok!(h.svc.create_booking(Ulid::new(), h.pid, Ulid::new(), adjacent).await);
    }

    #[tokio::test]
    async fn partial_overlap_conflicts_under_default_policy() {
        let h = harness("partial.wal", ConflictPolicy::Overlap).await;
        let existing = confirmed(&h, Span::new(at(10, 0), at(11, 0))).await;
        assert_eq!(
            h.svc
                .check_booking_conflict(h.pid, Span::new(at(10, 30), at(11, 30)))
                .await,
            Err(EngineError::SlotUnavailable(existing.id))
        );
    }

    #[tokio::test]
    async fn cancelling_sole_booking_restores_available() {
        let h = harness("cancel.wal", ConflictPolicy::Overlap).await;
        h.set_now(at(10, 30));
        let b = confirmed(&h, Span::new(at(10, 0), at(11, 0))).await;
        assert_eq!(
            h.svc.latest_availability(h.pid).await.unwrap().unwrap().status,
            AvailabilityStatus::Busy
        );

        h.svc.cancel_booking(b.id).await.unwrap();
        let latest = h.svc.latest_availability(h.pid).await.unwrap().unwrap();
        assert_eq!(latest.status, AvailabilityStatus::Available);
        assert_eq!(
            h.statuses().await,
            vec![
                AvailabilityStatus::Available,
                AvailabilityStatus::Busy,
                AvailabilityStatus::Available
            ]
        );
    }

    #[tokio::test]
    async fn cancelling_sole_booking_falls_back_to_override() {
        let h = harness("cancel_override.wal", ConflictPolicy::Overlap).await;
        h.set_now(at(10, 30));
        h.svc
            .set_override(h.pid, AvailabilityStatus::Offline, at(8, 0), None)
            .await
            .unwrap();
        let b = confirmed(&h, Span::new(at(10, 0), at(11, 0))).await;
        assert_eq!(
            h.svc.latest_availability(h.pid).await.unwrap().unwrap().status,
            AvailabilityStatus::Busy
        );

        h.svc.cancel_booking(b.id).await.unwrap();
        assert_eq!(
            h.svc.latest_availability(h.pid).await.unwrap().unwrap().status,
            AvailabilityStatus::Offline
        );
    }

    #[tokio::test]
    async fn repeated_trigger_appends_at_most_one_record() {
        let h = harness("double.wal", ConflictPolicy::Overlap).await;
        let before = h.svc.availability_history(h.pid).await.unwrap().len();
        h.svc.on_fact_changed(h.pid).await;
        h.svc.on_fact_changed(h.pid).await;
        assert_eq!(h.svc.availability_history(h.pid).await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn create_then_cancel_round_trips() {
        let h = harness("round_trip.wal", ConflictPolicy::Overlap).await;
        h.set_now(at(10, 30));
        let window = Span::new(at(10, 0), at(11, 0));
        let before = h.svc.resolve_availability(h.pid, None).await.unwrap();

        let b = confirmed(&h, window).await;
        h.svc.cancel_booking(b.id).await.unwrap();

        assert_eq!(h.svc.resolve_availability(h.pid, None).await.unwrap(), before);
        // The freed slot can be booked again.
        assert_ok!(h.svc.check_booking_conflict(h.pid, window).await);
        assert_eq!(h.svc.get_booking(b.id).await.unwrap().status, BookingStatus::Cancelled);
    }

    #[tokio::test]
    async fn calendar_block_makes_professional_busy() {
        let h = harness("calendar.wal", ConflictPolicy::Overlap).await;
        h.set_now(at(14, 0));
        let entry = h
            .svc
            .upsert_calendar_entry(
                Ulid::new(),
                h.pid,
                Span::new(at(13, 0), at(15, 0)),
                CalendarSource::Manual,
                None,
            )
            .await
            .unwrap();
        let latest = h.svc.latest_availability(h.pid).await.unwrap().unwrap();
        assert_eq!(latest.status, AvailabilityStatus::Busy);
        assert_eq!(latest.next_change_at, Some(at(15, 0)));

        h.svc.remove_calendar_entry(entry.id).await.unwrap();
        assert!(h.svc.calendar_entries(h.pid).await.unwrap().is_empty());
        assert_eq!(
            h.svc.latest_availability(h.pid).await.unwrap().unwrap().status,
            AvailabilityStatus::Available
        );
    }

    #[tokio::test]
    async fn reschedule_out_of_now_frees_professional() {
        let h = harness("reschedule.wal", ConflictPolicy::Overlap).await;
        h.set_now(at(10, 30));
        let b = confirmed(&h, Span::new(at(10, 0), at(11, 0))).await;
        let moved = h
            .svc
            .reschedule_booking(b.id, Span::new(at(16, 0), at(17, 0)))
            .await
            .unwrap();
        assert_eq!(moved.status, BookingStatus::Confirmed);
        let latest = h.svc.latest_availability(h.pid).await.unwrap().unwrap();
        assert_eq!(latest.status, AvailabilityStatus::Available);
        assert_eq!(latest.next_change_at, Some(at(16, 0)));
    }

    #[tokio::test]
    async fn invalid_window_fails_before_any_write() {
        let h = harness("invalid.wal", ConflictPolicy::Overlap).await;
        let backwards = Span {
            start: at(11, 0),
            end: at(10, 0),
        };
        assert_eq!(
            h.svc.create_booking(Ulid::new(), h.pid, Ulid::new(), backwards).await,
            Err(EngineError::InvalidWindow {
                start: at(11, 0),
                end: at(10, 0)
            })
        );
        assert!(h.svc.bookings(h.pid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn removed_professional_is_forgotten() {
        let h = harness("remove.wal", ConflictPolicy::Overlap).await;
        let b = confirmed(&h, Span::new(at(10, 0), at(11, 0))).await;
        assert_eq!(
            h.svc.remove_professional(h.pid).await,
            Err(EngineError::HasActiveBookings(h.pid))
        );

        h.svc.complete_booking(b.id).await.unwrap();
        assert_ok!(h.svc.remove_professional(h.pid).await);
        assert_err!(h.svc.bookings(h.pid).await);
        assert_eq!(h.svc.reconciler().wakeup_for(&h.pid), None);
        assert_eq!(h.svc.on_fact_changed(h.pid).await, Trigger::Dropped);
    }

    #[tokio::test]
    async fn reconcile_all_covers_every_professional() {
        let h = harness("reconcile_all.wal", ConflictPolicy::Overlap).await;
        let other = Ulid::new();
        h.svc.engine().register_professional(other, None).await.unwrap();
        assert!(h.svc.availability_history(other).await.unwrap().is_empty());

        assert_eq!(h.svc.reconcile_all().await, 2);
        assert_eq!(h.svc.availability_history(other).await.unwrap().len(), 1);
        assert_eq!(h.svc.availability_history(h.pid).await.unwrap().len(), 1);
    }
}
