mod conflict;
mod error;
mod mutations;
mod queries;
mod resolve;
mod store;

pub use conflict::{ConflictPolicy, find_conflict, now_ms, validate_window};
pub use error::EngineError;
pub use resolve::{resolve, resolve_facts};
pub(crate) use resolve::timed;
pub use store::FactStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedProfessionalState = Arc<RwLock<ProfessionalState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL. Appends that arrive while a flush is
/// pending are batched behind a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }

        // A compaction queued behind appends runs only after they are durable.
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes are not
    // attributed to the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

/// WAL-backed in-memory fact store. One `RwLock` per professional; no lock
/// spans two professionals.
pub struct Engine {
    pub state: DashMap<Ulid, SharedProfessionalState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub policy: ConflictPolicy,
    /// Reverse lookup: booking / calendar entry id → professional id.
    pub(super) entity_to_professional: DashMap<Ulid, Ulid>,
    /// Registration/removal take this shared; compaction takes it exclusive.
    pub(super) membership: RwLock<()>,
}

/// Apply an event to a professional's state (caller holds the write lock).
fn apply_to_professional(ps: &mut ProfessionalState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingCreated {
            id,
            professional_id,
            user_id,
            window,
            status,
        } => {
            ps.insert_booking(Booking {
                id: *id,
                professional_id: *professional_id,
                user_id: *user_id,
                window: *window,
                status: *status,
            });
            entity_map.insert(*id, *professional_id);
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(b) = ps.booking_mut(*id) {
                b.status = *status;
            }
        }
        Event::BookingRescheduled { id, window, .. } => {
            if let Some(mut b) = ps.remove_booking(*id) {
                b.window = *window;
                ps.insert_booking(b);
            }
        }
        Event::CalendarEntryUpserted {
            id,
            professional_id,
            window,
            source,
            external_event_id,
        } => {
            ps.upsert_calendar_entry(CalendarEntry {
                id: *id,
                professional_id: *professional_id,
                window: *window,
                source: *source,
                external_event_id: external_event_id.clone(),
            });
            entity_map.insert(*id, *professional_id);
        }
        Event::CalendarEntryRemoved { id, .. } => {
            ps.remove_calendar_entry(*id);
            entity_map.remove(id);
        }
        Event::OverrideSet {
            professional_id,
            status,
            effective_from,
            effective_until,
        } => ps.overrides.push(ManualOverride {
            professional_id: *professional_id,
            status: *status,
            effective_from: *effective_from,
            effective_until: *effective_until,
        }),
        Event::AvailabilityRecorded { record } => ps.records.push(record.clone()),
        // Registration/removal are handled at the DashMap level, not here
        Event::ProfessionalRegistered { .. } | Event::ProfessionalRemoved { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, policy: ConflictPolicy) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            policy,
            entity_to_professional: DashMap::new(),
            membership: RwLock::new(()),
        };

        // Sole owner of every Arc during replay, so try_write never contends.
        for event in &events {
            match event {
                Event::ProfessionalRegistered { id, name } => {
                    let ps = ProfessionalState::new(*id, name.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(ps)));
                }
                Event::ProfessionalRemoved { id } => engine.drop_professional(id),
                other => {
                    let Some(entry) = engine.state.get(&other.professional_id()) else {
                        continue;
                    };
                    let shared = entry.value().clone();
                    drop(entry);
                    if let Ok(mut guard) = shared.try_write() {
                        apply_to_professional(&mut guard, other, &engine.entity_to_professional);
                    }
                }
            }
        }
        debug!(
            events = events.len(),
            professionals = engine.state.len(),
            "replayed fact log"
        );

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_professional(&self, id: &Ulid) -> Option<SharedProfessionalState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn professional_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_professional.get(entity_id).map(|e| *e.value())
    }

    pub fn professional_ids(&self) -> Vec<Ulid> {
        self.state.iter().map(|e| *e.key()).collect()
    }

    /// WAL-append, then apply. The fact is durable before it is visible.
    pub(super) async fn persist_and_apply(
        &self,
        ps: &mut ProfessionalState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_professional(ps, event, &self.entity_to_professional);
        metrics::counter!(crate::observability::FACT_MUTATIONS_TOTAL, "kind" => event.kind())
            .increment(1);
        Ok(())
    }

    /// Lookup entity → professional, then take that professional's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ProfessionalState>), EngineError> {
        let professional_id = self
            .professional_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let guard = self.lock_professional(professional_id).await?;
        Ok((professional_id, guard))
    }

    pub(super) fn require_professional(&self, id: Ulid) -> Result<SharedProfessionalState, EngineError> {
        self.get_professional(&id)
            .ok_or(EngineError::ProfessionalNotFound(id))
    }

    /// Take a professional's write lock. Fails if the professional was
    /// removed while this caller waited for the lock.
    pub(super) async fn lock_professional(
        &self,
        id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<ProfessionalState>, EngineError> {
        let guard = self.require_professional(id)?.write_owned().await;
        if guard.removed {
            return Err(EngineError::ProfessionalNotFound(id));
        }
        Ok(guard)
    }

    fn drop_professional(&self, id: &Ulid) {
        if let Some((_, shared)) = self.state.remove(id)
            && let Ok(mut guard) = shared.try_write()
        {
            guard.removed = true;
            for b in &guard.bookings {
                self.entity_to_professional.remove(&b.id);
            }
            for e in &guard.calendar {
                self.entity_to_professional.remove(&e.id);
            }
        }
    }
}
