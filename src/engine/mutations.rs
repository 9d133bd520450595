use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{RwLock, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_window};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn register_professional(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        if self.state.len() >= MAX_PROFESSIONALS {
            return Err(EngineError::LimitExceeded("too many professionals"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("professional name too long"));
        }
        let _membership = self.membership.read().await;
        // Reserve the slot before the WAL append so a concurrent registration
        // of the same id is rejected. The state stays write-locked until the
        // event is durable.
        let shared = Arc::new(RwLock::new(ProfessionalState::new(id, name.clone())));
        let mut guard = shared.clone().write_owned().await;
        match self.state.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(shared);
            }
        }

        let event = Event::ProfessionalRegistered { id, name };
        if let Err(e) = self.wal_append(&event).await {
            guard.removed = true;
            self.state.remove(&id);
            return Err(e);
        }
        drop(guard);
        metrics::gauge!(crate::observability::PROFESSIONALS_ACTIVE).set(self.state.len() as f64);
        info!(professional = %id, "professional registered");
        Ok(())
    }

    /// Remove a professional and its history. Refused while it still has
    /// pending or confirmed bookings.
    pub async fn remove_professional(&self, id: Ulid) -> Result<(), EngineError> {
        let _membership = self.membership.read().await;
        let mut guard = self.lock_professional(id).await?;
        if guard.has_active_bookings() {
            return Err(EngineError::HasActiveBookings(id));
        }

        let event = Event::ProfessionalRemoved { id };
        self.wal_append(&event).await?;
        for b in &guard.bookings {
            self.entity_to_professional.remove(&b.id);
        }
        for e in &guard.calendar {
            self.entity_to_professional.remove(&e.id);
        }
        guard.removed = true;
        self.state.remove(&id);
        metrics::gauge!(crate::observability::PROFESSIONALS_ACTIVE).set(self.state.len() as f64);
        info!(professional = %id, "professional removed");
        Ok(())
    }

    /// Record a new PENDING booking. The conflict check and the write happen
    /// under the same professional write lock.
    pub async fn create_booking(
        &self,
        id: Ulid,
        professional_id: Ulid,
        user_id: Ulid,
        window: Span,
    ) -> Result<Booking, EngineError> {
        validate_window(&window)?;
        let mut guard = self.lock_professional(professional_id).await?;
        if guard.fact_count() >= MAX_FACTS_PER_PROFESSIONAL {
            return Err(EngineError::LimitExceeded("too many facts for professional"));
        }
        if self.entity_to_professional.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        check_no_conflict(&guard, &window, self.policy, None)?;

        let event = Event::BookingCreated {
            id,
            professional_id,
            user_id,
            window,
            status: BookingStatus::Pending,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(Booking {
            id,
            professional_id,
            user_id,
            window,
            status: BookingStatus::Pending,
        })
    }

    /// PENDING → CONFIRMED. Re-checks conflicts against the other confirmed
    /// bookings so two overlapping confirmations cannot both succeed.
    pub async fn confirm_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::Confirmed).await
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::Cancelled).await
    }

    pub async fn complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::Completed).await
    }

    async fn transition_booking(&self, id: Ulid, to: BookingStatus) -> Result<Booking, EngineError> {
        let (professional_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        if !current.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.status,
                to,
            });
        }
        if to == BookingStatus::Confirmed {
            check_no_conflict(&guard, &current.window, self.policy, Some(id))?;
        }

        let event = Event::BookingStatusChanged {
            id,
            professional_id,
            status: to,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(Booking { status: to, ..current })
    }

    /// Move a pending or confirmed booking to a new window.
    pub async fn reschedule_booking(&self, id: Ulid, window: Span) -> Result<Booking, EngineError> {
        validate_window(&window)?;
        let (professional_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        if current.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.status,
                to: current.status,
            });
        }

        check_no_conflict(&guard, &window, self.policy, Some(id))?;

        let event = Event::BookingRescheduled {
            id,
            professional_id,
            window,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(Booking { window, ..current })
    }

    /// Create or move a calendar block. An id already owned by another
    /// professional is rejected.
    pub async fn upsert_calendar_entry(
        &self,
        id: Ulid,
        professional_id: Ulid,
        window: Span,
        source: CalendarSource,
        external_event_id: Option<String>,
    ) -> Result<CalendarEntry, EngineError> {
        validate_window(&window)?;
        if let Some(ref ext) = external_event_id
            && ext.len() > MAX_EXTERNAL_ID_LEN
        {
            return Err(EngineError::LimitExceeded("external event id too long"));
        }
        if self
            .professional_for_entity(&id)
            .is_some_and(|owner| owner != professional_id)
        {
            return Err(EngineError::AlreadyExists(id));
        }
        let mut guard = self.lock_professional(professional_id).await?;
        let is_new = !guard.calendar.iter().any(|e| e.id == id);
        if is_new && guard.fact_count() >= MAX_FACTS_PER_PROFESSIONAL {
            return Err(EngineError::LimitExceeded("too many facts for professional"));
        }

        let event = Event::CalendarEntryUpserted {
            id,
            professional_id,
            window,
            source,
            external_event_id: external_event_id.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(CalendarEntry {
            id,
            professional_id,
            window,
            source,
            external_event_id,
        })
    }

    pub async fn remove_calendar_entry(&self, id: Ulid) -> Result<CalendarEntry, EngineError> {
        let (professional_id, mut guard) = self.resolve_entity_write(&id).await?;
        let entry = guard
            .calendar
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let event = Event::CalendarEntryRemoved { id, professional_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(entry)
    }

    /// Assert a manual status from `effective_from` until `effective_until`
    /// (open-ended when unset).
    pub async fn set_override(
        &self,
        professional_id: Ulid,
        status: AvailabilityStatus,
        effective_from: Ms,
        effective_until: Option<Ms>,
    ) -> Result<ManualOverride, EngineError> {
        if let Some(until) = effective_until
            && until <= effective_from
        {
            return Err(EngineError::InvalidWindow {
                start: effective_from,
                end: until,
            });
        }
        let mut guard = self.lock_professional(professional_id).await?;
        if guard.fact_count() >= MAX_FACTS_PER_PROFESSIONAL {
            return Err(EngineError::LimitExceeded("too many facts for professional"));
        }

        let event = Event::OverrideSet {
            professional_id,
            status,
            effective_from,
            effective_until,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(ManualOverride {
            professional_id,
            status,
            effective_from,
            effective_until,
        })
    }

    /// Rewrite the WAL as a snapshot of current state.
    ///
    /// Terminal bookings, calendar blocks and overrides that ended before
    /// `horizon` are left out; availability history is always kept. Every
    /// professional's read lock is held until the snapshot is swapped in, so
    /// no acknowledged write can land in the old log only.
    pub async fn compact_wal(&self, horizon: Ms) -> Result<usize, EngineError> {
        let _membership = self.membership.write().await;
        let mut ids = self.professional_ids();
        ids.sort();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(ps) = self.get_professional(&id) {
                guards.push(ps.read_owned().await);
            }
        }

        let mut events = Vec::new();
        for guard in &guards {
            let pid = guard.id;
            events.push(Event::ProfessionalRegistered {
                id: pid,
                name: guard.name.clone(),
            });
            for b in &guard.bookings {
                if b.status.is_terminal() && b.window.end < horizon {
                    continue;
                }
                events.push(Event::BookingCreated {
                    id: b.id,
                    professional_id: pid,
                    user_id: b.user_id,
                    window: b.window,
                    status: b.status,
                });
            }
            for e in guard.calendar.iter().filter(|e| e.window.end >= horizon) {
                events.push(Event::CalendarEntryUpserted {
                    id: e.id,
                    professional_id: pid,
                    window: e.window,
                    source: e.source,
                    external_event_id: e.external_event_id.clone(),
                });
            }
            for o in &guard.overrides {
                if o.effective_until.is_some_and(|until| until < horizon) {
                    continue;
                }
                events.push(Event::OverrideSet {
                    professional_id: pid,
                    status: o.status,
                    effective_from: o.effective_from,
                    effective_until: o.effective_until,
                });
            }
            events.extend(
                guard
                    .records
                    .iter()
                    .map(|r| Event::AvailabilityRecorded { record: r.clone() }),
            );
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
