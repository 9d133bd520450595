use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// As-of read access to a professional's facts, plus the single write the
/// resolution path is allowed to make.
///
/// Every read takes the instant it is evaluated at, so resolution is
/// deterministic for a given fact set.
#[async_trait]
pub trait FactStore: Send + Sync {
    async fn professional_exists(&self, professional_id: Ulid) -> Result<bool, EngineError>;

    /// Pending/confirmed bookings not over at `as_of` (in progress or upcoming).
    async fn list_active_bookings(
        &self,
        professional_id: Ulid,
        as_of: Ms,
    ) -> Result<Vec<Booking>, EngineError>;

    /// Calendar entries not over at `as_of`.
    async fn list_active_calendar_entries(
        &self,
        professional_id: Ulid,
        as_of: Ms,
    ) -> Result<Vec<CalendarEntry>, EngineError>;

    async fn latest_override(
        &self,
        professional_id: Ulid,
        as_of: Ms,
    ) -> Result<Option<ManualOverride>, EngineError>;

    /// Earliest instant after `as_of` at which override precedence changes.
    async fn next_override_boundary(
        &self,
        professional_id: Ulid,
        as_of: Ms,
    ) -> Result<Option<Ms>, EngineError>;

    async fn latest_record(
        &self,
        professional_id: Ulid,
    ) -> Result<Option<AvailabilityRecord>, EngineError>;

    /// Append-only. A record older than the current latest is rejected.
    async fn append_availability_record(&self, record: AvailabilityRecord) -> Result<(), EngineError>;
}

#[async_trait]
impl FactStore for Engine {
    async fn professional_exists(&self, professional_id: Ulid) -> Result<bool, EngineError> {
        Ok(self.state.contains_key(&professional_id))
    }

    async fn list_active_bookings(
        &self,
        professional_id: Ulid,
        as_of: Ms,
    ) -> Result<Vec<Booking>, EngineError> {
        let ps = self.require_professional(professional_id)?;
        let guard = ps.read().await;
        Ok(guard.live_bookings(as_of).cloned().collect())
    }

    async fn list_active_calendar_entries(
        &self,
        professional_id: Ulid,
        as_of: Ms,
    ) -> Result<Vec<CalendarEntry>, EngineError> {
        let ps = self.require_professional(professional_id)?;
        let guard = ps.read().await;
        Ok(guard.live_calendar_entries(as_of).cloned().collect())
    }

    async fn latest_override(
        &self,
        professional_id: Ulid,
        as_of: Ms,
    ) -> Result<Option<ManualOverride>, EngineError> {
        let ps = self.require_professional(professional_id)?;
        let guard = ps.read().await;
        Ok(guard.override_at(as_of).cloned())
    }

    async fn next_override_boundary(
        &self,
        professional_id: Ulid,
        as_of: Ms,
    ) -> Result<Option<Ms>, EngineError> {
        let ps = self.require_professional(professional_id)?;
        let guard = ps.read().await;
        Ok(guard.next_override_boundary(as_of))
    }

    async fn latest_record(
        &self,
        professional_id: Ulid,
    ) -> Result<Option<AvailabilityRecord>, EngineError> {
        let ps = self.require_professional(professional_id)?;
        let guard = ps.read().await;
        Ok(guard.latest_record().cloned())
    }

    async fn append_availability_record(&self, record: AvailabilityRecord) -> Result<(), EngineError> {
        let professional_id = record.professional_id;
        let mut guard = self.lock_professional(professional_id).await?;
        if guard
            .latest_record()
            .is_some_and(|latest| record.timestamp < latest.timestamp)
        {
            return Err(EngineError::ResolutionStale(professional_id));
        }
        let event = Event::AvailabilityRecorded { record };
        self.persist_and_apply(&mut guard, &event).await
    }
}
