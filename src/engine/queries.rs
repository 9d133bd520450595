use ulid::Ulid;

use crate::model::*;

use super::conflict::{check_no_conflict, validate_window};
use super::{Engine, EngineError};

impl Engine {
    /// Advisory conflict check for a candidate booking window. Mutates nothing;
    /// `create_booking` repeats the check under the write lock.
    pub async fn check_booking_conflict(
        &self,
        professional_id: Ulid,
        window: Span,
    ) -> Result<(), EngineError> {
        validate_window(&window)?;
        let ps = self.require_professional(professional_id)?;
        let guard = ps.read().await;
        check_no_conflict(&guard, &window, self.policy, None)
    }

    pub async fn list_professionals(&self) -> Vec<ProfessionalInfo> {
        let shared: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for ps in shared {
            let guard = ps.read().await;
            out.push(ProfessionalInfo {
                id: guard.id,
                name: guard.name.clone(),
            });
        }
        out
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let professional_id = self
            .professional_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;
        let ps = self.require_professional(professional_id)?;
        let guard = ps.read().await;
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Every booking of a professional, any status, ordered by start.
    pub async fn bookings(&self, professional_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let ps = self.require_professional(professional_id)?;
        let guard = ps.read().await;
        Ok(guard.bookings.clone())
    }

    pub async fn calendar_entries(&self, professional_id: Ulid) -> Result<Vec<CalendarEntry>, EngineError> {
        let ps = self.require_professional(professional_id)?;
        let guard = ps.read().await;
        Ok(guard.calendar.clone())
    }

    pub async fn overrides(&self, professional_id: Ulid) -> Result<Vec<ManualOverride>, EngineError> {
        let ps = self.require_professional(professional_id)?;
        let guard = ps.read().await;
        Ok(guard.overrides.clone())
    }

    /// Availability records, oldest first.
    pub async fn availability_history(
        &self,
        professional_id: Ulid,
    ) -> Result<Vec<AvailabilityRecord>, EngineError> {
        let ps = self.require_professional(professional_id)?;
        let guard = ps.read().await;
        Ok(guard.records.clone())
    }
}
