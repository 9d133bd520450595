use std::future::Future;
use std::time::Duration;

use ulid::Ulid;

use crate::model::*;

use super::{EngineError, FactStore};

// ── Resolution algorithm ────────────────────────────────────────

/// Decide a professional's status at `as_of` from an already-fetched fact set.
///
/// Precedence: any booking (pending/confirmed) or calendar block containing
/// `as_of` makes the professional BUSY until the soonest of those ends.
/// Otherwise the in-effect manual override decides, defaulting to AVAILABLE,
/// and `next_change_at` is the soonest upcoming booking/calendar start.
pub fn resolve_facts(
    bookings: &[Booking],
    entries: &[CalendarEntry],
    manual: Option<&ManualOverride>,
    as_of: Ms,
) -> ResolvedAvailability {
    let booking_windows = bookings
        .iter()
        .filter(|b| b.status.is_active())
        .map(|b| b.window);
    let windows: Vec<Span> = booking_windows
        .chain(entries.iter().map(|e| e.window))
        .collect();

    let busy_until = windows
        .iter()
        .filter(|w| w.contains_instant(as_of))
        .map(|w| w.end)
        .min();
    if let Some(end) = busy_until {
        return ResolvedAvailability {
            status: AvailabilityStatus::Busy,
            next_change_at: Some(end),
        };
    }

    let status = manual
        .filter(|o| o.in_effect_at(as_of))
        .map_or(AvailabilityStatus::Available, |o| o.status);
    let next_change_at = windows
        .iter()
        .map(|w| w.start)
        .filter(|&start| start > as_of)
        .min();
    ResolvedAvailability {
        status,
        next_change_at,
    }
}

/// Bound a store call; an elapsed timeout becomes `StoreUnavailable`.
pub(crate) async fn timed<T>(
    limit: Duration,
    call: &'static str,
    fut: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, EngineError> {
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        EngineError::StoreUnavailable(format!("{call} exceeded {}ms", limit.as_millis()))
    })?
}

/// Read a professional's facts through `store` and resolve them at `as_of`.
/// Each store call is bounded by `limit`.
pub async fn resolve<S: FactStore + ?Sized>(
    store: &S,
    professional_id: Ulid,
    as_of: Ms,
    limit: Duration,
) -> Result<ResolvedAvailability, EngineError> {
    if !timed(limit, "professional_exists", store.professional_exists(professional_id)).await? {
        return Err(EngineError::ProfessionalNotFound(professional_id));
    }
    let (bookings, entries, manual) = tokio::try_join!(
        timed(
            limit,
            "list_active_bookings",
            store.list_active_bookings(professional_id, as_of)
        ),
        timed(
            limit,
            "list_active_calendar_entries",
            store.list_active_calendar_entries(professional_id, as_of)
        ),
        timed(
            limit,
            "latest_override",
            store.latest_override(professional_id, as_of)
        ),
    )?;
    Ok(resolve_facts(&bookings, &entries, manual.as_ref(), as_of))
}
