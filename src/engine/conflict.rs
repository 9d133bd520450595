use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

/// How a candidate booking window is compared with confirmed bookings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Any half-open overlap conflicts.
    #[default]
    Overlap,
    /// Only a confirmed booking that fully contains the candidate conflicts.
    /// Misses partial overlaps; kept for deployments that relied on it.
    Containment,
}

impl ConflictPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "overlap" => Some(ConflictPolicy::Overlap),
            "containment" => Some(ConflictPolicy::Containment),
            _ => None,
        }
    }

    fn collides(&self, existing: &Span, candidate: &Span) -> bool {
        match self {
            ConflictPolicy::Overlap => existing.overlaps(candidate),
            ConflictPolicy::Containment => existing.contains_span(candidate),
        }
    }
}

/// Reject malformed or out-of-range windows at the input boundary.
pub fn validate_window(window: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if window.start >= window.end {
        return Err(EngineError::InvalidWindow {
            start: window.start,
            end: window.end,
        });
    }
    if window.start < MIN_VALID_TIMESTAMP_MS || window.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if window.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("window too wide"));
    }
    Ok(())
}

/// First confirmed booking (other than `exclude`) that collides with
/// `candidate` under `policy`.
pub fn find_conflict(
    ps: &ProfessionalState,
    candidate: &Span,
    policy: ConflictPolicy,
    exclude: Option<Ulid>,
) -> Option<Ulid> {
    ps.overlapping_bookings(candidate)
        .filter(|b| b.status == BookingStatus::Confirmed && Some(b.id) != exclude)
        .find(|b| policy.collides(&b.window, candidate))
        .map(|b| b.id)
}

pub(crate) fn check_no_conflict(
    ps: &ProfessionalState,
    candidate: &Span,
    policy: ConflictPolicy,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(ps, candidate, policy, exclude) {
        Some(id) => {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            Err(EngineError::SlotUnavailable(id))
        }
        None => Ok(()),
    }
}
