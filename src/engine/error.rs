use ulid::Ulid;

use crate::model::{BookingStatus, Ms};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Window with `start >= end`. Rejected before anything is written.
    InvalidWindow { start: Ms, end: Ms },
    /// Candidate window collides with this confirmed booking.
    SlotUnavailable(Ulid),
    ProfessionalNotFound(Ulid),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    HasActiveBookings(Ulid),
    LimitExceeded(&'static str),
    /// Store call failed or timed out. Retryable.
    StoreUnavailable(String),
    /// Facts were written but the derived availability could not be brought
    /// up to date.
    ResolutionStale(Ulid),
    /// The external calendar provider failed or timed out.
    ExternalCalendar(String),
    WalError(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::StoreUnavailable(_) | EngineError::ExternalCalendar(_) | EngineError::WalError(_)
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidWindow { start, end } => {
                write!(f, "invalid window [{start}, {end}): start must be before end")
            }
            EngineError::SlotUnavailable(id) => {
                write!(f, "slot unavailable: conflicts with booking {id}")
            }
            EngineError::ProfessionalNotFound(id) => write!(f, "professional not found: {id}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "booking {id} cannot move from {from} to {to}")
            }
            EngineError::HasActiveBookings(id) => {
                write!(f, "cannot remove professional {id}: has active bookings")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
            EngineError::ResolutionStale(id) => {
                write!(f, "availability of {id} is stale: reconciliation failed")
            }
            EngineError::ExternalCalendar(e) => write!(f, "external calendar error: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
