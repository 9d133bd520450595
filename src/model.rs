use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open time window `[start, end)`.
///
/// Construct through [`Span::new`] (debug-checked) or [`Span::try_new`] at
/// input boundaries where a malformed window must be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Returns `None` for degenerate or inverted windows.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Resolved availability of a professional. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AvailabilityStatus {
    Available,
    Busy,
    Offline,
}

impl AvailabilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AvailabilityStatus::Available => "available",
            AvailabilityStatus::Busy => "busy",
            AvailabilityStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for AvailabilityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// Pending and confirmed bookings occupy the professional.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::Completed)
    }

    /// Legal lifecycle moves. Terminal states never re-activate.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Pending, BookingStatus::Confirmed)
                | (BookingStatus::Pending, BookingStatus::Cancelled)
                | (BookingStatus::Confirmed, BookingStatus::Cancelled)
                | (BookingStatus::Confirmed, BookingStatus::Completed)
        )
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub professional_id: Ulid,
    pub user_id: Ulid,
    pub window: Span,
    pub status: BookingStatus,
}

/// Where a calendar block came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalendarSource {
    External,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEntry {
    pub id: Ulid,
    pub professional_id: Ulid,
    pub window: Span,
    pub source: CalendarSource,
    pub external_event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualOverride {
    pub professional_id: Ulid,
    pub status: AvailabilityStatus,
    pub effective_from: Ms,
    pub effective_until: Option<Ms>,
}

impl ManualOverride {
    pub fn in_effect_at(&self, t: Ms) -> bool {
        self.effective_from <= t && self.effective_until.is_none_or(|until| t < until)
    }
}

/// Derived, append-only snapshot of a professional's resolved state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRecord {
    pub professional_id: Ulid,
    pub status: AvailabilityStatus,
    pub timestamp: Ms,
    pub next_change_at: Option<Ms>,
}

/// Output of the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAvailability {
    pub status: AvailabilityStatus,
    pub next_change_at: Option<Ms>,
}

#[derive(Debug, Clone)]
pub struct ProfessionalState {
    pub id: Ulid,
    pub name: Option<String>,
    /// All bookings ever created, sorted by `window.start`.
    pub bookings: Vec<Booking>,
    /// Calendar blocks, sorted by `window.start`.
    pub calendar: Vec<CalendarEntry>,
    /// Overrides in insertion order.
    pub overrides: Vec<ManualOverride>,
    /// Availability history, oldest first.
    pub records: Vec<AvailabilityRecord>,
    /// Set once the professional is removed. Writers that were queued on the
    /// lock observe it and back off.
    pub removed: bool,
}

impl ProfessionalState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            bookings: Vec::new(),
            calendar: Vec::new(),
            overrides: Vec::new(),
            records: Vec::new(),
            removed: false,
        }
    }

    pub fn fact_count(&self) -> usize {
        self.bookings.len() + self.calendar.len() + self.overrides.len()
    }

    /// Insert booking maintaining sort order by window.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.window.start, |b| b.window.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Insert or replace a calendar entry by id, keeping sort order.
    pub fn upsert_calendar_entry(&mut self, entry: CalendarEntry) {
        self.remove_calendar_entry(entry.id);
        let pos = self
            .calendar
            .binary_search_by_key(&entry.window.start, |e| e.window.start)
            .unwrap_or_else(|e| e);
        self.calendar.insert(pos, entry);
    }

    pub fn remove_calendar_entry(&mut self, id: Ulid) -> Option<CalendarEntry> {
        let pos = self.calendar.iter().position(|e| e.id == id)?;
        Some(self.calendar.remove(pos))
    }

    pub fn has_active_bookings(&self) -> bool {
        self.bookings.iter().any(|b| b.status.is_active())
    }

    /// Active bookings whose window overlaps `query`.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping_bookings(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.window.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.status.is_active() && b.window.end > query.start)
    }

    /// Active bookings not yet over at `as_of` (in progress or upcoming).
    pub fn live_bookings(&self, as_of: Ms) -> impl Iterator<Item = &Booking> {
        self.bookings
            .iter()
            .filter(move |b| b.status.is_active() && b.window.end > as_of)
    }

    pub fn live_calendar_entries(&self, as_of: Ms) -> impl Iterator<Item = &CalendarEntry> {
        self.calendar.iter().filter(move |e| e.window.end > as_of)
    }

    /// The override in effect at `as_of`: greatest `effective_from`, later
    /// insertion wins ties.
    pub fn override_at(&self, as_of: Ms) -> Option<&ManualOverride> {
        self.overrides
            .iter()
            .filter(|o| o.in_effect_at(as_of))
            .max_by_key(|o| o.effective_from)
    }

    /// Earliest instant after `as_of` at which any override starts or stops.
    pub fn next_override_boundary(&self, as_of: Ms) -> Option<Ms> {
        self.overrides
            .iter()
            .flat_map(|o| [Some(o.effective_from), o.effective_until])
            .flatten()
            .filter(|&t| t > as_of)
            .min()
    }

    pub fn latest_record(&self) -> Option<&AvailabilityRecord> {
        self.records.last()
    }
}

/// Fact events, flat. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProfessionalRegistered {
        id: Ulid,
        name: Option<String>,
    },
    ProfessionalRemoved {
        id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        professional_id: Ulid,
        user_id: Ulid,
        window: Span,
        status: BookingStatus,
    },
    BookingStatusChanged {
        id: Ulid,
        professional_id: Ulid,
        status: BookingStatus,
    },
    BookingRescheduled {
        id: Ulid,
        professional_id: Ulid,
        window: Span,
    },
    CalendarEntryUpserted {
        id: Ulid,
        professional_id: Ulid,
        window: Span,
        source: CalendarSource,
        external_event_id: Option<String>,
    },
    CalendarEntryRemoved {
        id: Ulid,
        professional_id: Ulid,
    },
    OverrideSet {
        professional_id: Ulid,
        status: AvailabilityStatus,
        effective_from: Ms,
        effective_until: Option<Ms>,
    },
    AvailabilityRecorded {
        record: AvailabilityRecord,
    },
}

impl Event {
    /// The professional an event belongs to.
    pub fn professional_id(&self) -> Ulid {
        match self {
            Event::ProfessionalRegistered { id, .. } | Event::ProfessionalRemoved { id } => *id,
            Event::BookingCreated { professional_id, .. }
            | Event::BookingStatusChanged { professional_id, .. }
            | Event::BookingRescheduled { professional_id, .. }
            | Event::CalendarEntryUpserted { professional_id, .. }
            | Event::CalendarEntryRemoved { professional_id, .. }
            | Event::OverrideSet { professional_id, .. } => *professional_id,
            Event::AvailabilityRecorded { record } => record.professional_id,
        }
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ProfessionalRegistered { .. } => "professional_registered",
            Event::ProfessionalRemoved { .. } => "professional_removed",
            Event::BookingCreated { .. } => "booking_created",
            Event::BookingStatusChanged { .. } => "booking_status_changed",
            Event::BookingRescheduled { .. } => "booking_rescheduled",
            Event::CalendarEntryUpserted { .. } => "calendar_entry_upserted",
            Event::CalendarEntryRemoved { .. } => "calendar_entry_removed",
            Event::OverrideSet { .. } => "override_set",
            Event::AvailabilityRecorded { .. } => "availability_recorded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfessionalInfo {
    pub id: Ulid,
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            professional_id: Ulid::nil(),
            user_id: Ulid::new(),
            window: Span::new(start, end),
            status,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap_is_symmetric() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b) && b.overlaps(&a));
        assert!(!a.overlaps(&c) && !c.overlaps(&a)); // adjacent
        assert!(a.overlaps(&a));
    }

    #[test]
    fn span_try_new_rejects_degenerate() {
        assert!(Span::try_new(100, 100).is_none());
        assert!(Span::try_new(200, 100).is_none());
        assert_eq!(Span::try_new(100, 101), Some(Span::new(100, 101)));
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        let inner = Span::new(150, 300);
        let partial = Span::new(50, 200);
        assert!(outer.contains_span(&inner));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&partial));
    }

    #[test]
    fn booking_transitions() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Cancelled.can_transition_to(Confirmed));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Confirmed.can_transition_to(Pending));
    }

    #[test]
    fn bookings_kept_sorted() {
        let mut ps = ProfessionalState::new(Ulid::new(), None);
        ps.insert_booking(booking(300, 400, BookingStatus::Pending));
        ps.insert_booking(booking(100, 200, BookingStatus::Confirmed));
        ps.insert_booking(booking(200, 300, BookingStatus::Pending));
        let starts: Vec<Ms> = ps.bookings.iter().map(|b| b.window.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_inactive_and_adjacent() {
        let mut ps = ProfessionalState::new(Ulid::new(), None);
        ps.insert_booking(booking(100, 200, BookingStatus::Confirmed));
        ps.insert_booking(booking(150, 250, BookingStatus::Cancelled));
        ps.insert_booking(booking(400, 500, BookingStatus::Pending));
        let hits: Vec<_> = ps.overlapping_bookings(&Span::new(200, 450)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].window, Span::new(400, 500));
    }

    #[test]
    fn calendar_upsert_replaces() {
        let mut ps = ProfessionalState::new(Ulid::new(), None);
        let id = Ulid::new();
        let entry = CalendarEntry {
            id,
            professional_id: ps.id,
            window: Span::new(100, 200),
            source: CalendarSource::Manual,
            external_event_id: None,
        };
        ps.upsert_calendar_entry(entry.clone());
        ps.upsert_calendar_entry(CalendarEntry { window: Span::new(300, 400), ..entry });
        assert_eq!(ps.calendar.len(), 1);
        assert_eq!(ps.calendar[0].window, Span::new(300, 400));
    }

    #[test]
    fn override_precedence_latest_effective_from() {
        let mut ps = ProfessionalState::new(Ulid::new(), None);
        ps.overrides.push(ManualOverride {
            professional_id: ps.id,
            status: AvailabilityStatus::Offline,
            effective_from: 100,
            effective_until: None,
        });
        ps.overrides.push(ManualOverride {
            professional_id: ps.id,
            status: AvailabilityStatus::Available,
            effective_from: 200,
            effective_until: Some(300),
        });
        assert!(ps.override_at(50).is_none());
        assert_eq!(ps.override_at(150).unwrap().status, AvailabilityStatus::Offline);
        assert_eq!(ps.override_at(250).unwrap().status, AvailabilityStatus::Available);
        // Second override expired; first still in effect.
        assert_eq!(ps.override_at(300).unwrap().status, AvailabilityStatus::Offline);
        assert_eq!(ps.next_override_boundary(150), Some(200));
        assert_eq!(ps.next_override_boundary(250), Some(300));
        assert_eq!(ps.next_override_boundary(300), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            id: Ulid::new(),
            professional_id: Ulid::new(),
            user_id: Ulid::new(),
            window: Span::new(1000, 2000),
            status: BookingStatus::Pending,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
