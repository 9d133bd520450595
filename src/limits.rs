use crate::model::Ms;

pub const MAX_PROFESSIONALS: usize = 1_000_000;
/// Bookings + calendar entries + overrides held for one professional.
pub const MAX_FACTS_PER_PROFESSIONAL: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EXTERNAL_ID_LEN: usize = 512;
/// Largest WAL frame payload accepted on replay. Real events are a few KiB at most.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single fact may span at most ~1 year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

/// Pending reconciliation requests buffered before `on_fact_changed` awaits.
pub const RECONCILE_QUEUE_CAPACITY: usize = 4096;
/// Calendar events accepted from one external sync call.
pub const MAX_SYNC_EVENTS: usize = 10_000;
