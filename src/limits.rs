use crate::model::Ms;

/// Hard caps protecting the engine from unbounded input.

pub const MAX_FACILITIES: usize = 10_000;
pub const MAX_BOOKINGS_PER_FACILITY: usize = 100_000;

pub const MIN_TITLE_LEN: usize = 3;
pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 2_000;
pub const MAX_NOTE_LEN: usize = 2_000;
pub const MAX_REASON_LEN: usize = 2_000;
pub const MAX_USER_ID_LEN: usize = 200;

/// 2000-01-01T00:00:00Z — nothing in a housing society is booked before this.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single booking may not span more than 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;

/// Upper bound on `?startDate=&endDate=` windows in booking listings.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

/// Bookings shown per calendar day cell; the rest is an overflow count.
pub const MAX_CALENDAR_CELL_BOOKINGS: usize = 3;
