use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type inside the engine.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Booking lifecycle status. `pending` and `approved` count toward conflict
/// checks; `rejected` and `cancelled` are terminal and never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl BookingStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Approved)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Approved => "approved",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A booking on a facility. `span` never changes after creation; only
/// `status` and the review fields move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: Ulid,
    pub facility_id: Ulid,
    pub title: String,
    pub created_by: String,
    #[serde(flatten)]
    pub span: Span,
    pub status: BookingStatus,
    pub note: Option<String>,
    pub review_reason: Option<String>,
    pub reviewed_by: Option<String>,
    pub cancelled_by: Option<String>,
    pub created_at: Ms,
}

#[derive(Debug, Clone)]
pub struct FacilityState {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    /// All bookings ever made on this facility (terminal ones included),
    /// sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl FacilityState {
    pub fn new(id: Ulid, name: String, description: Option<String>) -> Self {
        Self {
            id,
            name,
            description,
            bookings: Vec::new(),
        }
    }

    /// Insert a booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn get_booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| &b.id == id)
    }

    pub fn get_booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| &b.id == id)
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    FacilityCreated {
        id: Ulid,
        name: String,
        description: Option<String>,
    },
    BookingRequested {
        id: Ulid,
        facility_id: Ulid,
        title: String,
        created_by: String,
        span: Span,
        note: Option<String>,
        created_at: Ms,
    },
    BookingApproved {
        id: Ulid,
        facility_id: Ulid,
        reason: Option<String>,
        reviewed_by: String,
    },
    BookingRejected {
        id: Ulid,
        facility_id: Ulid,
        reason: Option<String>,
        reviewed_by: String,
    },
    BookingCancelled {
        id: Ulid,
        facility_id: Ulid,
        cancelled_by: String,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilityInfo {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub booking_count: usize,
}

/// One existing booking that blocks a candidate interval. Carries enough to
/// render the clash to the requester verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingConflict {
    pub id: Ulid,
    pub title: String,
    #[serde(flatten)]
    pub span: Span,
    pub status: BookingStatus,
}

impl From<&Booking> for BookingConflict {
    fn from(b: &Booking) -> Self {
        Self {
            id: b.id,
            title: b.title.clone(),
            span: b.span,
            status: b.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            facility_id: Ulid::new(),
            title: "Test".into(),
            created_by: "alice".into(),
            span: Span::new(start, end),
            status: BookingStatus::Pending,
            note: None,
            review_reason: None,
            reviewed_by: None,
            cancelled_by: None,
            created_at: 0,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn status_activity() {
        assert!(BookingStatus::Pending.is_active());
        assert!(BookingStatus::Approved.is_active());
        assert!(BookingStatus::Rejected.is_terminal());
        assert!(BookingStatus::Cancelled.is_terminal());
    }

    #[test]
    fn booking_ordering() {
        let mut fs = FacilityState::new(Ulid::new(), "Hall".into(), None);
        fs.insert_booking(booking(300, 400));
        fs.insert_booking(booking(100, 200));
        fs.insert_booking(booking(200, 300));
        assert_eq!(fs.bookings[0].span.start, 100);
        assert_eq!(fs.bookings[1].span.start, 200);
        assert_eq!(fs.bookings[2].span.start, 300);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut fs = FacilityState::new(Ulid::new(), "Hall".into(), None);
        fs.insert_booking(booking(100, 200));
        fs.insert_booking(booking(450, 600));
        fs.insert_booking(booking(1000, 1100));

        let query = Span::new(500, 800);
        let hits: Vec<_> = fs.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        // Booking ending exactly at query.start is NOT overlapping (half-open)
        let mut fs = FacilityState::new(Ulid::new(), "Hall".into(), None);
        fs.insert_booking(booking(100, 200));
        let query = Span::new(200, 300);
        let hits: Vec<_> = fs.overlapping(&query).collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn overlapping_empty_facility() {
        let fs = FacilityState::new(Ulid::new(), "Hall".into(), None);
        let query = Span::new(0, 1000);
        let hits: Vec<_> = fs.overlapping(&query).collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn overlapping_large_span_covering_query() {
        let mut fs = FacilityState::new(Ulid::new(), "Hall".into(), None);
        fs.insert_booking(booking(0, 10_000));
        let query = Span::new(500, 600);
        let hits: Vec<_> = fs.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn booking_json_shape() {
        let mut b = booking(1000, 2000);
        b.status = BookingStatus::Approved;
        let json = serde_json::to_value(&b).unwrap();
        // span flattens into start/end, enum serializes lowercase
        assert_eq!(json["start"], 1000);
        assert_eq!(json["end"], 2000);
        assert_eq!(json["status"], "approved");
        assert_eq!(json["createdBy"], "alice");
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingRequested {
            id: Ulid::new(),
            facility_id: Ulid::new(),
            title: "Badminton".into(),
            created_by: "alice".into(),
            span: Span::new(1000, 2000),
            note: Some("evening slot".into()),
            created_at: 500,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
