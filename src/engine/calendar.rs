use std::collections::HashMap;

use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;
use ulid::Ulid;

use crate::limits::MAX_CALENDAR_CELL_BOOKINGS;
use crate::model::*;

// ── Calendar projection ───────────────────────────────────────────

/// One booking as it appears inside a day cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEntry {
    pub id: Ulid,
    pub title: String,
    #[serde(flatten)]
    pub span: Span,
    pub status: BookingStatus,
}

impl From<&Booking> for CalendarEntry {
    fn from(b: &Booking) -> Self {
        Self {
            id: b.id,
            title: b.title.clone(),
            span: b.span,
            status: b.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarDay {
    pub date: NaiveDate,
    /// Bookings starting this day, capped for display.
    pub bookings: Vec<CalendarEntry>,
    /// How many more bookings start this day beyond the displayed ones.
    pub overflow: usize,
    /// Two non-terminal bookings on this day overlap. Informational only —
    /// creation-time conflict checking remains the authoritative gate.
    pub conflict: bool,
}

/// Project bookings onto a 6-week grid for the month containing `reference`:
/// 42 day cells starting on the Sunday on/before the 1st. Pure function of
/// its inputs — same date and bookings, same grid.
///
/// Bookings are bucketed by the UTC calendar date their span starts on.
pub fn month_grid(reference: NaiveDate, bookings: &[Booking]) -> Vec<CalendarDay> {
    let first = reference.with_day0(0).unwrap_or(reference);
    let grid_start = first - Duration::days(first.weekday().num_days_from_sunday() as i64);

    let mut by_day: HashMap<NaiveDate, Vec<&Booking>> = HashMap::new();
    for b in bookings {
        if let Some(day) = start_date_utc(b.span.start) {
            by_day.entry(day).or_default().push(b);
        }
    }

    (0..42)
        .map(|i| {
            let date = grid_start + Duration::days(i);
            let mut day_bookings = by_day.remove(&date).unwrap_or_default();
            day_bookings.sort_by_key(|b| (b.span.start, b.id));

            let conflict = has_pairwise_overlap(&day_bookings);
            let total = day_bookings.len();
            let shown = total.min(MAX_CALENDAR_CELL_BOOKINGS);
            let entries = day_bookings[..shown].iter().map(|b| CalendarEntry::from(*b)).collect();

            CalendarDay {
                date,
                bookings: entries,
                overflow: total - shown,
                conflict,
            }
        })
        .collect()
}

fn start_date_utc(ms: Ms) -> Option<NaiveDate> {
    chrono::DateTime::from_timestamp_millis(ms).map(|dt| dt.date_naive())
}

/// Any two non-terminal bookings on the day with overlapping spans flag the
/// cell. Same predicate as the creation-time conflict check.
fn has_pairwise_overlap(day_bookings: &[&Booking]) -> bool {
    let active: Vec<&&Booking> = day_bookings.iter().filter(|b| !b.status.is_terminal()).collect();
    for i in 0..active.len() {
        for j in (i + 1)..active.len() {
            if active[i].span.overlaps(&active[j].span) {
                return true;
            }
        }
    }
    false
}
