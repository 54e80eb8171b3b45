use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.end <= span.start {
        return Err(EngineError::Validation {
            field: "endTime",
            message: "end time must be after start time".into(),
        });
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking spans too long an interval"));
    }
    Ok(())
}

/// The one conflict predicate in the codebase: a candidate `[start, end)`
/// clashes with every *active* (pending or approved) booking it overlaps.
/// Rejected and cancelled bookings never count. `exclude` skips one booking
/// id, for checks on behalf of an existing booking.
///
/// Returns the full list of clashing bookings so callers can surface them to
/// the requester rather than a bare error.
pub fn find_conflicts(
    fs: &FacilityState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Vec<BookingConflict> {
    fs.overlapping(span)
        .filter(|b| b.status.is_active())
        .filter(|b| exclude != Some(b.id))
        .map(BookingConflict::from)
        .collect()
}
