use ulid::Ulid;

use crate::limits::MAX_QUERY_WINDOW_MS;
use crate::model::*;

use super::{Engine, EngineError};

/// Server-side filters for booking listings. All optional, all ANDed.
#[derive(Debug, Clone, Default)]
pub struct BookingFilter {
    pub status: Option<BookingStatus>,
    pub facility_id: Option<Ulid>,
    /// Keep bookings whose span overlaps this window (half-open).
    pub window: Option<Span>,
}

impl BookingFilter {
    fn matches(&self, b: &Booking) -> bool {
        if let Some(status) = self.status
            && b.status != status
        {
            return false;
        }
        if let Some(ref window) = self.window
            && !b.span.overlaps(window)
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct BookingPage {
    pub bookings: Vec<Booking>,
    pub total: usize,
}

impl Engine {
    pub async fn list_facilities(&self) -> Vec<FacilityInfo> {
        let mut out = Vec::new();
        let ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some(fs) = self.get_facility(&id) {
                let guard = fs.read().await;
                out.push(FacilityInfo {
                    id: guard.id,
                    name: guard.name.clone(),
                    description: guard.description.clone(),
                    booking_count: guard.bookings.len(),
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn list_bookings(&self, filter: BookingFilter) -> Result<BookingPage, EngineError> {
        if let Some(ref w) = filter.window
            && w.duration_ms() > MAX_QUERY_WINDOW_MS
        {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }

        let facility_ids: Vec<Ulid> = match filter.facility_id {
            Some(id) => {
                if self.get_facility(&id).is_none() {
                    return Err(EngineError::NotFound(id));
                }
                vec![id]
            }
            None => self.state.iter().map(|e| *e.key()).collect(),
        };

        let mut bookings = Vec::new();
        for id in facility_ids {
            let Some(fs) = self.get_facility(&id) else { continue };
            let guard = fs.read().await;
            match filter.window {
                // overlapping() prunes with binary search when a window is given
                Some(ref w) => {
                    bookings.extend(guard.overlapping(w).filter(|b| filter.matches(b)).cloned())
                }
                None => bookings.extend(guard.bookings.iter().filter(|b| filter.matches(b)).cloned()),
            }
        }

        bookings.sort_by_key(|b| (b.span.start, b.id));
        let total = bookings.len();
        Ok(BookingPage { bookings, total })
    }

    pub async fn get_booking(&self, id: &Ulid) -> Result<Booking, EngineError> {
        let facility_id = self
            .facility_for_booking(id)
            .ok_or(EngineError::NotFound(*id))?;
        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        let guard = fs.read().await;
        guard.get_booking(id).cloned().ok_or(EngineError::NotFound(*id))
    }
}
