use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{find_conflicts, now_ms, validate_span};
use super::{Engine, EngineError};

/// Who is asking. Always passed explicitly — the engine has no ambient
/// notion of a "current user".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Resident,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "resident" => Some(Role::Resident),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub user: String,
    pub role: Role,
}

impl Session {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// A validated-yet-unchecked booking request. Instants are already composed
/// from the caller's date + time-of-day at the HTTP boundary.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub facility_id: Ulid,
    pub title: String,
    pub start: Ms,
    pub end: Ms,
    pub note: Option<String>,
    pub created_by: String,
}

fn validate_text(field: &'static str, value: &str, min: usize, max: usize) -> Result<(), EngineError> {
    let len = value.chars().count();
    if len < min {
        return Err(EngineError::Validation {
            field,
            message: format!("must be at least {min} characters"),
        });
    }
    if len > max {
        return Err(EngineError::Validation {
            field,
            message: format!("must be at most {max} characters"),
        });
    }
    Ok(())
}

impl Engine {
    pub async fn create_facility(
        &self,
        name: String,
        description: Option<String>,
        session: &Session,
    ) -> Result<FacilityInfo, EngineError> {
        if !session.is_admin() {
            return Err(EngineError::Forbidden("only admins manage facilities"));
        }
        validate_text("name", &name, 1, MAX_NAME_LEN)?;
        if let Some(ref d) = description
            && d.chars().count() > MAX_DESCRIPTION_LEN
        {
            return Err(EngineError::LimitExceeded("facility description too long"));
        }
        if self.state.len() >= MAX_FACILITIES {
            return Err(EngineError::LimitExceeded("too many facilities"));
        }

        let id = Ulid::new();
        let event = Event::FacilityCreated {
            id,
            name: name.clone(),
            description: description.clone(),
        };
        self.wal_append(&event).await?;
        let fs = FacilityState::new(id, name.clone(), description.clone());
        self.state.insert(id, Arc::new(RwLock::new(fs)));
        self.notify.send(id, &event);
        metrics::gauge!(crate::observability::FACILITIES_ACTIVE).set(self.state.len() as f64);

        Ok(FacilityInfo {
            id,
            name,
            description,
            booking_count: 0,
        })
    }

    /// Validate, conflict-check, and persist a new booking as `pending`.
    ///
    /// The conflict check and the insert happen under the same facility write
    /// lock: two concurrent requests for overlapping slots on one facility
    /// can never both be admitted.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        validate_text("title", &req.title, MIN_TITLE_LEN, MAX_TITLE_LEN)?;
        validate_text("createdBy", &req.created_by, 1, MAX_USER_ID_LEN)?;
        if let Some(ref n) = req.note
            && n.chars().count() > MAX_NOTE_LEN
        {
            return Err(EngineError::LimitExceeded("note too long"));
        }
        let span = Span { start: req.start, end: req.end };
        validate_span(&span)?;

        let fs = self
            .get_facility(&req.facility_id)
            .ok_or(EngineError::NotFound(req.facility_id))?;
        let mut guard = fs.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many bookings on facility"));
        }

        let conflicts = find_conflicts(&guard, &span, None);
        if !conflicts.is_empty() {
            metrics::counter!(crate::observability::SCHEDULING_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::Conflict(conflicts));
        }

        let booking = Booking {
            id: Ulid::new(),
            facility_id: req.facility_id,
            title: req.title,
            created_by: req.created_by,
            span,
            status: BookingStatus::Pending,
            note: req.note,
            review_reason: None,
            reviewed_by: None,
            cancelled_by: None,
            created_at: now_ms(),
        };
        let event = Event::BookingRequested {
            id: booking.id,
            facility_id: booking.facility_id,
            title: booking.title.clone(),
            created_by: booking.created_by.clone(),
            span: booking.span,
            note: booking.note.clone(),
            created_at: booking.created_at,
        };
        self.persist_and_apply(req.facility_id, &mut guard, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);

        Ok(booking)
    }

    pub async fn approve_booking(
        &self,
        id: Ulid,
        reason: Option<String>,
        session: &Session,
    ) -> Result<Booking, EngineError> {
        self.review_booking(id, BookingStatus::Approved, reason, session).await
    }

    pub async fn reject_booking(
        &self,
        id: Ulid,
        reason: Option<String>,
        session: &Session,
    ) -> Result<Booking, EngineError> {
        self.review_booking(id, BookingStatus::Rejected, reason, session).await
    }

    /// Shared approve/reject path: admin-only, pending-only, no mutation on
    /// failure.
    async fn review_booking(
        &self,
        id: Ulid,
        verdict: BookingStatus,
        reason: Option<String>,
        session: &Session,
    ) -> Result<Booking, EngineError> {
        if !session.is_admin() {
            return Err(EngineError::Forbidden("only admins review bookings"));
        }
        if let Some(ref r) = reason
            && r.chars().count() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("reason too long"));
        }

        let (facility_id, mut guard) = self.resolve_booking_write(&id).await?;
        let current = guard
            .get_booking(&id)
            .ok_or(EngineError::NotFound(id))?
            .status;
        if current != BookingStatus::Pending {
            return Err(EngineError::InvalidTransition { from: current, to: verdict });
        }

        let event = match verdict {
            BookingStatus::Approved => Event::BookingApproved {
                id,
                facility_id,
                reason,
                reviewed_by: session.user.clone(),
            },
            _ => Event::BookingRejected {
                id,
                facility_id,
                reason,
                reviewed_by: session.user.clone(),
            },
        };
        self.persist_and_apply(facility_id, &mut guard, &event).await?;

        guard.get_booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Cancel a pending or approved booking. Only the creator or an admin may
    /// cancel; a cancelled booking never counts as active again.
    pub async fn cancel_booking(&self, id: Ulid, session: &Session) -> Result<(), EngineError> {
        let (facility_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.get_booking(&id).ok_or(EngineError::NotFound(id))?;

        if booking.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                to: BookingStatus::Cancelled,
            });
        }
        if !session.is_admin() && session.user != booking.created_by {
            return Err(EngineError::Forbidden("only the creator or an admin may cancel"));
        }

        let event = Event::BookingCancelled {
            id,
            facility_id,
            cancelled_by: session.user.clone(),
        };
        self.persist_and_apply(facility_id, &mut guard, &event).await
    }
}
