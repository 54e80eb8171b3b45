use ulid::Ulid;

use crate::model::{BookingConflict, BookingStatus};

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input, rejected before any state is touched.
    Validation {
        field: &'static str,
        message: String,
    },
    /// Candidate interval overlaps one or more active bookings.
    Conflict(Vec<BookingConflict>),
    /// Attempted state change not permitted by the booking lifecycle.
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    /// Caller is neither the booking's creator nor an admin.
    Forbidden(&'static str),
    NotFound(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation { field, message } => {
                write!(f, "invalid {field}: {message}")
            }
            EngineError::Conflict(conflicts) => {
                write!(f, "interval overlaps {} active booking(s)", conflicts.len())
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "cannot move booking from {from} to {to}")
            }
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
