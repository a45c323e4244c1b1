use ulid::Ulid;

use super::availability::{Conflict, DateRangeError};
use super::guard::DenyReason;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    InvalidDateRange(DateRangeError),
    Validation {
        field: &'static str,
        message: String,
    },
    BookingConflict(Conflict),
    Forbidden(DenyReason),
    AlreadyExists(String),
    InvalidCredentials,
    LimitExceeded(&'static str),
    WalError(String),
    Internal(String),
}

impl EngineError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field,
            message: message.into(),
        }
    }

    /// HTTP status a gateway in front of the engine should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::NotFound(_) => 404,
            EngineError::InvalidDateRange(_)
            | EngineError::Validation { .. }
            | EngineError::LimitExceeded(_) => 400,
            EngineError::Forbidden(DenyReason::AuthenticationRequired)
            | EngineError::InvalidCredentials => 401,
            EngineError::Forbidden(_) | EngineError::BookingConflict(_) => 403,
            EngineError::AlreadyExists(_) => 409,
            EngineError::WalError(_) | EngineError::Internal(_) => 500,
        }
    }

    /// Short stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidDateRange(_) => "invalid_dates",
            EngineError::Validation { .. } => "validation",
            EngineError::BookingConflict(_) => "conflict",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidCredentials => "invalid_credentials",
            EngineError::LimitExceeded(_) => "limit",
            EngineError::WalError(_) => "wal",
            EngineError::Internal(_) => "internal",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::InvalidDateRange(e) => write!(f, "{}: {e}", e.field()),
            EngineError::Validation { field, message } => write!(f, "{field}: {message}"),
            EngineError::BookingConflict(c) => {
                write!(
                    f,
                    "spot is already booked for the specified dates (conflicting: {})",
                    c.fields().join(", ")
                )
            }
            EngineError::Forbidden(reason) => write!(f, "forbidden: {reason}"),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::InvalidCredentials => write!(f, "invalid credentials"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<DateRangeError> for EngineError {
    fn from(e: DateRangeError) -> Self {
        EngineError::InvalidDateRange(e)
    }
}
