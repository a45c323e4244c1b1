use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::{find_conflict, validate_stay};
use super::guard::Decision;
use super::EngineError;

/// Today's UTC calendar date.
pub(crate) fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

/// Stay rules first, then the spot's own bookings (minus `exclude`). The
/// caller holds the spot's write lock across this and the write.
pub(crate) fn check_stay(
    spot: &SpotState,
    stay: &Stay,
    exclude: Option<BookingId>,
    today: NaiveDate,
) -> Result<(), EngineError> {
    validate_stay(stay, today)?;
    match find_conflict(spot.overlapping(stay), stay, exclude) {
        Some(conflict) => Err(EngineError::BookingConflict(conflict)),
        None => Ok(()),
    }
}

/// Turn a guard decision into the engine's error. `target` names what the
/// caller looked up, for the not-found message.
pub(crate) fn enforce(decision: Decision, target: Ulid) -> Result<(), EngineError> {
    match decision {
        Decision::Allow => Ok(()),
        Decision::Deny(reason) => Err(EngineError::Forbidden(reason)),
        Decision::NotFound => Err(EngineError::NotFound(target)),
    }
}
