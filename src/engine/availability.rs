use chrono::{Months, NaiveDate};

use crate::limits::{BOOKING_HORIZON_MONTHS, MAX_STAY_NIGHTS};
use crate::model::*;

// ── Stay validation ───────────────────────────────────────────────

/// Why a requested stay was rejected before any conflict check ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateRangeError {
    StartInPast,
    StartTooFarInFuture,
    EndBeforeStart,
    StayTooLong,
}

impl DateRangeError {
    /// The input column the error should be attributed to.
    pub fn field(&self) -> &'static str {
        match self {
            DateRangeError::StartInPast | DateRangeError::StartTooFarInFuture => "start_date",
            DateRangeError::EndBeforeStart | DateRangeError::StayTooLong => "end_date",
        }
    }
}

impl std::fmt::Display for DateRangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DateRangeError::StartInPast => write!(f, "start_date cannot be in the past"),
            DateRangeError::StartTooFarInFuture => {
                write!(f, "start_date cannot be more than {BOOKING_HORIZON_MONTHS} months ahead")
            }
            DateRangeError::EndBeforeStart => {
                write!(f, "end_date cannot be on or before start_date")
            }
            DateRangeError::StayTooLong => {
                write!(f, "stays cannot be longer than {MAX_STAY_NIGHTS} days")
            }
        }
    }
}

impl std::error::Error for DateRangeError {}

/// Run the stay rules in their fixed order; the first failure wins.
///
/// `today` is a calendar date, so time of day never matters: a stay starting
/// today is allowed, one starting yesterday is not.
pub fn validate_stay(stay: &Stay, today: NaiveDate) -> Result<(), DateRangeError> {
    if stay.start < today {
        return Err(DateRangeError::StartInPast);
    }
    let horizon = today
        .checked_add_months(Months::new(BOOKING_HORIZON_MONTHS))
        .unwrap_or(NaiveDate::MAX);
    if stay.start > horizon {
        return Err(DateRangeError::StartTooFarInFuture);
    }
    if stay.end <= stay.start {
        return Err(DateRangeError::EndBeforeStart);
    }
    if stay.nights() > MAX_STAY_NIGHTS {
        return Err(DateRangeError::StayTooLong);
    }
    Ok(())
}

// ── Conflict detection ────────────────────────────────────────────

/// An existing booking that shares at least one day with the candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    /// Kept out of error messages; strangers may not learn booking ids.
    pub booking_id: BookingId,
    /// Candidate start falls inside the existing stay.
    pub start_date: bool,
    /// Candidate end falls inside the existing stay.
    pub end_date: bool,
}

impl Conflict {
    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::with_capacity(2);
        if self.start_date {
            fields.push("start_date");
        }
        if self.end_date {
            fields.push("end_date");
        }
        fields
    }
}

/// First booking overlapping `candidate` under the inclusive policy, skipping
/// `exclude` (the booking being moved, on update).
///
/// Overlap is the general interval test, not just "an endpoint lands inside":
/// an existing stay strictly inside the candidate is a conflict too, and then
/// both fields are reported.
pub fn find_conflict<'a>(
    existing: impl IntoIterator<Item = &'a Booking>,
    candidate: &Stay,
    exclude: Option<BookingId>,
) -> Option<Conflict> {
    existing
        .into_iter()
        .filter(|b| Some(b.id) != exclude)
        .find(|b| b.stay.overlaps(candidate))
        .map(|b| {
            let start_date = b.stay.contains_day(candidate.start);
            let end_date = b.stay.contains_day(candidate.end);
            if start_date || end_date {
                Conflict { booking_id: b.id, start_date, end_date }
            } else {
                Conflict { booking_id: b.id, start_date: true, end_date: true }
            }
        })
}

pub fn has_conflict(existing: &[Booking], candidate: &Stay, exclude: Option<BookingId>) -> bool {
    find_conflict(existing, candidate, exclude).is_some()
}
