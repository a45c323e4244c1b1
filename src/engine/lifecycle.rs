use chrono::NaiveDate;

use crate::model::Booking;

/// Where a booking sits relative to today. Derived on demand, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// `today < start`
    Scheduled,
    /// `start <= today <= end`
    Active,
    /// `today > end`
    Completed,
}

/// Every temporal deny rule goes through this one comparison.
pub fn lifecycle_state(booking: &Booking, today: NaiveDate) -> Lifecycle {
    if today < booking.stay.start {
        Lifecycle::Scheduled
    } else if today <= booking.stay.end {
        Lifecycle::Active
    } else {
        Lifecycle::Completed
    }
}
