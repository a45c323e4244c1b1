use chrono::NaiveDate;

use crate::limits::MAX_REVIEW_IMAGES;
use crate::model::*;

use super::lifecycle::{lifecycle_state, Lifecycle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
}

/// The target of an action, already resolved by the caller.
///
/// The child slot is `None` when the child is being created or when its id
/// did not resolve; for anything but `Create` that means `NotFound`. The
/// parent is always resolved: a missing parent is the caller's `NotFound`.
#[derive(Debug, Clone, Copy)]
pub enum Resource<'a> {
    Spot(Option<&'a SpotState>),
    Booking {
        spot: &'a SpotState,
        booking: Option<&'a Booking>,
    },
    Review {
        spot: &'a SpotState,
        review: Option<&'a Review>,
    },
    SpotImage {
        spot: &'a SpotState,
        image: Option<&'a SpotImage>,
    },
    ReviewImage {
        review: &'a Review,
        image: Option<&'a ReviewImage>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    AuthenticationRequired,
    NotResourceOwner,
    SelfBookingDenied,
    AlreadyReviewed,
    OwnSpotReview,
    PastBookingImmutable,
    StartedBookingImmutable,
    ImageLimitReached,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            DenyReason::AuthenticationRequired => "authentication required",
            DenyReason::NotResourceOwner => "resource belongs to another user",
            DenyReason::SelfBookingDenied => "cannot book your own spot",
            DenyReason::AlreadyReviewed => "user already has a review for this spot",
            DenyReason::OwnSpotReview => "cannot review your own spot",
            DenyReason::PastBookingImmutable => "past bookings can't be modified",
            DenyReason::StartedBookingImmutable => "bookings that have been started can't be deleted",
            DenyReason::ImageLimitReached => "maximum number of images for this resource was reached",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
    NotFound,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Decide whether `actor` may perform `action` on `resource`.
///
/// Order: unresolved or orphaned target → `NotFound`; reads are public;
/// mutations need an actor; then the per-resource ownership rules.
pub fn authorize(
    actor: Option<UserId>,
    action: Action,
    resource: Resource<'_>,
    today: NaiveDate,
) -> Decision {
    if !resolves(action, &resource) {
        return Decision::NotFound;
    }
    if action == Action::Read {
        return Decision::Allow;
    }
    let Some(actor) = actor else {
        return Decision::Deny(DenyReason::AuthenticationRequired);
    };

    match resource {
        Resource::Spot(spot) => match (action, spot) {
            (Action::Create, _) => Decision::Allow,
            (_, Some(spot)) => owner_only(actor, spot.owner_id),
            (_, None) => Decision::NotFound,
        },
        Resource::Booking { spot, booking } => booking_rule(actor, action, spot, booking, today),
        Resource::Review { spot, review } => match (action, review) {
            (Action::Create, _) => {
                if spot.review_by(actor).is_some() {
                    Decision::Deny(DenyReason::AlreadyReviewed)
                } else if spot.owner_id == actor {
                    Decision::Deny(DenyReason::OwnSpotReview)
                } else {
                    Decision::Allow
                }
            }
            (_, Some(review)) => owner_only(actor, review.user_id),
            (_, None) => Decision::NotFound,
        },
        Resource::SpotImage { spot, .. } => owner_only(actor, spot.owner_id),
        Resource::ReviewImage { review, .. } => match owner_only(actor, review.user_id) {
            Decision::Allow
                if action == Action::Create && review.images.len() >= MAX_REVIEW_IMAGES =>
            {
                Decision::Deny(DenyReason::ImageLimitReached)
            }
            other => other,
        },
    }
}

fn booking_rule(
    actor: UserId,
    action: Action,
    spot: &SpotState,
    booking: Option<&Booking>,
    today: NaiveDate,
) -> Decision {
    let booking = match (action, booking) {
        (Action::Create, _) => {
            return if spot.owner_id == actor {
                Decision::Deny(DenyReason::SelfBookingDenied)
            } else {
                Decision::Allow
            };
        }
        (_, Some(b)) => b,
        (_, None) => return Decision::NotFound,
    };

    let state = lifecycle_state(booking, today);
    match action {
        Action::Update => {
            if booking.user_id != actor {
                Decision::Deny(DenyReason::NotResourceOwner)
            } else if state == Lifecycle::Completed {
                Decision::Deny(DenyReason::PastBookingImmutable)
            } else {
                Decision::Allow
            }
        }
        Action::Delete => {
            if booking.user_id != actor && spot.owner_id != actor {
                Decision::Deny(DenyReason::NotResourceOwner)
            } else if state != Lifecycle::Scheduled {
                Decision::Deny(DenyReason::StartedBookingImmutable)
            } else {
                Decision::Allow
            }
        }
        Action::Create | Action::Read => Decision::Allow,
    }
}

fn owner_only(actor: UserId, owner: UserId) -> Decision {
    if actor == owner {
        Decision::Allow
    } else {
        Decision::Deny(DenyReason::NotResourceOwner)
    }
}

/// False when the target is missing or hangs off a parent it doesn't belong
/// to. An orphan is treated as already deleted.
fn resolves(action: Action, resource: &Resource<'_>) -> bool {
    let creating = action == Action::Create;
    match resource {
        Resource::Spot(spot) => creating || spot.is_some(),
        Resource::Booking { spot, booking } => match booking {
            Some(b) => creating || b.spot_id == spot.id,
            None => creating,
        },
        Resource::Review { spot, review } => match review {
            Some(r) => creating || r.spot_id == spot.id,
            None => creating,
        },
        Resource::SpotImage { spot, image } => match image {
            Some(i) => creating || i.spot_id == spot.id,
            None => creating,
        },
        Resource::ReviewImage { review, image } => match image {
            Some(i) => creating || i.review_id == review.id,
            None => creating,
        },
    }
}
