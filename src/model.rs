use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub type UserId = Ulid;
pub type SpotId = Ulid;
pub type BookingId = Ulid;
pub type ReviewId = Ulid;
pub type ImageId = Ulid;

/// Inclusive calendar-date range `[start, end]`. Both days are occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stay {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Stay {
    /// No ordering check here: callers build a `Stay` from raw input and run
    /// `validate_stay` on it before it can reach a spot.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    /// Inclusive on both ends: a stay ending on day X overlaps one starting on X.
    pub fn overlaps(&self, other: &Stay) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub spot_id: SpotId,
    pub user_id: UserId,
    pub stay: Stay,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotImage {
    pub id: ImageId,
    pub spot_id: SpotId,
    pub url: String,
    /// Marks the image shown on listing cards.
    pub preview: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewImage {
    pub id: ImageId,
    pub review_id: ReviewId,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub id: ReviewId,
    pub spot_id: SpotId,
    pub user_id: UserId,
    pub review: String,
    pub stars: u8,
    pub images: Vec<ReviewImage>,
}

/// The owner-editable fields of a spot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotDetails {
    pub address: String,
    pub city: String,
    pub state: String,
    pub country: String,
    pub lat: f64,
    pub lng: f64,
    pub name: String,
    pub description: String,
    pub price: f64,
}

/// Partial update of `SpotDetails`; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpotPatch {
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
}

impl SpotPatch {
    pub fn is_empty(&self) -> bool {
        *self == SpotPatch::default()
    }

    pub fn apply_to(self, details: &SpotDetails) -> SpotDetails {
        SpotDetails {
            address: self.address.unwrap_or_else(|| details.address.clone()),
            city: self.city.unwrap_or_else(|| details.city.clone()),
            state: self.state.unwrap_or_else(|| details.state.clone()),
            country: self.country.unwrap_or_else(|| details.country.clone()),
            lat: self.lat.unwrap_or(details.lat),
            lng: self.lng.unwrap_or(details.lng),
            name: self.name.unwrap_or_else(|| details.name.clone()),
            description: self.description.unwrap_or_else(|| details.description.clone()),
            price: self.price.unwrap_or(details.price),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserState {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    /// Argon2id PHC string.
    pub password_hash: String,
}

/// A spot and everything it owns. Guarded by one `RwLock` in the engine, so
/// holding the write guard serializes every booking/review decision on it.
#[derive(Debug, Clone)]
pub struct SpotState {
    pub id: SpotId,
    pub owner_id: UserId,
    pub details: SpotDetails,
    pub images: Vec<SpotImage>,
    pub reviews: Vec<Review>,
    /// Sorted by `stay.start`.
    pub bookings: Vec<Booking>,
}

impl SpotState {
    pub fn new(id: SpotId, owner_id: UserId, details: SpotDetails) -> Self {
        Self {
            id,
            owner_id,
            details,
            images: Vec::new(),
            reviews: Vec::new(),
            bookings: Vec::new(),
        }
    }

    /// Insert a booking maintaining sort order by start date.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.stay.start <= booking.stay.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: BookingId) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Bookings whose stay shares at least one day with `query`.
    /// Everything at index >= right_bound starts after `query.end`.
    pub fn overlapping(&self, query: &Stay) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.stay.start <= query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.stay.end >= query.start)
    }

    pub fn review(&self, id: ReviewId) -> Option<&Review> {
        self.reviews.iter().find(|r| r.id == id)
    }

    pub fn review_mut(&mut self, id: ReviewId) -> Option<&mut Review> {
        self.reviews.iter_mut().find(|r| r.id == id)
    }

    pub fn review_by(&self, user_id: UserId) -> Option<&Review> {
        self.reviews.iter().find(|r| r.user_id == user_id)
    }

    pub fn review_image(&self, id: ImageId) -> Option<(&Review, &ReviewImage)> {
        self.reviews
            .iter()
            .find_map(|r| r.images.iter().find(|i| i.id == id).map(|i| (r, i)))
    }

    pub fn image(&self, id: ImageId) -> Option<&SpotImage> {
        self.images.iter().find(|i| i.id == id)
    }

    pub fn avg_rating(&self) -> Option<f64> {
        if self.reviews.is_empty() {
            return None;
        }
        let total: u32 = self.reviews.iter().map(|r| u32::from(r.stars)).sum();
        Some(f64::from(total) / self.reviews.len() as f64)
    }

    /// Most recently added preview image, if any.
    pub fn preview_image(&self) -> Option<&str> {
        self.images
            .iter()
            .rev()
            .find(|i| i.preview)
            .map(|i| i.url.as_str())
    }
}

/// Flat event types; this is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    UserCreated {
        id: UserId,
        username: String,
        email: String,
        first_name: String,
        last_name: String,
        password_hash: String,
    },
    /// Cascades: the user's spots go, and their bookings/reviews elsewhere.
    UserDeleted {
        id: UserId,
    },
    SpotCreated {
        id: SpotId,
        owner_id: UserId,
        details: SpotDetails,
    },
    SpotUpdated {
        id: SpotId,
        details: SpotDetails,
    },
    SpotDeleted {
        id: SpotId,
    },
    SpotImageAdded {
        id: ImageId,
        spot_id: SpotId,
        url: String,
        preview: bool,
    },
    SpotImageRemoved {
        id: ImageId,
        spot_id: SpotId,
    },
    ReviewPosted {
        id: ReviewId,
        spot_id: SpotId,
        user_id: UserId,
        review: String,
        stars: u8,
    },
    ReviewEdited {
        id: ReviewId,
        spot_id: SpotId,
        review: String,
        stars: u8,
    },
    ReviewDeleted {
        id: ReviewId,
        spot_id: SpotId,
    },
    ReviewImageAdded {
        id: ImageId,
        spot_id: SpotId,
        review_id: ReviewId,
        url: String,
    },
    ReviewImageRemoved {
        id: ImageId,
        spot_id: SpotId,
        review_id: ReviewId,
    },
    BookingCreated {
        id: BookingId,
        spot_id: SpotId,
        user_id: UserId,
        stay: Stay,
    },
    BookingUpdated {
        id: BookingId,
        spot_id: SpotId,
        stay: Stay,
    },
    BookingDeleted {
        id: BookingId,
        spot_id: SpotId,
    },
}

// ── Query result types ───────────────────────────────────────────

/// A user without credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

impl From<&UserState> for UserInfo {
    fn from(u: &UserState) -> Self {
        Self {
            id: u.id,
            username: u.username.clone(),
            email: u.email.clone(),
            first_name: u.first_name.clone(),
            last_name: u.last_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpotInfo {
    pub id: SpotId,
    pub owner_id: UserId,
    pub details: SpotDetails,
    pub avg_rating: Option<f64>,
    pub num_reviews: usize,
    pub preview_image: Option<String>,
}

impl From<&SpotState> for SpotInfo {
    fn from(s: &SpotState) -> Self {
        Self {
            id: s.id,
            owner_id: s.owner_id,
            details: s.details.clone(),
            avg_rating: s.avg_rating(),
            num_reviews: s.reviews.len(),
            preview_image: s.preview_image().map(str::to_string),
        }
    }
}

/// Search over spots. Bounds are inclusive; page is 1-based.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpotFilter {
    pub id: Option<SpotId>,
    pub owner_id: Option<UserId>,
    pub page: Option<u32>,
    pub size: Option<u32>,
    pub min_lat: Option<f64>,
    pub max_lat: Option<f64>,
    pub min_lng: Option<f64>,
    pub max_lng: Option<f64>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
}

/// A booking as seen by a given viewer. Anyone other than the booker and
/// the spot owner only learns which days are taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Option<BookingId>,
    pub spot_id: SpotId,
    pub user_id: Option<UserId>,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl BookingInfo {
    pub fn full(b: &Booking) -> Self {
        Self {
            id: Some(b.id),
            spot_id: b.spot_id,
            user_id: Some(b.user_id),
            start: b.stay.start,
            end: b.stay.end,
        }
    }

    pub fn redacted(b: &Booking) -> Self {
        Self {
            id: None,
            spot_id: b.spot_id,
            user_id: None,
            start: b.stay.start,
            end: b.stay.end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewInfo {
    pub id: ReviewId,
    pub spot_id: SpotId,
    pub user_id: UserId,
    pub review: String,
    pub stars: u8,
    pub image_urls: Vec<String>,
}

impl From<&Review> for ReviewInfo {
    fn from(r: &Review) -> Self {
        Self {
            id: r.id,
            spot_id: r.spot_id,
            user_id: r.user_id,
            review: r.review.clone(),
            stars: r.stars,
            image_urls: r.images.iter().map(|i| i.url.clone()).collect(),
        }
    }
}
