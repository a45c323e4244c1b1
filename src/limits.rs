// Stay rules.
pub const MAX_STAY_NIGHTS: i64 = 14;
pub const BOOKING_HORIZON_MONTHS: u32 = 12;

// Listing and review rules.
pub const MAX_SPOT_NAME_LEN: usize = 49;
pub const MIN_STARS: u8 = 1;
pub const MAX_STARS: u8 = 5;
pub const MAX_REVIEW_IMAGES: usize = 10;

// Sign-up rules.
pub const MIN_USERNAME_LEN: usize = 4;
pub const MAX_USERNAME_LEN: usize = 30;
pub const MIN_PASSWORD_LEN: usize = 6;

// Search paging.
pub const DEFAULT_PAGE: u32 = 1;
pub const MAX_PAGE: u32 = 10;
pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 20;

// Hard caps that keep a single process bounded.
pub const MAX_USERS: usize = 1_000_000;
pub const MAX_SPOTS: usize = 100_000;
pub const MAX_BOOKINGS_PER_SPOT: usize = 10_000;
pub const MAX_SPOT_IMAGES: usize = 100;
pub const MAX_TEXT_LEN: usize = 4_096;
pub const MAX_URL_LEN: usize = 2_048;
pub const MAX_FIELD_LEN: usize = 255;
