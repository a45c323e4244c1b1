use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, SharedSpotState};

fn within(value: f64, min: Option<f64>, max: Option<f64>) -> bool {
    min.is_none_or(|m| value >= m) && max.is_none_or(|m| value <= m)
}

fn page_bounds(filter: &SpotFilter) -> Result<(usize, usize), EngineError> {
    let page = filter.page.unwrap_or(DEFAULT_PAGE);
    if !(1..=MAX_PAGE).contains(&page) {
        return Err(EngineError::invalid("page", format!("page must be from 1 to {MAX_PAGE}")));
    }
    let size = filter.size.unwrap_or(DEFAULT_PAGE_SIZE);
    if !(1..=MAX_PAGE_SIZE).contains(&size) {
        return Err(EngineError::invalid("size", format!("size must be from 1 to {MAX_PAGE_SIZE}")));
    }
    Ok(((page as usize - 1) * size as usize, size as usize))
}

impl Engine {
    /// Map a connection's user name to a live user id. Unknown names are anonymous.
    pub fn resolve_actor(&self, username: &str) -> Option<UserId> {
        self.usernames.get(username).map(|e| *e.value())
    }

    pub fn get_user(&self, id: UserId) -> Result<UserInfo, EngineError> {
        self.users
            .get(&id)
            .map(|u| UserInfo::from(u.value()))
            .ok_or(EngineError::NotFound(id))
    }

    /// The signed-in user, if any.
    pub fn current_user(&self, actor: Option<UserId>) -> Option<UserInfo> {
        self.live_actor(actor).and_then(|id| self.get_user(id).ok())
    }

    fn spot_snapshot(&self) -> Vec<SharedSpotState> {
        self.spots.iter().map(|e| e.value().clone()).collect()
    }

    /// Spots matching `filter`, ordered by id (creation order), one page at a time.
    pub async fn list_spots(&self, filter: &SpotFilter) -> Result<Vec<SpotInfo>, EngineError> {
        let (offset, size) = page_bounds(filter)?;

        let mut rows = Vec::new();
        for rs in self.spot_snapshot() {
            let guard = rs.read().await;
            if filter.id.is_some_and(|id| id != guard.id)
                || filter.owner_id.is_some_and(|o| o != guard.owner_id)
                || !within(guard.details.lat, filter.min_lat, filter.max_lat)
                || !within(guard.details.lng, filter.min_lng, filter.max_lng)
                || !within(guard.details.price, filter.min_price, filter.max_price)
            {
                continue;
            }
            rows.push(SpotInfo::from(&*guard));
        }
        rows.sort_by_key(|s| s.id);
        Ok(rows.into_iter().skip(offset).take(size).collect())
    }

    pub async fn get_spot_info(&self, id: SpotId) -> Result<SpotInfo, EngineError> {
        let rs = self.get_spot(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        Ok(SpotInfo::from(&*guard))
    }

    pub async fn get_spot_images(&self, spot_id: SpotId) -> Result<Vec<SpotImage>, EngineError> {
        let rs = self.get_spot(&spot_id).ok_or(EngineError::NotFound(spot_id))?;
        let guard = rs.read().await;
        Ok(guard.images.clone())
    }

    pub async fn get_reviews_for_spot(&self, spot_id: SpotId) -> Result<Vec<ReviewInfo>, EngineError> {
        let rs = self.get_spot(&spot_id).ok_or(EngineError::NotFound(spot_id))?;
        let guard = rs.read().await;
        Ok(guard.reviews.iter().map(ReviewInfo::from).collect())
    }

    pub async fn get_review_images(&self, review_id: ReviewId) -> Result<Vec<ReviewImage>, EngineError> {
        let spot_id = self
            .get_spot_for_entity(&review_id)
            .ok_or(EngineError::NotFound(review_id))?;
        let rs = self.get_spot(&spot_id).ok_or(EngineError::NotFound(review_id))?;
        let guard = rs.read().await;
        guard
            .review(review_id)
            .map(|r| r.images.clone())
            .ok_or(EngineError::NotFound(review_id))
    }

    pub async fn get_reviews_by_user(&self, user_id: UserId) -> Vec<ReviewInfo> {
        let mut out = Vec::new();
        for rs in self.spot_snapshot() {
            let guard = rs.read().await;
            if let Some(review) = guard.review_by(user_id) {
                out.push(ReviewInfo::from(review));
            }
        }
        out.sort_by_key(|r| r.id);
        out
    }

    /// The spot owner sees every booking in full and a booker sees their
    /// own; everyone else only learns which dates are taken.
    pub async fn get_bookings_for_spot(
        &self,
        actor: Option<UserId>,
        spot_id: SpotId,
    ) -> Result<Vec<BookingInfo>, EngineError> {
        let rs = self.get_spot(&spot_id).ok_or(EngineError::NotFound(spot_id))?;
        let guard = rs.read().await;
        let actor = self.live_actor(actor);
        let is_owner = actor == Some(guard.owner_id);
        Ok(guard
            .bookings
            .iter()
            .map(|b| {
                if is_owner || actor == Some(b.user_id) {
                    BookingInfo::full(b)
                } else {
                    BookingInfo::redacted(b)
                }
            })
            .collect())
    }

    /// Bookings the actor made, across all spots, ordered by start date.
    pub async fn get_bookings_by_user(&self, actor: Option<UserId>) -> Result<Vec<BookingInfo>, EngineError> {
        let user_id = self
            .live_actor(actor)
            .ok_or(EngineError::Forbidden(super::DenyReason::AuthenticationRequired))?;
        let mut out = Vec::new();
        for rs in self.spot_snapshot() {
            let guard = rs.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.user_id == user_id)
                    .map(BookingInfo::full),
            );
        }
        out.sort_by_key(|b| (b.start, b.id));
        Ok(out)
    }
}
