use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};

use crate::auth;
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_stay, enforce, today};
use super::guard::{authorize, Action, DenyReason, Resource};
use super::{purge_user_from_spot, unindex_spot, validate, Engine, EngineError, SharedSpotState, WalCommand};

/// After `enforce` allowed a mutation the actor is known to be present.
fn signed_in(actor: Option<UserId>) -> Result<UserId, EngineError> {
    actor.ok_or(EngineError::Forbidden(DenyReason::AuthenticationRequired))
}

impl Engine {
    // ── Users ────────────────────────────────────────────────

    pub async fn create_user(
        &self,
        id: UserId,
        username: String,
        email: String,
        first_name: String,
        last_name: String,
        password: String,
    ) -> Result<UserInfo, EngineError> {
        let _gate = self.write_gate.read().await;
        validate::signup(&username, &email, &first_name, &last_name, &password)?;
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("user {id}")));
        }

        // Reserve both unique keys up front so two sign-ups can't race past
        // each other; undo the reservation on any later failure.
        let email_key = email.to_lowercase();
        match self.usernames.entry(username.clone()) {
            Entry::Occupied(_) => {
                return Err(EngineError::AlreadyExists("user with that username".into()));
            }
            Entry::Vacant(v) => {
                v.insert(id);
            }
        }
        match self.emails.entry(email_key.clone()) {
            Entry::Occupied(_) => {
                self.usernames.remove(&username);
                return Err(EngineError::AlreadyExists("user with that email".into()));
            }
            Entry::Vacant(v) => {
                v.insert(id);
            }
        }

        let result = self
            .persist_user(id, username.clone(), email, first_name, last_name, password)
            .await;
        if result.is_err() {
            self.usernames.remove(&username);
            self.emails.remove(&email_key);
        }
        result
    }

    async fn persist_user(
        &self,
        id: UserId,
        username: String,
        email: String,
        first_name: String,
        last_name: String,
        password: String,
    ) -> Result<UserInfo, EngineError> {
        let password_hash = tokio::task::spawn_blocking(move || auth::hash_password(&password))
            .await
            .map_err(|e| EngineError::Internal(format!("password hashing task: {e}")))?
            .ok_or_else(|| EngineError::Internal("password hashing failed".into()))?;

        let user = UserState {
            id,
            username,
            email,
            first_name,
            last_name,
            password_hash,
        };
        let event = Event::UserCreated {
            id,
            username: user.username.clone(),
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            password_hash: user.password_hash.clone(),
        };
        self.wal_append(&event).await?;
        let info = UserInfo::from(&user);
        self.insert_user_entry(user);
        Ok(info)
    }

    /// Users may only delete themselves. Their spots go with them, as do
    /// their bookings and reviews on other people's spots.
    ///
    /// Holds the write gate exclusively: a mutation by this user that already
    /// passed `live_actor` must land before the cascade sweeps, never after.
    pub async fn delete_user(&self, actor: Option<UserId>, id: UserId) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        if !self.users.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        match self.live_actor(actor) {
            None => return Err(EngineError::Forbidden(DenyReason::AuthenticationRequired)),
            Some(a) if a != id => return Err(EngineError::Forbidden(DenyReason::NotResourceOwner)),
            Some(_) => {}
        }

        self.wal_append(&Event::UserDeleted { id }).await?;
        // From here on the id no longer passes `live_actor`, so any mutation
        // that locks a spot after us sees an anonymous actor.
        self.remove_user_entry(&id);

        let spot_ids: Vec<SpotId> = self.spots.iter().map(|e| *e.key()).collect();
        for spot_id in spot_ids {
            let Some(rs) = self.get_spot(&spot_id) else { continue };
            let mut guard = rs.write().await;
            if guard.owner_id == id {
                unindex_spot(&guard, &self.entity_to_spot);
                self.spots.remove(&spot_id);
            } else {
                purge_user_from_spot(&mut guard, id, &self.entity_to_spot);
            }
        }
        Ok(())
    }

    /// Log in with a username or email. Returns the user on success.
    pub async fn verify_credentials(&self, credential: &str, password: &str) -> Result<UserInfo, EngineError> {
        let id = self
            .usernames
            .get(credential)
            .or_else(|| self.emails.get(&credential.to_lowercase()))
            .map(|e| *e.value());
        let Some(user) = id.and_then(|id| self.users.get(&id).map(|u| u.value().clone())) else {
            return Err(EngineError::InvalidCredentials);
        };

        let hash = user.password_hash.clone();
        let password = password.to_string();
        let ok = tokio::task::spawn_blocking(move || auth::verify_password(&password, &hash))
            .await
            .map_err(|e| EngineError::Internal(format!("password check task: {e}")))?;
        if ok {
            Ok(UserInfo::from(&user))
        } else {
            Err(EngineError::InvalidCredentials)
        }
    }

    // ── Spots ────────────────────────────────────────────────

    pub async fn create_spot(
        &self,
        actor: Option<UserId>,
        id: SpotId,
        details: SpotDetails,
    ) -> Result<SpotInfo, EngineError> {
        let _gate = self.write_gate.read().await;
        let actor = self.live_actor(actor);
        enforce(authorize(actor, Action::Create, Resource::Spot(None), today()), id)?;
        let owner_id = signed_in(actor)?;
        validate::spot_details(&details)?;
        if self.spots.len() >= MAX_SPOTS {
            return Err(EngineError::LimitExceeded("too many spots"));
        }
        if self.spots.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("spot {id}")));
        }

        let event = Event::SpotCreated { id, owner_id, details: details.clone() };
        self.wal_append(&event).await?;
        let rs = SpotState::new(id, owner_id, details);
        let info = SpotInfo::from(&rs);
        self.spots.insert(id, Arc::new(RwLock::new(rs)));
        Ok(info)
    }

    pub async fn update_spot(
        &self,
        actor: Option<UserId>,
        id: SpotId,
        patch: SpotPatch,
    ) -> Result<SpotInfo, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.spot_write(&id).await?;
        let actor = self.live_actor(actor);
        enforce(authorize(actor, Action::Update, Resource::Spot(Some(&guard)), today()), id)?;

        let details = patch.apply_to(&guard.details);
        validate::spot_details(&details)?;
        let event = Event::SpotUpdated { id, details };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(SpotInfo::from(&*guard))
    }

    /// Deletes the spot with its images, reviews and bookings.
    pub async fn delete_spot(&self, actor: Option<UserId>, id: SpotId) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let guard = self.spot_write(&id).await?;
        let actor = self.live_actor(actor);
        enforce(authorize(actor, Action::Delete, Resource::Spot(Some(&guard)), today()), id)?;

        self.wal_append(&Event::SpotDeleted { id }).await?;
        unindex_spot(&guard, &self.entity_to_spot);
        // Unregister while still holding the lock; waiters re-check on entry.
        self.spots.remove(&id);
        Ok(())
    }

    // ── Spot images ──────────────────────────────────────────

    pub async fn add_spot_image(
        &self,
        actor: Option<UserId>,
        id: ImageId,
        spot_id: SpotId,
        url: String,
        preview: bool,
    ) -> Result<SpotImage, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.spot_write(&spot_id).await?;
        let actor = self.live_actor(actor);
        let resource = Resource::SpotImage { spot: &guard, image: None };
        enforce(authorize(actor, Action::Create, resource, today()), spot_id)?;
        validate::url(&url)?;
        if guard.images.len() >= MAX_SPOT_IMAGES {
            return Err(EngineError::LimitExceeded("too many images on spot"));
        }
        if self.entity_to_spot.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("image {id}")));
        }

        let event = Event::SpotImageAdded { id, spot_id, url: url.clone(), preview };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(SpotImage { id, spot_id, url, preview })
    }

    pub async fn remove_spot_image(&self, actor: Option<UserId>, id: ImageId) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let actor = self.live_actor(actor);
        let resource = Resource::SpotImage { spot: &guard, image: guard.image(id) };
        enforce(authorize(actor, Action::Delete, resource, today()), id)?;

        let event = Event::SpotImageRemoved { id, spot_id: guard.id };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Reviews ──────────────────────────────────────────────

    pub async fn create_review(
        &self,
        actor: Option<UserId>,
        id: ReviewId,
        spot_id: SpotId,
        review: String,
        stars: i64,
    ) -> Result<ReviewInfo, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.spot_write(&spot_id).await?;
        let actor = self.live_actor(actor);
        let resource = Resource::Review { spot: &guard, review: None };
        enforce(authorize(actor, Action::Create, resource, today()), spot_id)?;
        let user_id = signed_in(actor)?;
        let stars = validate::review(&review, stars)?;
        if self.entity_to_spot.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("review {id}")));
        }

        let event = Event::ReviewPosted { id, spot_id, user_id, review, stars };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .review(id)
            .map(ReviewInfo::from)
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn update_review(
        &self,
        actor: Option<UserId>,
        id: ReviewId,
        review: Option<String>,
        stars: Option<i64>,
    ) -> Result<ReviewInfo, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let actor = self.live_actor(actor);
        let resource = Resource::Review { spot: &guard, review: guard.review(id) };
        enforce(authorize(actor, Action::Update, resource, today()), id)?;

        let current = guard.review(id).ok_or(EngineError::NotFound(id))?;
        let text = review.unwrap_or_else(|| current.review.clone());
        let stars = validate::review(&text, stars.unwrap_or(i64::from(current.stars)))?;
        let event = Event::ReviewEdited { id, spot_id: guard.id, review: text, stars };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .review(id)
            .map(ReviewInfo::from)
            .ok_or(EngineError::NotFound(id))
    }

    /// Deletes the review and its images.
    pub async fn delete_review(&self, actor: Option<UserId>, id: ReviewId) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let actor = self.live_actor(actor);
        let resource = Resource::Review { spot: &guard, review: guard.review(id) };
        enforce(authorize(actor, Action::Delete, resource, today()), id)?;

        let event = Event::ReviewDeleted { id, spot_id: guard.id };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Review images ────────────────────────────────────────

    pub async fn add_review_image(
        &self,
        actor: Option<UserId>,
        id: ImageId,
        review_id: ReviewId,
        url: String,
    ) -> Result<ReviewImage, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.resolve_entity_write(&review_id).await?;
        let actor = self.live_actor(actor);
        let review = guard.review(review_id).ok_or(EngineError::NotFound(review_id))?;
        let resource = Resource::ReviewImage { review, image: None };
        enforce(authorize(actor, Action::Create, resource, today()), review_id)?;
        validate::url(&url)?;
        if self.entity_to_spot.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("image {id}")));
        }

        let event = Event::ReviewImageAdded { id, spot_id: guard.id, review_id, url: url.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(ReviewImage { id, review_id, url })
    }

    pub async fn remove_review_image(&self, actor: Option<UserId>, id: ImageId) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let actor = self.live_actor(actor);
        let (review, image) = guard.review_image(id).ok_or(EngineError::NotFound(id))?;
        let review_id = review.id;
        let resource = Resource::ReviewImage { review, image: Some(image) };
        enforce(authorize(actor, Action::Delete, resource, today()), id)?;

        let event = Event::ReviewImageRemoved { id, spot_id: guard.id, review_id };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Guard, stay rules, conflict check and write all happen under the
    /// spot's write lock, so two overlapping requests can't both succeed.
    pub async fn create_booking(
        &self,
        actor: Option<UserId>,
        id: BookingId,
        spot_id: SpotId,
        stay: Stay,
    ) -> Result<BookingInfo, EngineError> {
        self.create_booking_on(actor, id, spot_id, stay, today()).await
    }

    pub(super) async fn create_booking_on(
        &self,
        actor: Option<UserId>,
        id: BookingId,
        spot_id: SpotId,
        stay: Stay,
        today: NaiveDate,
    ) -> Result<BookingInfo, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.spot_write(&spot_id).await?;
        let actor = self.live_actor(actor);
        let resource = Resource::Booking { spot: &guard, booking: None };
        enforce(authorize(actor, Action::Create, resource, today), spot_id)?;
        let user_id = signed_in(actor)?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_SPOT {
            return Err(EngineError::LimitExceeded("too many bookings on spot"));
        }
        if self.entity_to_spot.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("booking {id}")));
        }
        check_stay(&guard, &stay, None, today)?;

        let event = Event::BookingCreated { id, spot_id, user_id, stay };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(BookingInfo::full(&Booking { id, spot_id, user_id, stay }))
    }

    /// Move a booking. Unset ends keep their current value.
    pub async fn update_booking(
        &self,
        actor: Option<UserId>,
        id: BookingId,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<BookingInfo, EngineError> {
        self.update_booking_on(actor, id, start, end, today()).await
    }

    pub(super) async fn update_booking_on(
        &self,
        actor: Option<UserId>,
        id: BookingId,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Result<BookingInfo, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let actor = self.live_actor(actor);
        let current = guard.booking(id).cloned();
        let resource = Resource::Booking { spot: &guard, booking: current.as_ref() };
        enforce(authorize(actor, Action::Update, resource, today), id)?;
        let mut booking = current.ok_or(EngineError::NotFound(id))?;

        let stay = Stay::new(
            start.unwrap_or(booking.stay.start),
            end.unwrap_or(booking.stay.end),
        );
        check_stay(&guard, &stay, Some(id), today)?;

        let event = Event::BookingUpdated { id, spot_id: guard.id, stay };
        self.persist_and_apply(&mut guard, &event).await?;
        booking.stay = stay;
        Ok(BookingInfo::full(&booking))
    }

    /// Cancel a booking that hasn't started yet.
    pub async fn delete_booking(&self, actor: Option<UserId>, id: BookingId) -> Result<(), EngineError> {
        self.delete_booking_on(actor, id, today()).await
    }

    pub(super) async fn delete_booking_on(
        &self,
        actor: Option<UserId>,
        id: BookingId,
        today: NaiveDate,
    ) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let actor = self.live_actor(actor);
        let resource = Resource::Booking { spot: &guard, booking: guard.booking(id) };
        enforce(authorize(actor, Action::Delete, resource, today), id)?;

        let event = Event::BookingDeleted { id, spot_id: guard.id };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;

        let mut events: Vec<Event> = self
            .users
            .iter()
            .map(|u| Event::UserCreated {
                id: u.id,
                username: u.username.clone(),
                email: u.email.clone(),
                first_name: u.first_name.clone(),
                last_name: u.last_name.clone(),
                password_hash: u.password_hash.clone(),
            })
            .collect();

        let spots: Vec<SharedSpotState> = self.spots.iter().map(|e| e.value().clone()).collect();
        let mut seen = HashSet::new();
        for rs in spots {
            let guard = rs.read().await;
            if !seen.insert(guard.id) {
                continue;
            }
            emit_spot(&guard, &mut events);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// The minimal event sequence that rebuilds one spot.
fn emit_spot(spot: &SpotState, events: &mut Vec<Event>) {
    events.push(Event::SpotCreated {
        id: spot.id,
        owner_id: spot.owner_id,
        details: spot.details.clone(),
    });
    for image in &spot.images {
        events.push(Event::SpotImageAdded {
            id: image.id,
            spot_id: spot.id,
            url: image.url.clone(),
            preview: image.preview,
        });
    }
    for review in &spot.reviews {
        events.push(Event::ReviewPosted {
            id: review.id,
            spot_id: spot.id,
            user_id: review.user_id,
            review: review.review.clone(),
            stars: review.stars,
        });
        for image in &review.images {
            events.push(Event::ReviewImageAdded {
                id: image.id,
                spot_id: spot.id,
                review_id: review.id,
                url: image.url.clone(),
            });
        }
    }
    for booking in &spot.bookings {
        events.push(Event::BookingCreated {
            id: booking.id,
            spot_id: spot.id,
            user_id: booking.user_id,
            stay: booking.stay,
        });
    }
}
