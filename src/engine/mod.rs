mod availability;
mod conflict;
mod error;
mod guard;
mod lifecycle;
mod mutations;
mod queries;
mod validate;

pub use availability::{find_conflict, has_conflict, validate_stay, Conflict, DateRangeError};
pub use error::EngineError;
pub use guard::{authorize, Action, Decision, DenyReason, Resource};
pub use lifecycle::{lifecycle_state, Lifecycle};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedSpotState = Arc<RwLock<SpotState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Flush what we have before compaction or stats see the log.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("WAL flush failed for {} events: {e}", batch.len());
        }
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let append_err = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .err();
    // Flush even after an append error so half-written bytes don't leak
    // into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

pub struct Engine {
    pub(super) spots: DashMap<SpotId, SharedSpotState>,
    pub(super) users: DashMap<UserId, UserState>,
    /// username → id
    pub(super) usernames: DashMap<String, UserId>,
    /// lowercased email → id
    pub(super) emails: DashMap<String, UserId>,
    /// Reverse lookup: booking/review/image id → spot id
    pub(super) entity_to_spot: DashMap<Ulid, SpotId>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold this shared for their whole duration; compaction holds
    /// it exclusively so its snapshot can't miss an in-flight event.
    pub(super) write_gate: RwLock<()>,
}

/// Apply a spot-scoped event to a SpotState (caller holds the lock).
fn apply_to_spot(spot: &mut SpotState, event: &Event, entity_map: &DashMap<Ulid, SpotId>) {
    match event {
        Event::SpotUpdated { details, .. } => {
            spot.details = details.clone();
        }
        Event::SpotImageAdded { id, spot_id, url, preview } => {
            spot.images.push(SpotImage {
                id: *id,
                spot_id: *spot_id,
                url: url.clone(),
                preview: *preview,
            });
            entity_map.insert(*id, *spot_id);
        }
        Event::SpotImageRemoved { id, .. } => {
            spot.images.retain(|i| i.id != *id);
            entity_map.remove(id);
        }
        Event::ReviewPosted { id, spot_id, user_id, review, stars } => {
            spot.reviews.push(Review {
                id: *id,
                spot_id: *spot_id,
                user_id: *user_id,
                review: review.clone(),
                stars: *stars,
                images: Vec::new(),
            });
            entity_map.insert(*id, *spot_id);
        }
        Event::ReviewEdited { id, review, stars, .. } => {
            if let Some(r) = spot.review_mut(*id) {
                r.review = review.clone();
                r.stars = *stars;
            }
        }
        Event::ReviewDeleted { id, .. } => {
            if let Some(pos) = spot.reviews.iter().position(|r| r.id == *id) {
                let removed = spot.reviews.remove(pos);
                for image in &removed.images {
                    entity_map.remove(&image.id);
                }
            }
            entity_map.remove(id);
        }
        Event::ReviewImageAdded { id, spot_id, review_id, url } => {
            if let Some(r) = spot.review_mut(*review_id) {
                r.images.push(ReviewImage {
                    id: *id,
                    review_id: *review_id,
                    url: url.clone(),
                });
                entity_map.insert(*id, *spot_id);
            }
        }
        Event::ReviewImageRemoved { id, review_id, .. } => {
            if let Some(r) = spot.review_mut(*review_id) {
                r.images.retain(|i| i.id != *id);
            }
            entity_map.remove(id);
        }
        Event::BookingCreated { id, spot_id, user_id, stay } => {
            spot.insert_booking(Booking {
                id: *id,
                spot_id: *spot_id,
                user_id: *user_id,
                stay: *stay,
            });
            entity_map.insert(*id, *spot_id);
        }
        Event::BookingUpdated { id, stay, .. } => {
            // Re-insert to keep the start-date ordering.
            if let Some(mut booking) = spot.remove_booking(*id) {
                booking.stay = *stay;
                spot.insert_booking(booking);
            }
        }
        Event::BookingDeleted { id, .. } => {
            spot.remove_booking(*id);
            entity_map.remove(id);
        }
        // User and spot lifecycle events are handled at the DashMap level.
        Event::UserCreated { .. }
        | Event::UserDeleted { .. }
        | Event::SpotCreated { .. }
        | Event::SpotDeleted { .. } => {}
    }
}

/// Drop every index entry pointing at children of a spot that is going away.
fn unindex_spot(spot: &SpotState, entity_map: &DashMap<Ulid, SpotId>) {
    for image in &spot.images {
        entity_map.remove(&image.id);
    }
    for review in &spot.reviews {
        entity_map.remove(&review.id);
        for image in &review.images {
            entity_map.remove(&image.id);
        }
    }
    for booking in &spot.bookings {
        entity_map.remove(&booking.id);
    }
}

/// Remove a deleted user's bookings and reviews from a spot they don't own.
fn purge_user_from_spot(spot: &mut SpotState, user_id: UserId, entity_map: &DashMap<Ulid, SpotId>) {
    spot.bookings.retain(|b| {
        if b.user_id == user_id {
            entity_map.remove(&b.id);
            false
        } else {
            true
        }
    });
    spot.reviews.retain(|r| {
        if r.user_id == user_id {
            entity_map.remove(&r.id);
            for image in &r.images {
                entity_map.remove(&image.id);
            }
            false
        } else {
            true
        }
    });
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            spots: DashMap::new(),
            users: DashMap::new(),
            usernames: DashMap::new(),
            emails: DashMap::new(),
            entity_to_spot: DashMap::new(),
            wal_tx,
            write_gate: RwLock::new(()),
        };

        // Replay: we are the sole owner of these Arcs, so try_write
        // always succeeds instantly. Never use blocking_write here because
        // this runs inside an async context.
        for event in &events {
            match event {
                Event::UserDeleted { id } => {
                    engine.remove_user_entry(id);
                    let spot_ids: Vec<SpotId> = engine.spots.iter().map(|e| *e.key()).collect();
                    for spot_id in spot_ids {
                        let Some(rs) = engine.get_spot(&spot_id) else { continue };
                        let mut guard = rs.try_write().expect("replay: uncontended write");
                        if guard.owner_id == *id {
                            unindex_spot(&guard, &engine.entity_to_spot);
                            drop(guard);
                            engine.spots.remove(&spot_id);
                        } else {
                            purge_user_from_spot(&mut guard, *id, &engine.entity_to_spot);
                        }
                    }
                }
                Event::SpotDeleted { id } => {
                    if let Some((_, rs)) = engine.spots.remove(id) {
                        let guard = rs.try_read().expect("replay: uncontended read");
                        unindex_spot(&guard, &engine.entity_to_spot);
                    }
                }
                other => engine.apply_created(other),
            }
        }

        tracing::info!(
            "replayed {} events: {} users, {} spots",
            events.len(),
            engine.users.len(),
            engine.spots.len()
        );
        Ok(engine)
    }

    /// Apply create events and spot-scoped events during replay.
    fn apply_created(&self, event: &Event) {
        match event {
            Event::UserCreated { id, username, email, first_name, last_name, password_hash } => {
                self.insert_user_entry(UserState {
                    id: *id,
                    username: username.clone(),
                    email: email.clone(),
                    first_name: first_name.clone(),
                    last_name: last_name.clone(),
                    password_hash: password_hash.clone(),
                });
            }
            Event::SpotCreated { id, owner_id, details } => {
                let rs = SpotState::new(*id, *owner_id, details.clone());
                self.spots.insert(*id, Arc::new(RwLock::new(rs)));
            }
            other => {
                if let Some(spot_id) = event_spot_id(other)
                    && let Some(rs) = self.get_spot(&spot_id) {
                        let mut guard = rs.try_write().expect("replay: uncontended write");
                        apply_to_spot(&mut guard, other, &self.entity_to_spot);
                    }
            }
        }
    }

    pub(super) fn insert_user_entry(&self, user: UserState) {
        self.usernames.insert(user.username.clone(), user.id);
        self.emails.insert(user.email.to_lowercase(), user.id);
        self.users.insert(user.id, user);
    }

    pub(super) fn remove_user_entry(&self, id: &UserId) {
        if let Some((_, user)) = self.users.remove(id) {
            self.usernames.remove(&user.username);
            self.emails.remove(&user.email.to_lowercase());
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_spot(&self, id: &SpotId) -> Option<SharedSpotState> {
        self.spots.get(id).map(|e| e.value().clone())
    }

    pub fn get_spot_for_entity(&self, entity_id: &Ulid) -> Option<SpotId> {
        self.entity_to_spot.get(entity_id).map(|e| *e.value())
    }

    /// An actor id only counts while the user still exists.
    pub(super) fn live_actor(&self, actor: Option<UserId>) -> Option<UserId> {
        actor.filter(|id| self.users.contains_key(id))
    }

    /// WAL-append + apply in one call. State changes only after the event is durable.
    pub(super) async fn persist_and_apply(
        &self,
        spot: &mut SpotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_spot(spot, event, &self.entity_to_spot);
        Ok(())
    }

    /// Lookup entity → spot, get spot, acquire write lock.
    ///
    /// The entity may be gone by the time the lock is held; callers re-resolve
    /// it under the lock and let the guard report `NotFound`.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<SpotState>, EngineError> {
        let spot_id = self
            .get_spot_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let rs = self
            .get_spot(&spot_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let guard = rs.write_owned().await;
        if !self.spots.contains_key(&spot_id) {
            return Err(EngineError::NotFound(*entity_id));
        }
        Ok(guard)
    }

    pub(super) async fn spot_write(
        &self,
        spot_id: &SpotId,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<SpotState>, EngineError> {
        let rs = self.get_spot(spot_id).ok_or(EngineError::NotFound(*spot_id))?;
        let guard = rs.write_owned().await;
        // Deleters unregister the spot while holding this lock.
        if !self.spots.contains_key(spot_id) {
            return Err(EngineError::NotFound(*spot_id));
        }
        Ok(guard)
    }
}

/// Extract the spot id from a spot-scoped event.
fn event_spot_id(event: &Event) -> Option<SpotId> {
    match event {
        Event::SpotImageAdded { spot_id, .. }
        | Event::SpotImageRemoved { spot_id, .. }
        | Event::ReviewPosted { spot_id, .. }
        | Event::ReviewEdited { spot_id, .. }
        | Event::ReviewDeleted { spot_id, .. }
        | Event::ReviewImageAdded { spot_id, .. }
        | Event::ReviewImageRemoved { spot_id, .. }
        | Event::BookingCreated { spot_id, .. }
        | Event::BookingUpdated { spot_id, .. }
        | Event::BookingDeleted { spot_id, .. } => Some(*spot_id),
        Event::SpotUpdated { id, .. } => Some(*id),
        Event::UserCreated { .. }
        | Event::UserDeleted { .. }
        | Event::SpotCreated { .. }
        | Event::SpotDeleted { .. } => None,
    }
}
