use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::{future::BoxFuture, stream::StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;
use uuid::Uuid;

use crate::{
    clock::{Clock, elapsed_between},
    dao::{
        models::{
            AuthUser, BanEntity, ParticipantEntity, ParticipantStatus, ProfileEntity, RoomEntity,
            RoomPatch,
        },
        room_store::{
            Backend, ChangeEvent, ChangeFeed, ChangeKind, ChangeStream, ChannelStatus, FeedMessage,
            FeedRow, FeedTable, RoomStore,
        },
        storage::{StorageError, StorageResult},
    },
};

use crate::dao::room_store::auth::LocalAuth;

const FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum FeedItem {
    Change(Uuid, ChangeEvent),
    Status(Uuid, ChannelStatus),
}

/// Shared in-memory backend emulating the row store, change feed and procedures.
///
/// Every device in a simulation gets its own [`Backend`] through
/// [`MemoryRoomStore::backend_for`], all pointing at the same rows.
pub struct MemoryRoomStore {
    clock: Arc<dyn Clock>,
    rooms: DashMap<Uuid, RoomEntity>,
    participants: DashMap<Uuid, ParticipantEntity>,
    arrivals: DashMap<Uuid, u64>,
    next_arrival: AtomicU64,
    participant_index: DashMap<(Uuid, Uuid), Uuid>,
    bans: DashMap<(Uuid, Uuid), BanEntity>,
    profiles: DashMap<Uuid, ProfileEntity>,
    feed: broadcast::Sender<FeedItem>,
    active_feeds: Arc<DashMap<Uuid, usize>>,
    offline: AtomicBool,
    failing_writes: AtomicU32,
    room_writes: AtomicU64,
    touches: AtomicU64,
    sweeps: AtomicU64,
}

impl MemoryRoomStore {
    /// Create an empty backend stamping rows with `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        let (feed, _rx) = broadcast::channel(FEED_CAPACITY);
        Arc::new(Self {
            clock,
            rooms: DashMap::new(),
            participants: DashMap::new(),
            arrivals: DashMap::new(),
            next_arrival: AtomicU64::new(0),
            participant_index: DashMap::new(),
            bans: DashMap::new(),
            profiles: DashMap::new(),
            feed,
            active_feeds: Arc::new(DashMap::new()),
            offline: AtomicBool::new(false),
            failing_writes: AtomicU32::new(0),
            room_writes: AtomicU64::new(0),
            touches: AtomicU64::new(0),
            sweeps: AtomicU64::new(0),
        })
    }

    /// Build the backend bundle seen by one device signed in as `user`.
    pub fn backend_for(self: &Arc<Self>, user: Option<AuthUser>) -> (Backend, Arc<LocalAuth>) {
        if let Some(user) = &user {
            self.profiles
                .entry(user.id)
                .or_insert_with(|| ProfileEntity {
                    user_id: user.id,
                    display_name: user.email.clone(),
                    active_session: None,
                });
        }
        let auth = Arc::new(LocalAuth::new(user));
        let backend = Backend::new(Arc::new(self.clone()), Arc::new(self.clone()), auth.clone());
        (backend, auth)
    }

    /// Simulate a full outage: every call fails until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make the next `count` writes fail.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Push a transport status to every subscriber of `room_id`.
    pub fn emit_channel_status(&self, room_id: Uuid, status: ChannelStatus) {
        let _ = self.feed.send(FeedItem::Status(room_id, status));
    }

    /// Number of live change feed subscriptions for `room_id`.
    pub fn active_subscriptions(&self, room_id: Uuid) -> usize {
        self.active_feeds.get(&room_id).map(|count| *count).unwrap_or(0)
    }

    /// Successful room writes so far.
    pub fn room_write_count(&self) -> u64 {
        self.room_writes.load(Ordering::SeqCst)
    }

    /// Presence touches received so far.
    pub fn touch_count(&self) -> u64 {
        self.touches.load(Ordering::SeqCst)
    }

    /// Stale sweeps executed so far.
    pub fn sweep_count(&self) -> u64 {
        self.sweeps.load(Ordering::SeqCst)
    }

    /// Current server copy of a room.
    pub fn room(&self, room_id: Uuid) -> Option<RoomEntity> {
        self.rooms.get(&room_id).map(|room| room.clone())
    }

    /// Current server copy of every participant row of a room, in arrival order.
    pub fn participants_of(&self, room_id: Uuid) -> Vec<ParticipantEntity> {
        let mut rows: Vec<_> = self
            .participants
            .iter()
            .filter(|entry| entry.room_id == room_id)
            .map(|entry| entry.clone())
            .collect();
        rows.sort_by_key(|row| self.arrivals.get(&row.id).map_or(u64::MAX, |seq| *seq));
        rows
    }

    /// Current server copy of a profile.
    pub fn profile(&self, user_id: Uuid) -> Option<ProfileEntity> {
        self.profiles.get(&user_id).map(|profile| profile.clone())
    }

    /// Overwrite a room row without emitting feed events, for test setup.
    pub fn seed_room(&self, room: RoomEntity) {
        self.rooms.insert(room.id, room);
    }

    /// Rewind a participant's presence stamp, for stale sweep scenarios.
    pub fn set_last_seen(&self, participant_id: Uuid, at: std::time::SystemTime) {
        if let Some(mut row) = self.participants.get_mut(&participant_id) {
            row.last_seen_at = at;
        }
    }

    fn check_online(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable(
                "memory backend offline",
                io::Error::new(io::ErrorKind::NotConnected, "offline"),
            ));
        }
        Ok(())
    }

    fn check_write(&self) -> StorageResult<()> {
        self.check_online()?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::unavailable(
                "injected write failure",
                io::Error::new(io::ErrorKind::TimedOut, "write failed"),
            ));
        }
        Ok(())
    }

    fn publish(
        &self,
        room_id: Uuid,
        table: FeedTable,
        kind: ChangeKind,
        old: Option<FeedRow>,
        new: Option<FeedRow>,
    ) {
        let event = ChangeEvent {
            table,
            kind,
            old,
            new,
        };
        let _ = self.feed.send(FeedItem::Change(room_id, event));
    }

    fn do_update_room(&self, room_id: Uuid, patch: RoomPatch) -> StorageResult<Option<RoomEntity>> {
        self.check_write()?;
        let Some(mut entry) = self.rooms.get_mut(&room_id) else {
            return Ok(None);
        };
        let old = entry.clone();
        if let Some(status) = patch.status {
            entry.status = status;
        }
        if let Some(drawn) = patch.drawn_numbers {
            entry.drawn_numbers = drawn;
        }
        if let Some(round) = patch.current_round {
            entry.current_round = round;
        }
        entry.updated_at = patch.updated_at.unwrap_or_else(|| self.clock.now());
        let new = entry.clone();
        drop(entry);

        self.room_writes.fetch_add(1, Ordering::SeqCst);
        self.publish(
            room_id,
            FeedTable::Rooms,
            ChangeKind::Update,
            Some(FeedRow::Room(old)),
            Some(FeedRow::Room(new.clone())),
        );
        Ok(Some(new))
    }

    fn do_upsert_participant(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        status: ParticipantStatus,
    ) -> StorageResult<ParticipantEntity> {
        self.check_write()?;
        let now = self.clock.now();
        let mut inserted = false;
        let participant_id = *self
            .participant_index
            .entry((room_id, user_id))
            .or_insert_with(|| {
                inserted = true;
                Uuid::new_v4()
            });

        let (old, new) = {
            let mut row = self
                .participants
                .entry(participant_id)
                .or_insert_with(|| ParticipantEntity {
                    id: participant_id,
                    room_id,
                    user_id,
                    status,
                    profile_ref: Some(user_id.to_string()),
                    last_seen_at: now,
                });
            let old = row.clone();
            row.status = status;
            row.last_seen_at = now;
            (old, row.clone())
        };

        if inserted {
            self.arrivals.insert(
                participant_id,
                self.next_arrival.fetch_add(1, Ordering::SeqCst),
            );
            self.publish(
                room_id,
                FeedTable::Participants,
                ChangeKind::Insert,
                None,
                Some(FeedRow::Participant(new.clone())),
            );
        } else {
            self.publish(
                room_id,
                FeedTable::Participants,
                ChangeKind::Update,
                Some(FeedRow::Participant(old)),
                Some(FeedRow::Participant(new.clone())),
            );
        }
        Ok(new)
    }

    fn do_delete_participant(&self, participant_id: Uuid) -> StorageResult<bool> {
        self.check_write()?;
        Ok(self.remove_participant_row(participant_id))
    }

    fn do_cleanup(&self, room_id: Uuid, threshold: Duration) -> StorageResult<u64> {
        self.check_write()?;
        self.sweeps.fetch_add(1, Ordering::SeqCst);
        let now = self.clock.now();
        let stale: Vec<Uuid> = self
            .participants
            .iter()
            .filter(|row| {
                row.room_id == room_id && elapsed_between(row.last_seen_at, now) > threshold
            })
            .map(|row| row.id)
            .collect();

        let mut removed = 0;
        for id in stale {
            if self.remove_participant_row(id) {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(%room_id, removed, "swept stale participants");
        }
        Ok(removed)
    }

    fn remove_participant_row(&self, participant_id: Uuid) -> bool {
        let Some((_, row)) = self.participants.remove(&participant_id) else {
            return false;
        };
        self.arrivals.remove(&participant_id);
        self.participant_index.remove(&(row.room_id, row.user_id));
        self.publish(
            row.room_id,
            FeedTable::Participants,
            ChangeKind::Delete,
            Some(FeedRow::Participant(row)),
            None,
        );
        true
    }
}

/// Decrements the live subscription counter when the stream is dropped.
struct FeedGuard {
    room_id: Uuid,
    active: Arc<DashMap<Uuid, usize>>,
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        if let Some(mut count) = self.active.get_mut(&self.room_id) {
            *count = count.saturating_sub(1);
        }
    }
}

impl ChangeFeed for Arc<MemoryRoomStore> {
    fn subscribe(&self, room_id: Uuid) -> BoxFuture<'static, StorageResult<ChangeStream>> {
        let store = self.clone();
        Box::pin(async move {
            store.check_online()?;
            let mut receiver = store.feed.subscribe();
            *store.active_feeds.entry(room_id).or_insert(0) += 1;
            let guard = FeedGuard {
                room_id,
                active: store.active_feeds.clone(),
            };

            let stream = async_stream::stream! {
                let _guard = guard;
                yield FeedMessage::Status(ChannelStatus::Subscribed);
                loop {
                    match receiver.recv().await {
                        Ok(FeedItem::Change(target, event)) if target == room_id => {
                            yield FeedMessage::Change(event);
                        }
                        Ok(FeedItem::Status(target, status)) if target == room_id => {
                            yield FeedMessage::Status(status);
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => {
                            yield FeedMessage::Status(ChannelStatus::Closed);
                            break;
                        }
                    }
                }
            };
            Ok(stream.boxed())
        })
    }
}

impl RoomStore for Arc<MemoryRoomStore> {
    fn fetch_room(&self, room_id: Uuid) -> BoxFuture<'static, StorageResult<Option<RoomEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store.check_online()?;
            Ok(store.room(room_id))
        })
    }

    fn find_room_by_code(
        &self,
        code: String,
    ) -> BoxFuture<'static, StorageResult<Option<RoomEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store.check_online()?;
            let wanted = code.to_uppercase();
            Ok(store
                .rooms
                .iter()
                .find(|room| room.code == wanted)
                .map(|room| room.clone()))
        })
    }

    fn insert_room(&self, room: RoomEntity) -> BoxFuture<'static, StorageResult<RoomEntity>> {
        let store = self.clone();
        Box::pin(async move {
            store.check_write()?;
            if store.rooms.iter().any(|existing| existing.code == room.code) {
                return Err(StorageError::Conflict {
                    message: format!("room code `{}` already taken", room.code),
                });
            }
            let mut room = room;
            room.updated_at = store.clock.now();
            store.rooms.insert(room.id, room.clone());
            store.room_writes.fetch_add(1, Ordering::SeqCst);
            store.publish(
                room.id,
                FeedTable::Rooms,
                ChangeKind::Insert,
                None,
                Some(FeedRow::Room(room.clone())),
            );
            Ok(room)
        })
    }

    fn update_room(
        &self,
        room_id: Uuid,
        patch: RoomPatch,
    ) -> BoxFuture<'static, StorageResult<Option<RoomEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.do_update_room(room_id, patch) })
    }

    fn list_participants(
        &self,
        room_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ParticipantEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store.check_online()?;
            Ok(store.participants_of(room_id))
        })
    }

    fn find_participant(
        &self,
        room_id: Uuid,
        user_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store.check_online()?;
            let Some(id) = store.participant_index.get(&(room_id, user_id)).map(|id| *id) else {
                return Ok(None);
            };
            Ok(store.participants.get(&id).map(|row| row.clone()))
        })
    }

    fn list_memberships(
        &self,
        user_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ParticipantEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store.check_online()?;
            Ok(store
                .participants
                .iter()
                .filter(|row| row.user_id == user_id)
                .map(|row| row.clone())
                .collect())
        })
    }

    fn upsert_participant(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        status: ParticipantStatus,
    ) -> BoxFuture<'static, StorageResult<ParticipantEntity>> {
        let store = self.clone();
        Box::pin(async move { store.do_upsert_participant(room_id, user_id, status) })
    }

    fn update_participant_status(
        &self,
        participant_id: Uuid,
        status: ParticipantStatus,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store.check_write()?;
            let Some(mut row) = store.participants.get_mut(&participant_id) else {
                return Ok(None);
            };
            let old = row.clone();
            row.status = status;
            let new = row.clone();
            drop(row);
            store.publish(
                new.room_id,
                FeedTable::Participants,
                ChangeKind::Update,
                Some(FeedRow::Participant(old)),
                Some(FeedRow::Participant(new.clone())),
            );
            Ok(Some(new))
        })
    }

    fn delete_participant(&self, participant_id: Uuid) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.do_delete_participant(participant_id) })
    }

    fn find_ban(
        &self,
        room_id: Uuid,
        user_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<BanEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store.check_online()?;
            Ok(store.bans.get(&(room_id, user_id)).map(|ban| ban.clone()))
        })
    }

    fn increment_ban(
        &self,
        room_id: Uuid,
        user_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<BanEntity>> {
        let store = self.clone();
        Box::pin(async move {
            store.check_write()?;
            let ban = store
                .bans
                .entry((room_id, user_id))
                .and_modify(|ban| ban.rejection_count += 1)
                .or_insert_with(|| BanEntity {
                    room_id,
                    user_id,
                    rejection_count: 1,
                })
                .clone();
            Ok(ban)
        })
    }

    fn fetch_profile(
        &self,
        user_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<ProfileEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store.check_online()?;
            Ok(store.profile(user_id))
        })
    }

    fn claim_session(&self, user_id: Uuid, marker: String) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store.check_write()?;
            let mut profile = store
                .profiles
                .get_mut(&user_id)
                .ok_or_else(|| StorageError::not_found(format!("profile `{user_id}`")))?;
            profile.active_session = Some(marker);
            Ok(())
        })
    }

    fn touch_participant(
        &self,
        room_id: Uuid,
        user_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store.check_write()?;
            store.touches.fetch_add(1, Ordering::SeqCst);
            let now = store.clock.now();
            if let Some(id) = store.participant_index.get(&(room_id, user_id)).map(|id| *id) {
                if let Some(mut row) = store.participants.get_mut(&id) {
                    row.last_seen_at = now;
                }
            }
            Ok(())
        })
    }

    fn cleanup_stale_participants(
        &self,
        room_id: Uuid,
        threshold: Duration,
    ) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        Box::pin(async move { store.do_cleanup(room_id, threshold) })
    }
}
