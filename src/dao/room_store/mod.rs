mod auth;
/// Shared in-process backend for tests and offline play.
pub mod memory;
/// HTTP backend without push delivery.
#[cfg(feature = "rest-store")]
pub mod rest;

use std::{sync::Arc, time::Duration};

use futures::{future::BoxFuture, stream::BoxStream};
use tokio::sync::watch;
use uuid::Uuid;

pub use self::auth::LocalAuth;

use crate::dao::{
    models::{
        AuthUser, BanEntity, ParticipantEntity, ParticipantStatus, ProfileEntity, RoomEntity,
        RoomPatch,
    },
    storage::StorageResult,
};

/// Abstraction over the backend row store and its callable procedures.
pub trait RoomStore: Send + Sync {
    /// Room row by id.
    fn fetch_room(&self, room_id: Uuid) -> BoxFuture<'static, StorageResult<Option<RoomEntity>>>;
    /// Room row by its upper-case join code.
    fn find_room_by_code(&self, code: String)
    -> BoxFuture<'static, StorageResult<Option<RoomEntity>>>;
    /// Insert a new room; a taken code is a conflict.
    fn insert_room(&self, room: RoomEntity) -> BoxFuture<'static, StorageResult<RoomEntity>>;
    /// Patch a room. `None` when the row is gone.
    fn update_room(
        &self,
        room_id: Uuid,
        patch: RoomPatch,
    ) -> BoxFuture<'static, StorageResult<Option<RoomEntity>>>;
    /// Every participant row of a room, oldest first.
    fn list_participants(
        &self,
        room_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ParticipantEntity>>>;
    /// Row of `user_id` in `room_id`.
    fn find_participant(
        &self,
        room_id: Uuid,
        user_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>>;
    /// Rows of `user_id` across all rooms.
    fn list_memberships(
        &self,
        user_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ParticipantEntity>>>;
    /// Insert the `(room_id, user_id)` row or update its status in place.
    fn upsert_participant(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        status: ParticipantStatus,
    ) -> BoxFuture<'static, StorageResult<ParticipantEntity>>;
    /// Set the status of a row. `None` when the row is gone.
    fn update_participant_status(
        &self,
        participant_id: Uuid,
        status: ParticipantStatus,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>>;
    /// Delete a row, reporting whether it existed.
    fn delete_participant(&self, participant_id: Uuid) -> BoxFuture<'static, StorageResult<bool>>;
    /// Rejection counter of `user_id` in `room_id`.
    fn find_ban(
        &self,
        room_id: Uuid,
        user_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<BanEntity>>>;
    /// Create the counter at one or increment it.
    fn increment_ban(
        &self,
        room_id: Uuid,
        user_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<BanEntity>>;
    /// Public profile of a user.
    fn fetch_profile(&self, user_id: Uuid)
    -> BoxFuture<'static, StorageResult<Option<ProfileEntity>>>;
    /// Record `marker` as the device owning the user's session.
    fn claim_session(&self, user_id: Uuid, marker: String) -> BoxFuture<'static, StorageResult<()>>;
    /// Refresh the caller's presence timestamp on their participant row.
    fn touch_participant(&self, room_id: Uuid, user_id: Uuid)
    -> BoxFuture<'static, StorageResult<()>>;
    /// Delete participant rows of `room_id` not touched within `threshold`.
    fn cleanup_stale_participants(
        &self,
        room_id: Uuid,
        threshold: Duration,
    ) -> BoxFuture<'static, StorageResult<u64>>;
}

/// Table a change event originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedTable {
    /// `rooms` table.
    Rooms,
    /// `participants` table.
    Participants,
}

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Row created.
    Insert,
    /// Row modified.
    Update,
    /// Row removed.
    Delete,
}

/// Row payload carried by a change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedRow {
    /// A room row.
    Room(RoomEntity),
    /// A participant row.
    Participant(ParticipantEntity),
}

/// Single change delivered by the feed. Delivery is best-effort and unordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Table the row lives in.
    pub table: FeedTable,
    /// Insert, update or delete.
    pub kind: ChangeKind,
    /// Row before the change; absent for inserts.
    pub old: Option<FeedRow>,
    /// Row after the change; absent for deletes.
    pub new: Option<FeedRow>,
}

/// Transport status reported on a subscription channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Push delivery is live.
    Subscribed,
    /// The channel failed and will not deliver until resubscribed.
    Error,
    /// The server closed the channel.
    Closed,
}

/// Item yielded by a change feed subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    /// Channel status transition.
    Status(ChannelStatus),
    /// Row change.
    Change(ChangeEvent),
}

/// Stream of feed messages for one room. Dropping it unsubscribes.
pub type ChangeStream = BoxStream<'static, FeedMessage>;

/// Publish/subscribe channel delivering row changes for a room.
pub trait ChangeFeed: Send + Sync {
    /// Subscribe to room and participant changes for `room_id`.
    fn subscribe(&self, room_id: Uuid) -> BoxFuture<'static, StorageResult<ChangeStream>>;
}

/// Authentication service.
pub trait AuthProvider: Send + Sync {
    /// Signed-in user, if any.
    fn current_user(&self) -> BoxFuture<'static, StorageResult<Option<AuthUser>>>;
    /// End the auth session.
    fn sign_out(&self) -> BoxFuture<'static, StorageResult<()>>;
    /// Watch auth state changes.
    fn watch(&self) -> watch::Receiver<Option<AuthUser>>;
}

/// Bundle of the three collaborator interfaces the client consumes.
#[derive(Clone)]
pub struct Backend {
    /// Row store.
    pub rooms: Arc<dyn RoomStore>,
    /// Change feed.
    pub feed: Arc<dyn ChangeFeed>,
    /// Auth service.
    pub auth: Arc<dyn AuthProvider>,
}

impl Backend {
    /// Assemble a backend from its parts.
    pub fn new(
        rooms: Arc<dyn RoomStore>,
        feed: Arc<dyn ChangeFeed>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        Self { rooms, feed, auth }
    }
}
