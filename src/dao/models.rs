use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Lifecycle of a room as stored by the backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    /// Host is gathering players; no numbers are drawn.
    Lobby,
    /// Numbers are being drawn for the current round.
    Playing,
    /// The room is closed.
    Finished,
}

/// Admission status of a participant row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    /// Waiting for the host's decision.
    Pending,
    /// Admitted to the table.
    Accepted,
    /// Refused by the host; sticky for this room.
    Rejected,
}

impl ParticipantStatus {
    /// Whether the status still grants a seat or a pending claim on one.
    pub fn is_active(self) -> bool {
        matches!(self, ParticipantStatus::Pending | ParticipantStatus::Accepted)
    }
}

/// Winning patterns enabled for a room.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WinningPatterns {
    /// Any complete row.
    pub line: bool,
    /// Any complete column.
    pub column: bool,
    /// Either diagonal.
    pub diagonal: bool,
    /// The four corners.
    pub corners: bool,
    /// Every cell on the card.
    pub full_house: bool,
}

/// Room row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomEntity {
    /// Primary key of the room.
    pub id: Uuid,
    /// Short join code shared with players.
    pub code: String,
    /// Display name chosen by the host.
    pub name: String,
    /// User owning the room.
    pub host_id: Uuid,
    /// Current lifecycle status.
    pub status: RoomStatus,
    /// Numbers drawn this round, in draw order.
    pub drawn_numbers: Vec<u8>,
    /// Last time the row was written; the only coordination signal between hosts.
    #[serde(with = "epoch_millis")]
    pub updated_at: SystemTime,
    /// Seats available, host included.
    pub player_limit: u32,
    /// One-based round currently being played.
    pub current_round: u32,
    /// Total rounds announced for the room.
    pub rounds: u32,
    /// Prize pool in the smallest currency unit.
    pub prize_pool: u64,
    /// Patterns that win a prize.
    pub winning_patterns: WinningPatterns,
    /// Seconds between two draws.
    pub draw_interval_seconds: u32,
}

/// Partial update applied to a room row. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomPatch {
    /// New status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RoomStatus>,
    /// Full replacement for the drawn list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drawn_numbers: Option<Vec<u8>>,
    /// New round counter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_round: Option<u32>,
    /// Timestamp to record; backends stamp their own clock when absent.
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "epoch_millis::option",
        default
    )]
    pub updated_at: Option<SystemTime>,
}

/// Participant row, unique per `(room_id, user_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantEntity {
    /// Primary key of the participant row.
    pub id: Uuid,
    /// Room the participant belongs to.
    pub room_id: Uuid,
    /// User behind the participant.
    pub user_id: Uuid,
    /// Admission status.
    pub status: ParticipantStatus,
    /// Reference to the public profile, when the user has one.
    pub profile_ref: Option<String>,
    /// Last presence heartbeat.
    #[serde(with = "epoch_millis")]
    pub last_seen_at: SystemTime,
}

/// Per-room rejection counter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BanEntity {
    /// Room the counter applies to.
    pub room_id: Uuid,
    /// Rejected user.
    pub user_id: Uuid,
    /// Number of host rejections so far.
    pub rejection_count: u32,
}

/// Public profile of a user, carrying the device currently owning the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileEntity {
    /// Owner of the profile.
    pub user_id: Uuid,
    /// Name shown to other players.
    pub display_name: String,
    /// Marker of the device that last claimed the session.
    pub active_session: Option<String>,
}

/// Authenticated user as reported by the auth service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthUser {
    /// Stable user identifier.
    pub id: Uuid,
    /// Login email.
    pub email: String,
}

/// Serde adapter storing timestamps as milliseconds since the Unix epoch.
pub mod epoch_millis {
    use std::time::SystemTime;

    use serde::{Deserialize, Deserializer, Serializer};

    use crate::clock::{from_millis, to_millis};

    /// Serialize a timestamp as epoch milliseconds.
    pub fn serialize<S: Serializer>(value: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(to_millis(*value))
    }

    /// Deserialize a timestamp from epoch milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SystemTime, D::Error> {
        u64::deserialize(deserializer).map(from_millis)
    }

    /// Same encoding for optional timestamps.
    pub mod option {
        use std::time::SystemTime;

        use serde::{Deserialize, Deserializer, Serializer};

        use crate::clock::{from_millis, to_millis};

        /// Serialize an optional timestamp as epoch milliseconds.
        pub fn serialize<S: Serializer>(
            value: &Option<SystemTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(instant) => serializer.serialize_some(&to_millis(*instant)),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional timestamp from epoch milliseconds.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<SystemTime>, D::Error> {
            Ok(Option::<u64>::deserialize(deserializer)?.map(from_millis))
        }
    }
}
