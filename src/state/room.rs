use std::{collections::HashSet, time::Duration, time::SystemTime};

use uuid::Uuid;

use crate::dao::models::{
    ParticipantEntity, ParticipantStatus, RoomEntity, RoomStatus, WinningPatterns,
};

/// Runtime view of a room row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    /// Primary key of the room.
    pub id: Uuid,
    /// Short join code.
    pub code: String,
    /// Display name.
    pub name: String,
    /// User owning the room.
    pub host_id: Uuid,
    /// Lifecycle status.
    pub status: RoomStatus,
    /// Numbers drawn this round, in draw order and without duplicates.
    pub drawn_numbers: Vec<u8>,
    /// Last server write.
    pub updated_at: SystemTime,
    /// Seats available, host included.
    pub player_limit: u32,
    /// One-based round counter.
    pub current_round: u32,
    /// Announced number of rounds.
    pub rounds: u32,
    /// Prize pool in the smallest currency unit.
    pub prize_pool: u64,
    /// Patterns that win a prize.
    pub winning_patterns: WinningPatterns,
    /// Seconds between two draws.
    pub draw_interval_seconds: u32,
}

impl Room {
    /// Whether `user_id` hosts this room.
    pub fn is_host(&self, user_id: Uuid) -> bool {
        self.host_id == user_id
    }

    /// Draw interval, falling back to `default` when the row carries zero.
    pub fn draw_interval(&self, default: Duration) -> Duration {
        match self.draw_interval_seconds {
            0 => default,
            seconds => Duration::from_secs(u64::from(seconds)),
        }
    }

    /// Numbers in `1..=max` not drawn yet, ascending.
    pub fn remaining_numbers(&self, max: u8) -> Vec<u8> {
        let drawn: HashSet<u8> = self.drawn_numbers.iter().copied().collect();
        (1..=max).filter(|n| !drawn.contains(n)).collect()
    }

    /// Whether the room is still open to players.
    pub fn is_active(&self) -> bool {
        self.status != RoomStatus::Finished
    }
}

/// Drop out-of-range and repeated numbers while keeping draw order.
fn sanitize_drawn(numbers: Vec<u8>) -> Vec<u8> {
    let mut seen = HashSet::with_capacity(numbers.len());
    numbers
        .into_iter()
        .filter(|n| *n >= 1 && seen.insert(*n))
        .collect()
}

/// Runtime view of a participant row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// Primary key of the row.
    pub id: Uuid,
    /// Room the participant belongs to.
    pub room_id: Uuid,
    /// User behind the participant.
    pub user_id: Uuid,
    /// Admission status.
    pub status: ParticipantStatus,
    /// Public profile reference.
    pub profile_ref: Option<String>,
}

impl From<RoomEntity> for Room {
    fn from(value: RoomEntity) -> Self {
        Self {
            id: value.id,
            code: value.code,
            name: value.name,
            host_id: value.host_id,
            status: value.status,
            drawn_numbers: sanitize_drawn(value.drawn_numbers),
            updated_at: value.updated_at,
            player_limit: value.player_limit,
            current_round: value.current_round,
            rounds: value.rounds,
            prize_pool: value.prize_pool,
            winning_patterns: value.winning_patterns,
            draw_interval_seconds: value.draw_interval_seconds,
        }
    }
}

impl From<Room> for RoomEntity {
    fn from(value: Room) -> Self {
        Self {
            id: value.id,
            code: value.code,
            name: value.name,
            host_id: value.host_id,
            status: value.status,
            drawn_numbers: value.drawn_numbers,
            updated_at: value.updated_at,
            player_limit: value.player_limit,
            current_round: value.current_round,
            rounds: value.rounds,
            prize_pool: value.prize_pool,
            winning_patterns: value.winning_patterns,
            draw_interval_seconds: value.draw_interval_seconds,
        }
    }
}

impl From<ParticipantEntity> for Participant {
    fn from(value: ParticipantEntity) -> Self {
        Self {
            id: value.id,
            room_id: value.room_id,
            user_id: value.user_id,
            status: value.status,
            profile_ref: value.profile_ref,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(drawn: Vec<u8>) -> RoomEntity {
        RoomEntity {
            id: Uuid::new_v4(),
            code: "QWERTY".into(),
            name: "test".into(),
            host_id: Uuid::new_v4(),
            status: RoomStatus::Playing,
            drawn_numbers: drawn,
            updated_at: SystemTime::UNIX_EPOCH,
            player_limit: 10,
            current_round: 1,
            rounds: 1,
            prize_pool: 0,
            winning_patterns: WinningPatterns::default(),
            draw_interval_seconds: 0,
        }
    }

    #[test]
    fn conversion_drops_duplicates_and_zero_but_keeps_order() {
        let room = Room::from(entity(vec![12, 5, 12, 0, 7, 5]));
        assert_eq!(room.drawn_numbers, vec![12, 5, 7]);
    }

    #[test]
    fn remaining_numbers_excludes_drawn() {
        let room = Room::from(entity(vec![1, 3]));
        assert_eq!(room.remaining_numbers(5), vec![2, 4, 5]);
    }

    #[test]
    fn zero_interval_falls_back_to_default() {
        let mut room = Room::from(entity(vec![]));
        assert_eq!(
            room.draw_interval(Duration::from_secs(10)),
            Duration::from_secs(10)
        );
        room.draw_interval_seconds = 4;
        assert_eq!(
            room.draw_interval(Duration::from_secs(10)),
            Duration::from_secs(4)
        );
    }
}
