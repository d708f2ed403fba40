//! Optimistic local mutations awaiting server confirmation.
//!
//! Every optimistic change is recorded under an id before the write is sent.
//! The caller then either confirms the id once the backend accepted the write
//! or rolls it back, which reverts the change on the snapshot.

use std::time::SystemTime;

use indexmap::IndexMap;
use uuid::Uuid;

use crate::{
    dao::models::ParticipantStatus,
    error::LedgerError,
    state::{room::Participant, snapshot::ClientSessionSnapshot},
};

/// Identifier of a tentative mutation.
pub type MutationId = Uuid;

/// Local change applied ahead of the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// A number appended to the drawn list.
    AppendDraw {
        /// Number drawn.
        number: u8,
        /// Timestamp written alongside the number.
        stamped_at: SystemTime,
        /// Room timestamp before the draw.
        previous_updated_at: SystemTime,
    },
    /// A participant moved to another admission status.
    SetStatus {
        /// Row as it was before the move.
        previous: Participant,
        /// Status applied.
        next: ParticipantStatus,
    },
    /// A participant removed from the table.
    Remove {
        /// Row as it was before the removal.
        previous: Participant,
    },
}

impl Mutation {
    /// Key used to refuse two overlapping mutations.
    fn target(&self) -> String {
        match self {
            Mutation::AppendDraw { .. } => "draw".to_owned(),
            Mutation::SetStatus { previous, .. } | Mutation::Remove { previous } => {
                previous.id.to_string()
            }
        }
    }

    /// Apply the change to `snapshot`.
    pub fn apply(&self, snapshot: &mut ClientSessionSnapshot) {
        match self {
            Mutation::AppendDraw {
                number, stamped_at, ..
            } => {
                if let Some(room) = snapshot.room.as_mut() {
                    if !room.drawn_numbers.contains(number) {
                        room.drawn_numbers.push(*number);
                    }
                    room.updated_at = *stamped_at;
                }
            }
            Mutation::SetStatus { previous, next } => {
                snapshot.move_participant(previous.id, *next);
            }
            Mutation::Remove { previous } => {
                snapshot.remove_participant(previous.id);
            }
        }
    }

    /// Undo the change on `snapshot`.
    ///
    /// A snapshot refreshed from the server in the meantime is left alone for
    /// the draw, since the server list replaced the optimistic one wholesale.
    pub fn revert(&self, snapshot: &mut ClientSessionSnapshot) {
        match self {
            Mutation::AppendDraw {
                number,
                stamped_at,
                previous_updated_at,
            } => {
                if let Some(room) = snapshot.room.as_mut()
                    && room.updated_at == *stamped_at
                {
                    room.drawn_numbers.retain(|n| n != number);
                    room.updated_at = *previous_updated_at;
                }
            }
            Mutation::SetStatus { previous, .. } | Mutation::Remove { previous } => {
                snapshot.restore_participant(previous.clone());
            }
        }
    }
}

/// A recorded mutation.
#[derive(Debug, Clone)]
pub struct Tentative {
    /// Unique identifier of the mutation.
    pub id: MutationId,
    /// Room the mutation applies to.
    pub room_id: Uuid,
    /// The change itself.
    pub mutation: Mutation,
}

/// Book of mutations applied locally but not yet confirmed.
#[derive(Debug, Default)]
pub struct TentativeLedger {
    pending: IndexMap<MutationId, Tentative>,
}

impl TentativeLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `mutation` for `room_id`, refusing it when the same target is pending.
    pub fn record(&mut self, room_id: Uuid, mutation: Mutation) -> Result<MutationId, LedgerError> {
        let target = mutation.target();
        if self
            .pending
            .values()
            .any(|t| t.room_id == room_id && t.mutation.target() == target)
        {
            return Err(LedgerError::AlreadyPending { target });
        }
        let id = Uuid::new_v4();
        self.pending.insert(
            id,
            Tentative {
                id,
                room_id,
                mutation,
            },
        );
        Ok(id)
    }

    /// The backend accepted the write; forget the mutation.
    pub fn confirm(&mut self, id: MutationId) -> Result<Tentative, LedgerError> {
        self.pending
            .shift_remove(&id)
            .ok_or(LedgerError::Unknown(id))
    }

    /// The backend refused the write; hand the mutation back so it can be reverted.
    pub fn rollback(&mut self, id: MutationId) -> Result<Tentative, LedgerError> {
        self.pending
            .shift_remove(&id)
            .ok_or(LedgerError::Unknown(id))
    }

    /// Drop every mutation recorded for another room than `room_id`.
    pub fn retain_room(&mut self, room_id: Option<Uuid>) {
        self.pending.retain(|_, t| Some(t.room_id) == room_id);
    }

    /// Number of mutations awaiting an outcome.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        dao::models::{RoomStatus, WinningPatterns},
        state::room::Room,
    };

    fn snapshot_with_room(drawn: Vec<u8>) -> ClientSessionSnapshot {
        let mut snapshot = ClientSessionSnapshot::new(Uuid::nil(), None);
        snapshot.apply_room(Room {
            id: Uuid::nil(),
            code: "ABCDEF".into(),
            name: "room".into(),
            host_id: Uuid::nil(),
            status: RoomStatus::Playing,
            drawn_numbers: drawn,
            updated_at: SystemTime::UNIX_EPOCH,
            player_limit: 4,
            current_round: 1,
            rounds: 1,
            prize_pool: 0,
            winning_patterns: WinningPatterns::default(),
            draw_interval_seconds: 10,
        });
        snapshot
    }

    fn draw(number: u8) -> Mutation {
        Mutation::AppendDraw {
            number,
            stamped_at: SystemTime::UNIX_EPOCH + Duration::from_secs(10),
            previous_updated_at: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn second_draw_in_same_room_is_refused_while_pending() {
        let mut ledger = TentativeLedger::new();
        let room = Uuid::new_v4();
        ledger.record(room, draw(3)).unwrap();

        let err = ledger.record(room, draw(4)).unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyPending { .. }));
        assert!(ledger.record(Uuid::new_v4(), draw(4)).is_ok());
    }

    #[test]
    fn confirm_and_rollback_remove_the_entry() {
        let mut ledger = TentativeLedger::new();
        let id = ledger.record(Uuid::nil(), draw(3)).unwrap();
        assert!(ledger.confirm(id).is_ok());
        assert_eq!(ledger.rollback(id).unwrap_err(), LedgerError::Unknown(id));
        assert!(ledger.is_empty());
    }

    #[test]
    fn draw_apply_then_revert_restores_snapshot() {
        let mut snapshot = snapshot_with_room(vec![5, 12]);
        let before = snapshot.clone();
        let mutation = draw(7);

        mutation.apply(&mut snapshot);
        assert_eq!(snapshot.room.as_ref().unwrap().drawn_numbers, vec![5, 12, 7]);

        mutation.revert(&mut snapshot);
        assert_eq!(snapshot, before);
    }

    #[test]
    fn revert_leaves_refreshed_room_alone() {
        let mut snapshot = snapshot_with_room(vec![5, 12]);
        let mutation = draw(7);
        mutation.apply(&mut snapshot);

        let room = snapshot.room.as_mut().unwrap();
        room.drawn_numbers = vec![5, 12, 7];
        room.updated_at = SystemTime::UNIX_EPOCH + Duration::from_secs(11);

        mutation.revert(&mut snapshot);
        assert_eq!(snapshot.room.unwrap().drawn_numbers, vec![5, 12, 7]);
    }

    #[test]
    fn retain_room_discards_other_rooms() {
        let mut ledger = TentativeLedger::new();
        let kept = Uuid::new_v4();
        ledger.record(kept, draw(1)).unwrap();
        ledger.record(Uuid::new_v4(), draw(2)).unwrap();

        ledger.retain_room(Some(kept));
        assert_eq!(ledger.len(), 1);
        ledger.retain_room(None);
        assert!(ledger.is_empty());
    }
}
