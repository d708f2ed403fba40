use std::collections::HashSet;

use indexmap::IndexMap;
use uuid::Uuid;

use crate::{
    dao::models::ParticipantStatus,
    state::room::{Participant, Room},
};

/// Connection state of the change-feed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RealtimeState {
    /// No subscription requested.
    #[default]
    Idle,
    /// Subscription requested, waiting for the transport.
    Subscribing,
    /// Push events are flowing.
    Subscribed,
    /// The transport reported an error; polling aggressively.
    Error,
    /// The transport closed the channel; polling aggressively.
    Closed,
}

impl RealtimeState {
    /// Whether the transport is degraded and the aggressive poll should run.
    pub fn is_degraded(self) -> bool {
        matches!(self, RealtimeState::Error | RealtimeState::Closed)
    }
}

/// In-memory client model of the active room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSessionSnapshot {
    /// Room this snapshot describes.
    pub room_id: Uuid,
    /// Last known room row, `None` until bootstrapped or when the fetch failed.
    pub room: Option<Room>,
    /// Participants awaiting host approval, in arrival order.
    pub pending: IndexMap<Uuid, Participant>,
    /// Participants admitted to the table, in arrival order.
    pub accepted: IndexMap<Uuid, Participant>,
    /// Status of the current user's own participant row.
    pub my_status: Option<ParticipantStatus>,
    /// Signed-in user the snapshot was built for.
    pub current_user_id: Option<Uuid>,
    /// Change-feed connection state.
    pub realtime: RealtimeState,
    /// Last soft failure, cleared on the next successful fetch.
    pub last_error: Option<String>,
}

/// Participants that appeared or disappeared between two participant lists.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParticipantDiff {
    /// Rows that were not listed before.
    pub joined: Vec<Participant>,
    /// Rows that were listed before and no longer exist.
    pub left: Vec<Participant>,
}

impl ClientSessionSnapshot {
    /// Empty snapshot for `room_id`.
    pub fn new(room_id: Uuid, current_user_id: Option<Uuid>) -> Self {
        Self {
            room_id,
            room: None,
            pending: IndexMap::new(),
            accepted: IndexMap::new(),
            my_status: None,
            current_user_id,
            realtime: RealtimeState::Idle,
            last_error: None,
        }
    }

    /// Whether the current user hosts the room.
    pub fn is_host(&self) -> bool {
        match (&self.room, self.current_user_id) {
            (Some(room), Some(user_id)) => room.is_host(user_id),
            _ => false,
        }
    }

    /// Number of accepted participants, host excluded.
    pub fn accepted_count(&self) -> usize {
        self.accepted.len()
    }

    /// Look up a listed participant in either list.
    pub fn participant(&self, participant_id: Uuid) -> Option<&Participant> {
        self.pending
            .get(&participant_id)
            .or_else(|| self.accepted.get(&participant_id))
    }

    /// Replace the room row with a fresh copy from the server.
    pub fn apply_room(&mut self, room: Room) {
        self.room = Some(room);
    }

    /// Replace both participant lists with `rows` and report the difference.
    ///
    /// Rejected rows are not listed; the current user's own row drives
    /// [`ClientSessionSnapshot::my_status`] whatever its status.
    pub fn replace_participants(&mut self, rows: Vec<Participant>) -> ParticipantDiff {
        let fresh_ids: HashSet<Uuid> = rows.iter().map(|p| p.id).collect();
        let previous_ids: HashSet<Uuid> = self
            .pending
            .keys()
            .chain(self.accepted.keys())
            .copied()
            .collect();

        let left = self
            .pending
            .values()
            .chain(self.accepted.values())
            .filter(|p| !fresh_ids.contains(&p.id))
            .cloned()
            .collect();

        let mut pending = IndexMap::new();
        let mut accepted = IndexMap::new();
        let mut joined = Vec::new();
        let mut my_status = None;

        for row in rows {
            if Some(row.user_id) == self.current_user_id {
                my_status = Some(row.status);
            }
            let target = match row.status {
                ParticipantStatus::Pending => &mut pending,
                ParticipantStatus::Accepted => &mut accepted,
                ParticipantStatus::Rejected => continue,
            };
            if !previous_ids.contains(&row.id) {
                joined.push(row.clone());
            }
            target.insert(row.id, row);
        }

        self.pending = pending;
        self.accepted = accepted;
        self.my_status = my_status;

        ParticipantDiff { joined, left }
    }

    /// Move a listed participant to `status`, returning its previous status.
    pub fn move_participant(
        &mut self,
        participant_id: Uuid,
        status: ParticipantStatus,
    ) -> Option<ParticipantStatus> {
        let mut row = self
            .pending
            .shift_remove(&participant_id)
            .or_else(|| self.accepted.shift_remove(&participant_id))?;
        let previous = row.status;
        row.status = status;
        if Some(row.user_id) == self.current_user_id {
            self.my_status = Some(status);
        }
        match status {
            ParticipantStatus::Pending => {
                self.pending.insert(participant_id, row);
            }
            ParticipantStatus::Accepted => {
                self.accepted.insert(participant_id, row);
            }
            ParticipantStatus::Rejected => {}
        }
        Some(previous)
    }

    /// Put back a participant removed or moved by a failed tentative mutation.
    pub fn restore_participant(&mut self, row: Participant) {
        self.pending.shift_remove(&row.id);
        self.accepted.shift_remove(&row.id);
        if Some(row.user_id) == self.current_user_id {
            self.my_status = Some(row.status);
        }
        match row.status {
            ParticipantStatus::Pending => {
                self.pending.insert(row.id, row);
            }
            ParticipantStatus::Accepted => {
                self.accepted.insert(row.id, row);
            }
            ParticipantStatus::Rejected => {}
        }
    }

    /// Drop a participant from both lists.
    pub fn remove_participant(&mut self, participant_id: Uuid) -> Option<Participant> {
        self.pending
            .shift_remove(&participant_id)
            .or_else(|| self.accepted.shift_remove(&participant_id))
    }
}
