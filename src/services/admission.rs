use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::models::{ParticipantStatus, RoomStatus},
    error::ServiceError,
    services::{require_user, snapshot_service},
    state::{Mutation, MutationId, Participant, RoomEvent, RoomTicket, Screen, SharedState},
};

/// Ask to join `room_id` as the signed-in user.
///
/// `desired` is [`ParticipantStatus::Accepted`] only for trusted invite links.
/// An invited join into a full room falls back to a pending request. Returns
/// `Ok(None)` when the same join is already in flight.
pub async fn join(
    state: &SharedState,
    room_id: Uuid,
    desired: ParticipantStatus,
) -> Result<Option<Participant>, ServiceError> {
    join_inner(state, room_id, desired, false).await
}

/// Like [`join`], but first leaves any other active room the user still belongs to.
pub async fn join_replacing(
    state: &SharedState,
    room_id: Uuid,
    desired: ParticipantStatus,
) -> Result<Option<Participant>, ServiceError> {
    join_inner(state, room_id, desired, true).await
}

async fn join_inner(
    state: &SharedState,
    room_id: Uuid,
    desired: ParticipantStatus,
    replace_active: bool,
) -> Result<Option<Participant>, ServiceError> {
    if desired == ParticipantStatus::Rejected {
        return Err(ServiceError::InvalidInput(
            "cannot join with a rejected status".into(),
        ));
    }
    state.touch_interaction();
    let Some(_in_flight) = state.claim_in_flight(room_id) else {
        debug!(room_id = %room_id, "join already in flight");
        return Ok(None);
    };
    let user = require_user(state).await?;
    let rooms = &state.backend().rooms;

    if let Some(ban) = rooms.find_ban(room_id, user.id).await?
        && ban.rejection_count >= state.config().ban_threshold
    {
        info!(room_id = %room_id, user_id = %user.id, "banned user refused");
        return Err(ServiceError::Banned {
            rejections: ban.rejection_count,
        });
    }

    let Some(room) = rooms.fetch_room(room_id).await? else {
        return Err(ServiceError::NotFound(format!("room `{room_id}` not found")));
    };
    if room.status == RoomStatus::Finished {
        return Err(ServiceError::InvalidState("room already finished".into()));
    }
    if room.host_id == user.id {
        return Err(ServiceError::InvalidState(
            "the host does not join their own room".into(),
        ));
    }

    for membership in rooms.list_memberships(user.id).await? {
        if membership.room_id == room_id || !membership.status.is_active() {
            continue;
        }
        let other_active = matches!(
            rooms.fetch_room(membership.room_id).await,
            Ok(Some(other)) if other.status != RoomStatus::Finished
        );
        if !other_active {
            continue;
        }
        if !replace_active {
            return Err(ServiceError::AlreadyInRoom {
                room_id: membership.room_id,
            });
        }
        info!(room_id = %membership.room_id, "leaving previous room before joining");
        rooms.delete_participant(membership.id).await?;
    }

    let mut status = desired;
    if status == ParticipantStatus::Accepted {
        let accepted = rooms
            .list_participants(room_id)
            .await?
            .into_iter()
            .filter(|row| row.status == ParticipantStatus::Accepted && row.user_id != user.id)
            .count();
        if accepted as u64 + 1 >= u64::from(room.player_limit) {
            debug!(room_id = %room_id, "room full; invited join falls back to pending");
            status = ParticipantStatus::Pending;
        }
    }

    let row = rooms.upsert_participant(room_id, user.id, status).await?;
    info!(room_id = %room_id, user_id = %user.id, status = ?row.status, "joined room");
    snapshot_service::set_room_id(state, Some(room_id)).await;
    let _ = snapshot_service::refresh_participants(state, room_id).await;
    state.navigate(match row.status {
        ParticipantStatus::Pending => Screen::Pending { room_id },
        _ if room.status == RoomStatus::Lobby => Screen::Lobby { room_id },
        _ => Screen::Game { room_id },
    });
    Ok(Some(row.into()))
}

/// Admit a pending participant. Returns `Ok(None)` when already in flight.
pub async fn approve(
    state: &SharedState,
    participant_id: Uuid,
) -> Result<Option<Participant>, ServiceError> {
    let Some(_in_flight) = state.claim_in_flight(participant_id) else {
        debug!(participant_id = %participant_id, "approval already in flight");
        return Ok(None);
    };
    let (ticket, row) = host_target(state, participant_id).await?;
    match row.status {
        ParticipantStatus::Accepted => return Ok(Some(row)),
        ParticipantStatus::Rejected => {
            return Err(ServiceError::InvalidState(
                "rejected participants cannot be admitted".into(),
            ));
        }
        ParticipantStatus::Pending => {}
    }

    let capacity = state
        .update_snapshot(ticket, |snapshot| {
            snapshot
                .room
                .as_ref()
                .map(|room| (snapshot.accepted_count() as u64, room.player_limit))
        })
        .await
        .flatten();
    let Some((accepted, limit)) = capacity else {
        return Err(ServiceError::InvalidState("room changed".into()));
    };
    if accepted + 1 >= u64::from(limit) {
        return Err(ServiceError::RoomFull { limit });
    }

    set_status(state, ticket, row, ParticipantStatus::Accepted)
        .await
        .map(Some)
}

/// Refuse a pending participant and count the rejection towards a ban.
/// Returns `Ok(None)` when already in flight.
pub async fn reject(
    state: &SharedState,
    participant_id: Uuid,
) -> Result<Option<Participant>, ServiceError> {
    let Some(_in_flight) = state.claim_in_flight(participant_id) else {
        debug!(participant_id = %participant_id, "rejection already in flight");
        return Ok(None);
    };
    let (ticket, row) = host_target(state, participant_id).await?;
    match row.status {
        ParticipantStatus::Rejected => return Ok(Some(row)),
        ParticipantStatus::Accepted => {
            return Err(ServiceError::InvalidState(
                "accepted participants are kicked, not rejected".into(),
            ));
        }
        ParticipantStatus::Pending => {}
    }

    let ban = state
        .backend()
        .rooms
        .increment_ban(row.room_id, row.user_id)
        .await?;
    debug!(user_id = %row.user_id, rejections = ban.rejection_count, "rejection counted");

    set_status(state, ticket, row, ParticipantStatus::Rejected)
        .await
        .map(Some)
}

/// Remove an accepted participant from the table. Returns `false` when already in flight.
pub async fn kick(state: &SharedState, participant_id: Uuid) -> Result<bool, ServiceError> {
    let Some(_in_flight) = state.claim_in_flight(participant_id) else {
        return Ok(false);
    };
    let (ticket, row) = host_target(state, participant_id).await?;
    let user_id = row.user_id;
    let id = record(state, ticket, Mutation::Remove { previous: row }).await?;

    match state.backend().rooms.delete_participant(participant_id).await {
        Ok(_) => {
            state
                .with_session(ticket, |active| active.ledger.confirm(id).ok())
                .await;
            info!(room_id = %ticket.room_id, user_id = %user_id, "participant kicked");
            Ok(true)
        }
        Err(err) => {
            roll_back(state, ticket, id).await;
            warn!(room_id = %ticket.room_id, error = %err, "kick failed");
            Err(err.into())
        }
    }
}

/// Active room ticket and the listed participant, provided the caller hosts the room.
async fn host_target(
    state: &SharedState,
    participant_id: Uuid,
) -> Result<(RoomTicket, Participant), ServiceError> {
    state.touch_interaction();
    let Some((ticket, snapshot)) = state.ticketed_snapshot().await else {
        return Err(ServiceError::InvalidState("no active room".into()));
    };
    if !snapshot.is_host() {
        return Err(ServiceError::NotHost);
    }
    let row = snapshot
        .participant(participant_id)
        .cloned()
        .ok_or_else(|| ServiceError::NotFound(format!("participant `{participant_id}`")))?;
    Ok((ticket, row))
}

async fn record(
    state: &SharedState,
    ticket: RoomTicket,
    mutation: Mutation,
) -> Result<MutationId, ServiceError> {
    let recorded = state
        .with_session(ticket, |active| {
            let id = active.ledger.record(ticket.room_id, mutation.clone())?;
            mutation.apply(&mut active.snapshot);
            Ok::<_, ServiceError>(id)
        })
        .await;
    recorded.unwrap_or_else(|| Err(ServiceError::InvalidState("room changed".into())))
}

async fn roll_back(state: &SharedState, ticket: RoomTicket, id: MutationId) {
    state
        .with_session(ticket, |active| {
            if let Ok(tentative) = active.ledger.rollback(id) {
                tentative.mutation.revert(&mut active.snapshot);
            }
        })
        .await;
}

/// Move `row` to `next` optimistically, then write it through.
async fn set_status(
    state: &SharedState,
    ticket: RoomTicket,
    row: Participant,
    next: ParticipantStatus,
) -> Result<Participant, ServiceError> {
    let participant_id = row.id;
    let id = record(
        state,
        ticket,
        Mutation::SetStatus {
            previous: row,
            next,
        },
    )
    .await?;

    match state
        .backend()
        .rooms
        .update_participant_status(participant_id, next)
        .await
    {
        Ok(Some(updated)) => {
            state
                .with_session(ticket, |active| active.ledger.confirm(id).ok())
                .await;
            info!(participant_id = %participant_id, status = ?next, "admission updated");
            state.events().broadcast(RoomEvent::AdmissionChanged {
                participant_id,
                status: next,
            });
            Ok(updated.into())
        }
        Ok(None) => {
            roll_back(state, ticket, id).await;
            Err(ServiceError::NotFound(format!(
                "participant `{participant_id}`"
            )))
        }
        Err(err) => {
            roll_back(state, ticket, id).await;
            warn!(participant_id = %participant_id, error = %err, "admission write failed");
            Err(err.into())
        }
    }
}
