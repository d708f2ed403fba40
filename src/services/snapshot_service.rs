use futures::try_join;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::ServiceError,
    services::realtime,
    state::{ClientSessionSnapshot, Participant, Room, RoomEvent, RoomTicket, SharedState},
};

/// Make `room_id` the active room, or clear it with `None`.
///
/// Switching tears the previous subscription and its timers down before the
/// new snapshot exists. Selecting the room that is already active is a no-op.
pub async fn set_room_id(state: &SharedState, room_id: Option<Uuid>) -> Option<RoomTicket> {
    let current = state.current_ticket().await;
    if let (Some(ticket), Some(wanted)) = (current, room_id)
        && ticket.room_id == wanted
    {
        return Some(ticket);
    }

    realtime::unsubscribe(state).await;
    state.deactivate_room().await;

    let room_id = room_id?;
    let user_id = match state.backend().auth.current_user().await {
        Ok(user) => user.map(|user| user.id),
        Err(err) => {
            warn!(error = %err, "could not resolve the current user");
            None
        }
    };
    let ticket = state.activate_room(room_id, user_id).await;
    state.device().set_last_room_id(room_id);
    info!(room_id = %room_id, "active room changed");
    Some(ticket)
}

/// Load the room row and its participants into a fresh snapshot.
///
/// Failures are recorded in [`ClientSessionSnapshot::last_error`] and leave
/// the room unset so the caller can offer a retry.
pub async fn bootstrap(state: &SharedState, room_id: Uuid) -> Option<ClientSessionSnapshot> {
    let ticket = set_room_id(state, Some(room_id)).await?;
    if let Err(err) = reconcile(state, ticket).await {
        debug!(room_id = %room_id, error = %err, "bootstrap left the snapshot empty");
    }
    state.snapshot().await
}

/// Re-fetch the room and its participants and merge them into the snapshot.
///
/// Returns `false` when `room_id` is not the active room or the fetch failed.
pub async fn refresh_participants(state: &SharedState, room_id: Uuid) -> bool {
    let Some(ticket) = state.current_ticket().await else {
        return false;
    };
    if ticket.room_id != room_id {
        debug!(room_id = %room_id, "refresh for an inactive room ignored");
        return false;
    }
    reconcile(state, ticket).await.is_ok()
}

/// Single reconciliation path shared by push events, poll ticks and manual refreshes.
///
/// The server lists are authoritative and replace the local ones wholesale.
pub(crate) async fn reconcile(state: &SharedState, ticket: RoomTicket) -> Result<(), ServiceError> {
    let Some(seq) = state
        .with_session(ticket, |active| active.issue_fetch())
        .await
    else {
        return Ok(());
    };

    let rooms = &state.backend().rooms;
    let fetched = try_join!(
        rooms.fetch_room(ticket.room_id),
        rooms.list_participants(ticket.room_id)
    );
    let (room, rows) = match fetched {
        Ok(fetched) => fetched,
        Err(err) => {
            warn!(room_id = %ticket.room_id, error = %err, "room refresh failed");
            let message = err.to_string();
            state
                .update_snapshot(ticket, |snapshot| snapshot.last_error = Some(message))
                .await;
            return Err(err.into());
        }
    };

    let rows: Vec<Participant> = rows.into_iter().map(Participant::from).collect();
    let room = room.map(Room::from);
    let applied = state
        .with_session(ticket, |active| {
            if !active.accept_fetch(seq) {
                return None;
            }
            let snapshot = &mut active.snapshot;
            let room_changed = snapshot.room != room;
            match room {
                Some(room) => {
                    snapshot.apply_room(room);
                    snapshot.last_error = None;
                }
                None => {
                    snapshot.room = None;
                    snapshot.last_error = Some(format!("room `{}` not found", ticket.room_id));
                }
            }
            let diff = snapshot.replace_participants(rows);
            let announce_left = snapshot.is_host();
            let left: Vec<Participant> = diff
                .left
                .into_iter()
                .filter(|p| announce_left && active.notified_left.insert(p.id))
                .collect();
            Some((room_changed, diff.joined, left))
        })
        .await
        .flatten();

    let Some((room_changed, joined, left)) = applied else {
        debug!(room_id = %ticket.room_id, "stale refresh result discarded");
        return Ok(());
    };

    let events = state.events();
    if room_changed {
        events.broadcast(RoomEvent::RoomUpdated {
            room_id: ticket.room_id,
        });
    }
    for participant in joined {
        events.broadcast(RoomEvent::ParticipantJoined(participant));
    }
    for participant in left {
        info!(room_id = %ticket.room_id, user_id = %participant.user_id, "participant left the table");
        events.broadcast(RoomEvent::ParticipantLeft(participant));
    }
    Ok(())
}
