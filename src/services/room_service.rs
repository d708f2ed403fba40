use rand::seq::IndexedRandom;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::{
        models::{RoomEntity, RoomPatch, RoomStatus, WinningPatterns},
        storage::StorageError,
    },
    error::ServiceError,
    services::{realtime, require_user, snapshot_service},
    state::{Room, RoomEvent, RoomTicket, Screen, SharedState, SignOutReason},
};

const ROOM_CODE_LENGTH: usize = 6;
const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const ROOM_CODE_ATTEMPTS: usize = 5;

/// Host-chosen settings of a new room.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    /// Display name.
    pub name: String,
    /// Seats available, host included.
    pub player_limit: u32,
    /// Number of rounds announced.
    pub rounds: u32,
    /// Prize pool in the smallest currency unit.
    pub prize_pool: u64,
    /// Patterns that win a prize.
    pub winning_patterns: WinningPatterns,
    /// Seconds between two draws, zero for the configured default.
    pub draw_interval_seconds: u32,
}

/// Create a room hosted by the signed-in user and make it the active room.
///
/// Any state persisted for a previous room is wiped first.
pub async fn create_room(state: &SharedState, settings: RoomSettings) -> Result<Room, ServiceError> {
    state.touch_interaction();
    let host = require_user(state).await?;
    let name = settings.name.trim();
    if name.is_empty() {
        return Err(ServiceError::InvalidInput("room name must not be empty".into()));
    }
    if settings.player_limit < 2 {
        return Err(ServiceError::InvalidInput(
            "a room needs at least two seats".into(),
        ));
    }
    if settings.rounds == 0 {
        return Err(ServiceError::InvalidInput(
            "a room needs at least one round".into(),
        ));
    }

    snapshot_service::set_room_id(state, None).await;
    state.device().clear_room_state();

    let mut attempt = 0;
    let row = loop {
        attempt += 1;
        let entity = RoomEntity {
            id: Uuid::new_v4(),
            code: generate_room_code(),
            name: name.to_owned(),
            host_id: host.id,
            status: RoomStatus::Lobby,
            drawn_numbers: Vec::new(),
            updated_at: state.now(),
            player_limit: settings.player_limit,
            current_round: 1,
            rounds: settings.rounds,
            prize_pool: settings.prize_pool,
            winning_patterns: settings.winning_patterns,
            draw_interval_seconds: settings.draw_interval_seconds,
        };
        match state.backend().rooms.insert_room(entity).await {
            Ok(row) => break row,
            Err(StorageError::Conflict { message }) if attempt < ROOM_CODE_ATTEMPTS => {
                debug!(attempt, %message, "room code collision; retrying");
            }
            Err(err) => return Err(err.into()),
        }
    };

    info!(room_id = %row.id, code = %row.code, "room created");
    snapshot_service::bootstrap(state, row.id).await;
    state.navigate(Screen::Lobby { room_id: row.id });
    Ok(row.into())
}

fn generate_room_code() -> String {
    let mut rng = rand::rng();
    (0..ROOM_CODE_LENGTH)
        .filter_map(|_| ROOM_CODE_ALPHABET.choose(&mut rng).map(|c| *c as char))
        .collect()
}

/// Look a room up by its join code.
pub async fn find_room_by_code(state: &SharedState, code: &str) -> Result<Room, ServiceError> {
    let code = code.trim().to_uppercase();
    if code.len() != ROOM_CODE_LENGTH {
        return Err(ServiceError::InvalidInput(format!(
            "room codes have {ROOM_CODE_LENGTH} characters"
        )));
    }
    state
        .backend()
        .rooms
        .find_room_by_code(code.clone())
        .await?
        .map(Room::from)
        .ok_or_else(|| ServiceError::NotFound(format!("room `{code}`")))
}

/// Move the room from the lobby into play.
pub async fn start_game(state: &SharedState) -> Result<Room, ServiceError> {
    let (ticket, room) = hosted_room(state).await?;
    if room.status != RoomStatus::Lobby {
        return Err(ServiceError::InvalidState(format!(
            "cannot start a game from {:?}",
            room.status
        )));
    }
    state.device().clear_round_state();
    let patch = RoomPatch {
        status: Some(RoomStatus::Playing),
        updated_at: Some(state.now()),
        ..RoomPatch::default()
    };
    let room = write_room(state, ticket, patch).await?;
    state.navigate(Screen::Game {
        room_id: ticket.room_id,
    });
    info!(room_id = %ticket.room_id, "game started");
    Ok(room)
}

/// Start the next round: empty draw list, next round number, fresh round caches.
pub async fn new_round(state: &SharedState) -> Result<Room, ServiceError> {
    let (ticket, room) = hosted_room(state).await?;
    if room.status == RoomStatus::Lobby {
        return Err(ServiceError::InvalidState("the game has not started".into()));
    }
    if room.current_round >= room.rounds {
        return Err(ServiceError::InvalidState("every round was played".into()));
    }
    let patch = RoomPatch {
        status: Some(RoomStatus::Playing),
        drawn_numbers: Some(Vec::new()),
        current_round: Some(room.current_round + 1),
        updated_at: Some(state.now()),
    };
    let room = write_room(state, ticket, patch).await?;
    state.device().clear_round_state();
    info!(room_id = %ticket.room_id, round = room.current_round, "new round started");
    Ok(room)
}

/// Close the room for good.
pub async fn finish_game(state: &SharedState) -> Result<Room, ServiceError> {
    let (ticket, room) = hosted_room(state).await?;
    if room.status == RoomStatus::Finished {
        return Ok(room);
    }
    let patch = RoomPatch {
        status: Some(RoomStatus::Finished),
        updated_at: Some(state.now()),
        ..RoomPatch::default()
    };
    let room = write_room(state, ticket, patch).await?;
    info!(room_id = %ticket.room_id, "game finished");
    Ok(room)
}

/// Stop automatic draws on this device.
pub fn pause_draws(state: &SharedState) {
    state.device().set_paused(true);
}

/// Resume automatic draws on this device.
pub fn resume_draws(state: &SharedState) {
    state.device().set_paused(false);
}

/// Record that the current round has a winner, which stops draws on this device.
pub async fn record_winner(state: &SharedState) -> Result<u32, ServiceError> {
    let round = state
        .snapshot()
        .await
        .and_then(|snapshot| snapshot.room)
        .map(|room| room.current_round)
        .ok_or_else(|| ServiceError::InvalidState("no room loaded".into()))?;
    state.device().set_winner_round(round);
    info!(round, "winner recorded");
    Ok(round)
}

/// Mark a drawn number on the player's card, returning the marked set.
pub async fn mark_number(state: &SharedState, number: u8) -> Result<Vec<u8>, ServiceError> {
    state.touch_interaction();
    let room = state
        .snapshot()
        .await
        .and_then(|snapshot| snapshot.room)
        .ok_or_else(|| ServiceError::InvalidState("no room loaded".into()))?;
    if !room.drawn_numbers.contains(&number) {
        return Err(ServiceError::InvalidInput(format!(
            "number {number} has not been drawn"
        )));
    }
    let mut marked = state.device().marked_numbers();
    if !marked.contains(&number) {
        marked.push(number);
        state.device().set_marked_numbers(&marked);
    }
    Ok(marked)
}

/// Remember a prize claimed this round. Returns `false` when it was already claimed.
pub fn claim_prize(state: &SharedState, prize: &str) -> bool {
    let mut claimed = state.device().claimed_prizes();
    if claimed.iter().any(|p| p == prize) {
        return false;
    }
    claimed.push(prize.to_owned());
    state.device().set_claimed_prizes(&claimed);
    true
}

/// Leave the active room for good on this device.
///
/// Deletes the caller's participant row when possible, tears the subscription
/// down, wipes every persisted room key together and blocks auto-resume.
/// Backend failures are logged; the local exit always completes.
pub async fn hard_exit(state: &SharedState) {
    let room_id = match state.current_ticket().await {
        Some(ticket) => Some(ticket.room_id),
        None => state.device().last_room_id(),
    };

    if let Some(room_id) = room_id {
        match state.backend().auth.current_user().await {
            Ok(Some(user)) => {
                let rooms = &state.backend().rooms;
                match rooms.find_participant(room_id, user.id).await {
                    Ok(Some(row)) => {
                        if let Err(err) = rooms.delete_participant(row.id).await {
                            warn!(room_id = %room_id, error = %err, "could not delete own participant row");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(room_id = %room_id, error = %err, "could not look up own participant row");
                    }
                }
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "could not resolve the current user"),
        }
    }

    realtime::unsubscribe(state).await;
    snapshot_service::set_room_id(state, None).await;
    state.device().clear_room_state();
    state.device().set_no_resume_marker(state.now());
    state.navigate(Screen::Home);
    info!(room_id = ?room_id, "left room");
}

/// Publish this device's session marker on the user's profile.
pub async fn claim_session(state: &SharedState) -> Result<String, ServiceError> {
    let user = require_user(state).await?;
    let marker = state.device().session_marker();
    state
        .backend()
        .rooms
        .claim_session(user.id, marker.clone())
        .await?;
    debug!(user_id = %user.id, "session claimed");
    Ok(marker)
}

/// End the session: cancel every loop, sign out and show the signed-out screen.
///
/// The teardown runs on its own task so a timer loop requesting the sign-out
/// can be cancelled by it.
pub async fn sign_out(state: &SharedState, reason: SignOutReason) {
    let state = state.clone();
    let teardown = tokio::spawn(async move {
        state.shutdown().await;
        if let Err(err) = state.backend().auth.sign_out().await {
            warn!(error = %err, "sign-out request failed");
        }
        state.navigate(Screen::SignedOut);
        state.events().broadcast(RoomEvent::SignedOut { reason });
        info!(?reason, "signed out");
    });
    if let Err(err) = teardown.await {
        warn!(error = %err, "sign-out teardown did not complete");
    }
}

async fn hosted_room(state: &SharedState) -> Result<(RoomTicket, Room), ServiceError> {
    state.touch_interaction();
    let Some((ticket, snapshot)) = state.ticketed_snapshot().await else {
        return Err(ServiceError::InvalidState("no active room".into()));
    };
    if !snapshot.is_host() {
        return Err(ServiceError::NotHost);
    }
    let room = snapshot
        .room
        .ok_or_else(|| ServiceError::InvalidState("room not loaded".into()))?;
    Ok((ticket, room))
}

/// Write `patch`, then fold the returned row into the snapshot through a refresh.
async fn write_room(
    state: &SharedState,
    ticket: RoomTicket,
    patch: RoomPatch,
) -> Result<Room, ServiceError> {
    let row = state
        .backend()
        .rooms
        .update_room(ticket.room_id, patch)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("room `{}`", ticket.room_id)))?;
    if let Err(err) = snapshot_service::reconcile(state, ticket).await {
        debug!(room_id = %ticket.room_id, error = %err, "refresh after room write failed");
    }
    Ok(row.into())
}
