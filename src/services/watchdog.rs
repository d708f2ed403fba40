//! Session resume watchdog.
//!
//! Each tick maps the persisted room hint and the server-confirmed role of the
//! user onto a screen. Backend failures never stop a tick: they count as "no
//! role", after one delayed recheck while a room screen is shown.

use tokio::{task::AbortHandle, time::sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    clock::elapsed_between,
    dao::models::{AuthUser, ParticipantStatus, RoomStatus},
    services::{realtime, room_service, snapshot_service},
    state::{Room, Screen, SharedState, SignOutReason},
};

/// What a watchdog tick concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// A newer tick started; this one stopped early.
    Superseded,
    /// Nobody is signed in.
    NoSession,
    /// The session was ended.
    SignedOut(SignOutReason),
    /// The current screen is still valid.
    Stayed(Screen),
    /// A previous room was restored onto this screen.
    Restored(Screen),
    /// Room state was wiped and the home screen shown.
    Cleared,
}

macro_rules! bail_if_superseded {
    ($state:expr, $run:expr) => {
        if !$state.is_watchdog_run_current($run) {
            debug!(run = $run, "watchdog run superseded");
            return WatchdogOutcome::Superseded;
        }
    };
}

/// Run one reconciliation pass.
pub async fn tick(state: &SharedState) -> WatchdogOutcome {
    let run = state.next_watchdog_run();

    let user = match state.backend().auth.current_user().await {
        Ok(Some(user)) => user,
        Ok(None) => {
            state.navigate(Screen::SignedOut);
            return WatchdogOutcome::NoSession;
        }
        Err(err) => {
            warn!(error = %err, "could not resolve the current user");
            return WatchdogOutcome::Stayed(state.screen());
        }
    };
    bail_if_superseded!(state, run);

    let idle = elapsed_between(state.last_interaction(), state.now());
    if idle >= state.config().inactivity_timeout {
        info!(?idle, "signing out after inactivity");
        if state.current_ticket().await.is_some() || state.device().last_room_id().is_some() {
            room_service::hard_exit(state).await;
        }
        room_service::sign_out(state, SignOutReason::Inactivity).await;
        return WatchdogOutcome::SignedOut(SignOutReason::Inactivity);
    }

    match state.backend().rooms.fetch_profile(user.id).await {
        Ok(Some(profile)) => {
            if let Some(claimed) = profile.active_session
                && claimed != state.device().session_marker()
            {
                bail_if_superseded!(state, run);
                info!(user_id = %user.id, "session claimed by another device");
                room_service::sign_out(state, SignOutReason::SessionConflict).await;
                return WatchdogOutcome::SignedOut(SignOutReason::SessionConflict);
            }
        }
        Ok(None) => {}
        Err(err) => debug!(error = %err, "profile check skipped"),
    }
    bail_if_superseded!(state, run);

    let screen = state.screen();
    if screen.is_room_critical() {
        let tracked = match screen.room_id() {
            Some(room_id) => Some(room_id),
            None => state.current_ticket().await.map(|ticket| ticket.room_id),
        };
        if let Some(room_id) = tracked {
            return check_live_room(state, run, &user, room_id, screen).await;
        }
    }

    if screen == Screen::Home {
        if state.device().no_resume_marker().is_some() {
            return WatchdogOutcome::Stayed(screen);
        }
        if let Some(room_id) = state.device().last_room_id() {
            return restore(state, run, &user, room_id).await;
        }
    }
    WatchdogOutcome::Stayed(screen)
}

/// Spawn the watchdog timer. It stops by itself once the session ends.
pub async fn spawn_watchdog(state: &SharedState) -> AbortHandle {
    let task_state = state.clone();
    let handle = tokio::spawn(async move {
        loop {
            sleep(task_state.config().watchdog_interval).await;
            match tick(&task_state).await {
                WatchdogOutcome::SignedOut(_) | WatchdogOutcome::NoSession => break,
                outcome => debug!(?outcome, "watchdog tick"),
            }
        }
    });
    let abort = handle.abort_handle();
    state.register_loop(handle).await;
    abort
}

/// Confirm that the room behind a room screen is still alive and the user
/// still has a role in it. A negative or failed check is repeated once after
/// a delay before the room state is cleared.
async fn check_live_room(
    state: &SharedState,
    run: u64,
    user: &AuthUser,
    room_id: Uuid,
    screen: Screen,
) -> WatchdogOutcome {
    let mut verdict = lookup_role(state, user, room_id).await;
    bail_if_superseded!(state, run);
    if !matches!(verdict, Verdict::Role(_)) {
        sleep(state.config().finish_recheck_delay).await;
        bail_if_superseded!(state, run);
        verdict = lookup_role(state, user, room_id).await;
        bail_if_superseded!(state, run);
    }

    match verdict {
        Verdict::Role(next) => {
            if next != screen {
                info!(room_id = %room_id, ?next, "room screen updated");
                state.navigate(next);
            }
            WatchdogOutcome::Stayed(next)
        }
        Verdict::NoRole | Verdict::Unknown => {
            info!(room_id = %room_id, "room finished or no role left");
            clear(state).await
        }
    }
}

/// Bring the user back into the room persisted by a previous session.
async fn restore(state: &SharedState, run: u64, user: &AuthUser, room_id: Uuid) -> WatchdogOutcome {
    let verdict = lookup_role(state, user, room_id).await;
    bail_if_superseded!(state, run);

    let screen = match verdict {
        Verdict::Role(Screen::Blocked { .. }) | Verdict::NoRole | Verdict::Unknown => {
            info!(room_id = %room_id, "nothing to resume");
            return clear(state).await;
        }
        Verdict::Role(screen) => screen,
    };

    snapshot_service::bootstrap(state, room_id).await;
    if let Err(err) = realtime::subscribe(state, room_id).await {
        warn!(room_id = %room_id, error = %err, "could not subscribe after resume");
    }
    info!(room_id = %room_id, ?screen, "session resumed");
    state.navigate(screen);
    WatchdogOutcome::Restored(screen)
}

/// Server-confirmed standing of the user in a room.
enum Verdict {
    /// The room is active and this is the screen for the user's role.
    Role(Screen),
    /// The room is finished or gone, or the user has no row in it.
    NoRole,
    /// A lookup failed.
    Unknown,
}

async fn lookup_role(state: &SharedState, user: &AuthUser, room_id: Uuid) -> Verdict {
    let room: Room = match state.backend().rooms.fetch_room(room_id).await {
        Ok(Some(row)) if row.status != RoomStatus::Finished => row.into(),
        Ok(_) => return Verdict::NoRole,
        Err(err) => {
            warn!(room_id = %room_id, error = %err, "room check failed");
            return Verdict::Unknown;
        }
    };
    let in_room = match room.status {
        RoomStatus::Lobby => Screen::Lobby { room_id },
        _ => Screen::Game { room_id },
    };
    if room.is_host(user.id) {
        return Verdict::Role(in_room);
    }
    match state.backend().rooms.find_participant(room_id, user.id).await {
        Ok(Some(row)) => Verdict::Role(match row.status {
            ParticipantStatus::Accepted => in_room,
            ParticipantStatus::Pending => Screen::Pending { room_id },
            ParticipantStatus::Rejected => Screen::Blocked { room_id },
        }),
        Ok(None) => Verdict::NoRole,
        Err(err) => {
            warn!(room_id = %room_id, error = %err, "participant check failed");
            Verdict::Unknown
        }
    }
}

async fn clear(state: &SharedState) -> WatchdogOutcome {
    realtime::unsubscribe(state).await;
    snapshot_service::set_room_id(state, None).await;
    state.device().clear_room_state();
    state.navigate(Screen::Home);
    WatchdogOutcome::Cleared
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration, time::SystemTime};

    use super::*;
    use crate::{
        clock::ManualClock,
        config::SyncConfig,
        dao::{
            local::DeviceStore,
            models::{RoomEntity, WinningPatterns},
            room_store::{AuthProvider, LocalAuth, RoomStore, memory::MemoryRoomStore},
        },
        state::ClientState,
    };

    struct Device {
        store: Arc<MemoryRoomStore>,
        state: SharedState,
        clock: Arc<ManualClock>,
        auth: Arc<LocalAuth>,
        user: AuthUser,
    }

    fn device() -> Device {
        let clock = Arc::new(ManualClock::new(SystemTime::UNIX_EPOCH));
        let store = MemoryRoomStore::new(clock.clone());
        let user = AuthUser {
            id: Uuid::new_v4(),
            email: "player@example.com".into(),
        };
        let (backend, auth) = store.backend_for(Some(user.clone()));
        let state = ClientState::new(
            backend,
            SyncConfig::default(),
            DeviceStore::in_memory(),
            clock.clone(),
        );
        Device {
            store,
            state,
            clock,
            auth,
            user,
        }
    }

    fn room(host_id: Uuid, status: RoomStatus) -> RoomEntity {
        RoomEntity {
            id: Uuid::new_v4(),
            code: "WATCH1".into(),
            name: "watch".into(),
            host_id,
            status,
            drawn_numbers: vec![],
            updated_at: SystemTime::UNIX_EPOCH,
            player_limit: 8,
            current_round: 1,
            rounds: 1,
            prize_pool: 0,
            winning_patterns: WinningPatterns::default(),
            draw_interval_seconds: 10,
        }
    }

    #[tokio::test]
    async fn restores_an_accepted_player_into_the_game() {
        let d = device();
        let room = room(Uuid::new_v4(), RoomStatus::Playing);
        d.store.seed_room(room.clone());
        d.store
            .upsert_participant(room.id, d.user.id, ParticipantStatus::Accepted)
            .await
            .unwrap();
        d.state.device().set_last_room_id(room.id);

        let outcome = tick(&d.state).await;

        assert_eq!(outcome, WatchdogOutcome::Restored(Screen::Game { room_id: room.id }));
        assert_eq!(d.state.screen(), Screen::Game { room_id: room.id });
        assert!(d.state.snapshot().await.unwrap().room.is_some());
        d.state.shutdown().await;
    }

    #[tokio::test]
    async fn restores_the_host_into_the_lobby() {
        let d = device();
        let room = room(d.user.id, RoomStatus::Lobby);
        d.store.seed_room(room.clone());
        d.state.device().set_last_room_id(room.id);

        assert_eq!(
            tick(&d.state).await,
            WatchdogOutcome::Restored(Screen::Lobby { room_id: room.id })
        );
        d.state.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_player_is_not_restored() {
        let d = device();
        let room = room(Uuid::new_v4(), RoomStatus::Lobby);
        d.store.seed_room(room.clone());
        d.store
            .upsert_participant(room.id, d.user.id, ParticipantStatus::Rejected)
            .await
            .unwrap();
        d.state.device().set_last_room_id(room.id);

        assert_eq!(tick(&d.state).await, WatchdogOutcome::Cleared);
        assert_eq!(d.state.device().last_room_id(), None);
    }

    #[tokio::test]
    async fn no_resume_marker_skips_restoration() {
        let d = device();
        let room = room(d.user.id, RoomStatus::Lobby);
        d.store.seed_room(room.clone());
        d.state.device().set_last_room_id(room.id);
        d.state.device().set_no_resume_marker(SystemTime::UNIX_EPOCH);

        assert_eq!(tick(&d.state).await, WatchdogOutcome::Stayed(Screen::Home));
    }

    #[tokio::test(start_paused = true)]
    async fn finished_room_is_confirmed_before_leaving() {
        let d = device();
        let room = room(Uuid::new_v4(), RoomStatus::Playing);
        d.store.seed_room(room.clone());
        d.store
            .upsert_participant(room.id, d.user.id, ParticipantStatus::Accepted)
            .await
            .unwrap();
        d.state.device().set_last_room_id(room.id);
        tick(&d.state).await;

        let mut finished = room.clone();
        finished.status = RoomStatus::Finished;
        d.store.seed_room(finished);
        let started = tokio::time::Instant::now();

        assert_eq!(tick(&d.state).await, WatchdogOutcome::Cleared);
        assert!(started.elapsed() >= d.state.config().finish_recheck_delay);
        assert_eq!(d.state.screen(), Screen::Home);
        assert!(d.state.snapshot().await.is_none());
    }

    #[tokio::test]
    async fn pending_player_sees_the_block_screen_after_rejection() {
        let d = device();
        let room = room(Uuid::new_v4(), RoomStatus::Lobby);
        d.store.seed_room(room.clone());
        let row = d
            .store
            .upsert_participant(room.id, d.user.id, ParticipantStatus::Pending)
            .await
            .unwrap();
        d.state.device().set_last_room_id(room.id);
        assert_eq!(
            tick(&d.state).await,
            WatchdogOutcome::Restored(Screen::Pending { room_id: room.id })
        );

        d.store
            .update_participant_status(row.id, ParticipantStatus::Rejected)
            .await
            .unwrap();

        assert_eq!(
            tick(&d.state).await,
            WatchdogOutcome::Stayed(Screen::Blocked { room_id: room.id })
        );
        d.state.shutdown().await;
    }

    #[tokio::test]
    async fn inactivity_exits_the_room_and_signs_out() {
        let d = device();
        let room = room(Uuid::new_v4(), RoomStatus::Playing);
        d.store.seed_room(room.clone());
        d.store
            .upsert_participant(room.id, d.user.id, ParticipantStatus::Accepted)
            .await
            .unwrap();
        d.state.device().set_last_room_id(room.id);
        tick(&d.state).await;

        d.clock.advance(Duration::from_secs(16 * 60));
        let outcome = tick(&d.state).await;

        assert_eq!(outcome, WatchdogOutcome::SignedOut(SignOutReason::Inactivity));
        assert!(d.store.participants_of(room.id).is_empty());
        assert_eq!(d.state.screen(), Screen::SignedOut);
        assert!(d.auth.watch().borrow().is_none());
    }

    #[tokio::test]
    async fn interaction_defers_the_inactivity_sign_out() {
        let d = device();
        d.clock.advance(Duration::from_secs(14 * 60));
        d.state.touch_interaction();
        d.clock.advance(Duration::from_secs(14 * 60));

        assert_eq!(tick(&d.state).await, WatchdogOutcome::Stayed(Screen::Home));
    }

    #[tokio::test]
    async fn foreign_session_marker_signs_out() {
        let d = device();
        room_service::claim_session(&d.state).await.unwrap();
        assert_eq!(tick(&d.state).await, WatchdogOutcome::Stayed(Screen::Home));

        d.store
            .claim_session(d.user.id, "another-device".into())
            .await
            .unwrap();

        assert_eq!(
            tick(&d.state).await,
            WatchdogOutcome::SignedOut(SignOutReason::SessionConflict)
        );
    }

    #[tokio::test]
    async fn profile_outage_is_not_a_conflict() {
        let d = device();
        room_service::claim_session(&d.state).await.unwrap();
        d.store.set_offline(true);

        assert_eq!(tick(&d.state).await, WatchdogOutcome::Stayed(Screen::Home));
    }

    #[tokio::test]
    async fn stale_hint_with_backend_down_converges_home() {
        let d = device();
        d.state.device().set_last_room_id(Uuid::new_v4());
        d.store.set_offline(true);

        assert_eq!(tick(&d.state).await, WatchdogOutcome::Cleared);
        assert_eq!(d.state.screen(), Screen::Home);
        assert_eq!(d.state.device().last_room_id(), None);
    }

    #[tokio::test]
    async fn signed_out_user_lands_on_the_signed_out_screen() {
        let d = device();
        d.auth.sign_out().await.unwrap();

        assert_eq!(tick(&d.state).await, WatchdogOutcome::NoSession);
        assert_eq!(d.state.screen(), Screen::SignedOut);
    }
}
