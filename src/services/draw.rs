//! Host-side number draws.
//!
//! Every host device runs a due-check timer. There is no lock between devices:
//! the room's `updated_at` acts as a lease. A device only writes after a fresh
//! read shows that nobody advanced the room within the guard window or the
//! current interval. Two hosts that read the room before either one writes can
//! still both draw; the game tolerates it.

use std::time::SystemTime;

use rand::{Rng, SeedableRng, rngs::StdRng, seq::IndexedRandom};
use tokio::{task::AbortHandle, time::sleep};
use tracing::{debug, info, trace, warn};

use crate::{
    clock::elapsed_between,
    config::DrawStampPolicy,
    dao::models::{RoomPatch, RoomStatus},
    error::LedgerError,
    state::{Mutation, MutationId, Room, RoomEvent, RoomTicket, SharedState},
};

/// Why a tick did not attempt a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No room loaded.
    NoRoom,
    /// This user does not host the room.
    NotHost,
    /// The room is not in the playing state.
    NotPlaying,
    /// Draws are paused on this device.
    Paused,
    /// A winner was recorded for the current round.
    WinnerRecorded,
    /// The interval since the last draw has not elapsed.
    NotDue,
    /// A draw is already running on this device.
    Busy,
    /// The active room changed during the tick.
    Superseded,
}

/// Result of one due-check tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawOutcome {
    /// Nothing attempted.
    Skipped(SkipReason),
    /// Another writer advanced the room recently; its timestamp was recorded.
    GuardBlocked {
        /// Room timestamp read from the server.
        server_updated_at: SystemTime,
    },
    /// A number was drawn and written.
    Drawn(u8),
    /// Every number of the round is drawn.
    Exhausted,
    /// The backend read or write failed; the next tick retries.
    Failed,
}

/// Run one due-check with a freshly seeded generator.
pub async fn tick(state: &SharedState) -> DrawOutcome {
    let mut rng = StdRng::from_rng(&mut rand::rng());
    tick_with_rng(state, &mut rng).await
}

/// Run one due-check, picking numbers with `rng`.
pub async fn tick_with_rng<R: Rng + Send>(state: &SharedState, rng: &mut R) -> DrawOutcome {
    let Some((ticket, snapshot)) = state.ticketed_snapshot().await else {
        return DrawOutcome::Skipped(SkipReason::NoRoom);
    };
    let is_host = snapshot.is_host();
    let Some(room) = snapshot.room else {
        return DrawOutcome::Skipped(SkipReason::NoRoom);
    };
    if let Some(reason) = local_blocker(state, &room, is_host) {
        return DrawOutcome::Skipped(reason);
    }

    let config = state.config();
    let interval = room.draw_interval(config.default_draw_interval);
    let last_local = state.device().last_draw_at().unwrap_or(SystemTime::UNIX_EPOCH);
    let reference = last_local.max(room.updated_at);
    if elapsed_between(reference, state.now()) < interval {
        return DrawOutcome::Skipped(SkipReason::NotDue);
    }
    if room.remaining_numbers(config.max_number).is_empty() {
        announce_exhausted(state, ticket, room.current_round).await;
        return DrawOutcome::Exhausted;
    }

    let Some(_busy) = state.claim_draw() else {
        return DrawOutcome::Skipped(SkipReason::Busy);
    };

    let fresh = match state.backend().rooms.fetch_room(ticket.room_id).await {
        Ok(Some(row)) => Room::from(row),
        Ok(None) => {
            debug!(room_id = %ticket.room_id, "room vanished before the draw");
            return DrawOutcome::Skipped(SkipReason::NoRoom);
        }
        Err(err) => {
            warn!(room_id = %ticket.room_id, error = %err, "fresh room read failed");
            return DrawOutcome::Failed;
        }
    };
    if !state.is_current(ticket).await {
        return DrawOutcome::Skipped(SkipReason::Superseded);
    }
    if let Some(reason) = local_blocker(state, &fresh, is_host) {
        return DrawOutcome::Skipped(reason);
    }

    let now = state.now();
    let since_update = elapsed_between(fresh.updated_at, now);
    if since_update < config.guard_window {
        state.device().set_last_draw_at(fresh.updated_at);
        debug!(room_id = %ticket.room_id, ?since_update, "draw guard blocked a duplicate");
        return DrawOutcome::GuardBlocked {
            server_updated_at: fresh.updated_at,
        };
    }
    if since_update < fresh.draw_interval(config.default_draw_interval) {
        state.device().set_last_draw_at(fresh.updated_at);
        debug!(room_id = %ticket.room_id, ?since_update, "room advanced elsewhere");
        return DrawOutcome::Skipped(SkipReason::NotDue);
    }

    let pool = fresh.remaining_numbers(config.max_number);
    let Some(&number) = pool.choose(rng) else {
        announce_exhausted(state, ticket, fresh.current_round).await;
        return DrawOutcome::Exhausted;
    };

    let mut drawn = fresh.drawn_numbers.clone();
    drawn.push(number);
    let mutation = Mutation::AppendDraw {
        number,
        stamped_at: now,
        previous_updated_at: fresh.updated_at,
    };
    let recorded = state
        .with_session(ticket, |active| {
            let id = active.ledger.record(ticket.room_id, mutation.clone())?;
            active.snapshot.apply_room(fresh);
            mutation.apply(&mut active.snapshot);
            Ok::<_, LedgerError>(id)
        })
        .await;
    let id = match recorded {
        Some(Ok(id)) => id,
        Some(Err(err)) => {
            debug!(room_id = %ticket.room_id, error = %err, "draw already pending");
            return DrawOutcome::Skipped(SkipReason::Busy);
        }
        None => return DrawOutcome::Skipped(SkipReason::Superseded),
    };

    if config.draw_stamp_policy == DrawStampPolicy::BeforeWrite {
        state.device().set_last_draw_at(now);
    }

    let patch = RoomPatch {
        drawn_numbers: Some(drawn),
        updated_at: Some(now),
        ..RoomPatch::default()
    };
    match state.backend().rooms.update_room(ticket.room_id, patch).await {
        Ok(Some(_)) => {
            state
                .with_session(ticket, |active| active.ledger.confirm(id).ok())
                .await;
            if config.draw_stamp_policy == DrawStampPolicy::AfterConfirm {
                state.device().set_last_draw_at(now);
            }
            info!(room_id = %ticket.room_id, number, "number drawn");
            state.events().broadcast(RoomEvent::NumberDrawn {
                room_id: ticket.room_id,
                number,
            });
            DrawOutcome::Drawn(number)
        }
        Ok(None) => {
            roll_back(state, ticket, id).await;
            debug!(room_id = %ticket.room_id, "room vanished during the draw");
            DrawOutcome::Skipped(SkipReason::NoRoom)
        }
        Err(err) => {
            roll_back(state, ticket, id).await;
            warn!(room_id = %ticket.room_id, error = %err, "draw write failed");
            DrawOutcome::Failed
        }
    }
}

/// Spawn the due-check timer, ticking several times per draw interval.
///
/// The task is cancelled by [`crate::state::ClientState::shutdown`] or through
/// the returned handle.
pub async fn spawn_draw_loop(state: &SharedState) -> AbortHandle {
    let task_state = state.clone();
    let handle = tokio::spawn(async move {
        let mut rng = StdRng::from_rng(&mut rand::rng());
        loop {
            let default = task_state.config().default_draw_interval;
            let interval = task_state
                .snapshot()
                .await
                .and_then(|snapshot| snapshot.room)
                .map_or(default, |room| room.draw_interval(default));
            sleep(task_state.config().draw_check_period(interval)).await;
            let outcome = tick_with_rng(&task_state, &mut rng).await;
            trace!(?outcome, "draw tick");
        }
    });
    let abort = handle.abort_handle();
    state.register_loop(handle).await;
    abort
}

fn local_blocker(state: &SharedState, room: &Room, is_host: bool) -> Option<SkipReason> {
    if !is_host {
        return Some(SkipReason::NotHost);
    }
    if room.status != RoomStatus::Playing {
        return Some(SkipReason::NotPlaying);
    }
    if state.device().is_paused() {
        return Some(SkipReason::Paused);
    }
    if state.device().winner_round() == Some(room.current_round) {
        return Some(SkipReason::WinnerRecorded);
    }
    None
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

async fn announce_exhausted(state: &SharedState, ticket: RoomTicket, round: u32) {
    let first = state
        .with_session(ticket, |active| {
            active.exhausted_round.replace(round) != Some(round)
        })
        .await
        .unwrap_or(false);
    if first {
        info!(room_id = %ticket.room_id, round, "draw pool exhausted");
        state.events().broadcast(RoomEvent::DrawPoolExhausted {
            room_id: ticket.room_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use uuid::Uuid;

    use super::*;
    use crate::{
        clock::ManualClock,
        config::SyncConfig,
        dao::{
            local::DeviceStore,
            models::{AuthUser, RoomEntity, WinningPatterns},
            room_store::memory::MemoryRoomStore,
        },
        services::snapshot_service,
        state::ClientState,
    };

    const T0: Duration = Duration::from_secs(1_700_000_000);

    struct Device {
        state: SharedState,
        clock: Arc<ManualClock>,
    }

    fn room(host_id: Uuid, drawn: Vec<u8>) -> RoomEntity {
        RoomEntity {
            id: Uuid::new_v4(),
            code: "DRAW01".into(),
            name: "draw".into(),
            host_id,
            status: RoomStatus::Playing,
            drawn_numbers: drawn,
            updated_at: SystemTime::UNIX_EPOCH + T0,
            player_limit: 10,
            current_round: 1,
            rounds: 3,
            prize_pool: 0,
            winning_patterns: WinningPatterns::default(),
            draw_interval_seconds: 10,
        }
    }

    async fn device(
        store: &Arc<MemoryRoomStore>,
        user: &AuthUser,
        room_id: Uuid,
        config: SyncConfig,
    ) -> Device {
        let clock = Arc::new(ManualClock::new(SystemTime::UNIX_EPOCH + T0));
        let (backend, _auth) = store.backend_for(Some(user.clone()));
        let state = ClientState::new(backend, config, DeviceStore::in_memory(), clock.clone());
        snapshot_service::bootstrap(&state, room_id).await;
        Device { state, clock }
    }

    fn host() -> AuthUser {
        AuthUser {
            id: Uuid::new_v4(),
            email: "host@example.com".into(),
        }
    }

    fn server() -> Arc<MemoryRoomStore> {
        MemoryRoomStore::new(Arc::new(ManualClock::new(SystemTime::UNIX_EPOCH + T0)))
    }

    #[tokio::test]
    async fn second_tab_is_blocked_by_the_guard() {
        let store = server();
        let host = host();
        let room = room(host.id, vec![5, 12]);
        store.seed_room(room.clone());
        let a = device(&store, &host, room.id, SyncConfig::default()).await;
        let b = device(&store, &host, room.id, SyncConfig::default()).await;

        a.clock.advance(Duration::from_millis(10_100));
        let outcome = tick(&a.state).await;
        let DrawOutcome::Drawn(number) = outcome else {
            panic!("expected a draw, got {outcome:?}");
        };

        b.clock.advance(Duration::from_millis(10_300));
        let stamp = SystemTime::UNIX_EPOCH + T0 + Duration::from_millis(10_100);
        assert_eq!(
            tick(&b.state).await,
            DrawOutcome::GuardBlocked {
                server_updated_at: stamp
            }
        );

        let server_room = store.room(room.id).unwrap();
        assert_eq!(server_room.drawn_numbers, vec![5, 12, number]);
        assert_eq!(server_room.updated_at, stamp);
        assert_eq!(b.state.device().last_draw_at(), Some(stamp));
    }

    #[tokio::test]
    async fn draw_is_applied_locally_before_the_echo() {
        let store = server();
        let host = host();
        let room = room(host.id, vec![]);
        store.seed_room(room.clone());
        let a = device(&store, &host, room.id, SyncConfig::default()).await;
        let mut events = a.state.events().subscribe();

        a.clock.advance(Duration::from_secs(11));
        let DrawOutcome::Drawn(number) = tick(&a.state).await else {
            panic!("expected a draw");
        };

        let local = a.state.snapshot().await.unwrap().room.unwrap();
        assert_eq!(local.drawn_numbers, vec![number]);
        assert_eq!(
            events.try_recv().unwrap(),
            RoomEvent::NumberDrawn {
                room_id: room.id,
                number
            }
        );
    }

    #[tokio::test]
    async fn tick_is_not_due_before_the_interval() {
        let store = server();
        let host = host();
        let room = room(host.id, vec![]);
        store.seed_room(room.clone());
        let a = device(&store, &host, room.id, SyncConfig::default()).await;

        a.clock.advance(Duration::from_secs(9));
        assert_eq!(tick(&a.state).await, DrawOutcome::Skipped(SkipReason::NotDue));
        assert_eq!(store.room_write_count(), 0);
    }

    #[tokio::test]
    async fn local_flags_block_draws() {
        let store = server();
        let host = host();
        let room = room(host.id, vec![]);
        store.seed_room(room.clone());
        let a = device(&store, &host, room.id, SyncConfig::default()).await;
        a.clock.advance(Duration::from_secs(30));

        a.state.device().set_paused(true);
        assert_eq!(tick(&a.state).await, DrawOutcome::Skipped(SkipReason::Paused));
        a.state.device().set_paused(false);

        a.state.device().set_winner_round(1);
        assert_eq!(
            tick(&a.state).await,
            DrawOutcome::Skipped(SkipReason::WinnerRecorded)
        );
    }

    #[tokio::test]
    async fn participants_never_draw() {
        let store = server();
        let host = host();
        let room = room(host.id, vec![]);
        store.seed_room(room.clone());
        let player = AuthUser {
            id: Uuid::new_v4(),
            email: "player@example.com".into(),
        };
        let p = device(&store, &player, room.id, SyncConfig::default()).await;
        p.clock.advance(Duration::from_secs(30));

        assert_eq!(tick(&p.state).await, DrawOutcome::Skipped(SkipReason::NotHost));
    }

    #[tokio::test]
    async fn exhausted_pool_is_announced_once() {
        let store = server();
        let host = host();
        let config = SyncConfig {
            max_number: 3,
            ..SyncConfig::default()
        };
        let room = room(host.id, vec![2, 1, 3]);
        store.seed_room(room.clone());
        let a = device(&store, &host, room.id, config).await;
        let mut events = a.state.events().subscribe();
        a.clock.advance(Duration::from_secs(30));

        assert_eq!(tick(&a.state).await, DrawOutcome::Exhausted);
        assert_eq!(tick(&a.state).await, DrawOutcome::Exhausted);

        assert_eq!(
            events.try_recv().unwrap(),
            RoomEvent::DrawPoolExhausted { room_id: room.id }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_write_rolls_back_and_stamps_before_write() {
        let store = server();
        let host = host();
        let room = room(host.id, vec![5]);
        store.seed_room(room.clone());
        let a = device(&store, &host, room.id, SyncConfig::default()).await;
        a.clock.advance(Duration::from_secs(11));

        store.fail_next_writes(1);
        assert_eq!(tick(&a.state).await, DrawOutcome::Failed);

        let local = a.state.snapshot().await.unwrap().room.unwrap();
        assert_eq!(local.drawn_numbers, vec![5]);
        assert_eq!(store.room(room.id).unwrap().drawn_numbers, vec![5]);
        assert_eq!(tick(&a.state).await, DrawOutcome::Skipped(SkipReason::NotDue));
    }

    #[tokio::test]
    async fn failed_write_retries_next_tick_when_stamping_after_confirm() {
        let store = server();
        let host = host();
        let config = SyncConfig {
            draw_stamp_policy: DrawStampPolicy::AfterConfirm,
            ..SyncConfig::default()
        };
        let room = room(host.id, vec![5]);
        store.seed_room(room.clone());
        let a = device(&store, &host, room.id, config).await;
        a.clock.advance(Duration::from_secs(11));

        store.fail_next_writes(1);
        assert_eq!(tick(&a.state).await, DrawOutcome::Failed);
        assert!(matches!(tick(&a.state).await, DrawOutcome::Drawn(_)));
    }

    #[tokio::test]
    async fn seeded_draws_stay_within_the_pool() {
        let store = server();
        let host = host();
        let config = SyncConfig {
            max_number: 5,
            ..SyncConfig::default()
        };
        let room = room(host.id, vec![]);
        store.seed_room(room.clone());
        let a = device(&store, &host, room.id, config).await;
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..5 {
            a.clock.advance(Duration::from_secs(10));
            assert!(matches!(
                tick_with_rng(&a.state, &mut rng).await,
                DrawOutcome::Drawn(_)
            ));
        }
        a.clock.advance(Duration::from_secs(10));
        assert_eq!(tick_with_rng(&a.state, &mut rng).await, DrawOutcome::Exhausted);

        let mut drawn = store.room(room.id).unwrap().drawn_numbers;
        drawn.sort_unstable();
        assert_eq!(drawn, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn draw_loop_advances_the_room() {
        let store = server();
        let host = host();
        let room = room(host.id, vec![]);
        store.seed_room(room.clone());
        let a = device(&store, &host, room.id, SyncConfig::default()).await;
        a.clock.advance(Duration::from_secs(10));

        let handle = spawn_draw_loop(&a.state).await;
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        handle.abort();

        assert_eq!(store.room(room.id).unwrap().drawn_numbers.len(), 1);
    }
}
