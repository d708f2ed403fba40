use std::time::Duration;

use futures::StreamExt;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval, sleep, sleep_until},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::room_store::{ChannelStatus, FeedMessage},
    error::ServiceError,
    services::snapshot_service,
    state::{RealtimeState, RoomEvent, RoomTicket, SharedState},
};

const INITIAL_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);
const MAX_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(30);

/// Live change-feed subscription of one room with its timers.
pub struct Subscription {
    ticket: RoomTicket,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    /// Room the subscription listens to.
    pub fn room_id(&self) -> Uuid {
        self.ticket.room_id
    }

    /// Abort the feed reader and every timer, returning once they are gone.
    pub(crate) async fn cancel(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        debug!(room_id = %self.ticket.room_id, "subscription cancelled");
    }
}

/// Subscribe to changes of `room_id`, replacing any previous subscription.
///
/// The previous subscription and its timers are fully torn down before the
/// new ones start, including when `room_id` is already subscribed.
pub async fn subscribe(state: &SharedState, room_id: Uuid) -> Result<(), ServiceError> {
    let ticket = match state.current_ticket().await {
        Some(ticket) if ticket.room_id == room_id => ticket,
        _ => snapshot_service::set_room_id(state, Some(room_id))
            .await
            .ok_or_else(|| ServiceError::InvalidState("no active room".into()))?,
    };

    let mut slot = state.subscription().lock().await;
    if let Some(previous) = slot.take() {
        previous.cancel().await;
    }
    if !state.is_current(ticket).await {
        return Err(ServiceError::InvalidState(
            "room changed while subscribing".into(),
        ));
    }

    let user_id = state
        .snapshot()
        .await
        .and_then(|snapshot| snapshot.current_user_id);
    set_realtime(state, ticket, RealtimeState::Subscribing).await;
    let (mode_tx, mode_rx) = watch::channel(RealtimeState::Subscribing);

    let tasks = vec![
        tokio::spawn(run_feed(state.clone(), ticket, mode_tx)),
        tokio::spawn(run_poll(state.clone(), ticket, mode_rx.clone())),
        tokio::spawn(run_heartbeat(state.clone(), ticket, user_id, mode_rx)),
        tokio::spawn(run_stale_sweep(state.clone(), ticket)),
    ];
    *slot = Some(Subscription { ticket, tasks });
    info!(room_id = %room_id, "subscribed to room changes");
    Ok(())
}

/// Cancel the active subscription, if any.
pub async fn unsubscribe(state: &SharedState) {
    let previous = state.subscription().lock().await.take();
    if let Some(previous) = previous {
        let ticket = previous.ticket;
        previous.cancel().await;
        set_realtime(state, ticket, RealtimeState::Idle).await;
    }
}

/// Room currently subscribed, if any.
pub async fn subscribed_room(state: &SharedState) -> Option<Uuid> {
    state
        .subscription()
        .lock()
        .await
        .as_ref()
        .map(Subscription::room_id)
}

async fn set_realtime(state: &SharedState, ticket: RoomTicket, next: RealtimeState) {
    let changed = state
        .update_snapshot(ticket, |snapshot| {
            let changed = snapshot.realtime != next;
            snapshot.realtime = next;
            changed
        })
        .await
        .unwrap_or(false);
    if changed {
        debug!(room_id = %ticket.room_id, state = ?next, "realtime state changed");
        state.events().broadcast(RoomEvent::RealtimeChanged(next));
    }
}

fn realtime_from_status(status: ChannelStatus) -> RealtimeState {
    match status {
        ChannelStatus::Subscribed => RealtimeState::Subscribed,
        ChannelStatus::Error => RealtimeState::Error,
        ChannelStatus::Closed => RealtimeState::Closed,
    }
}

/// Read the change feed, resubscribing with backoff when the channel ends.
async fn run_feed(state: SharedState, ticket: RoomTicket, mode: watch::Sender<RealtimeState>) {
    let mut delay = INITIAL_RESUBSCRIBE_DELAY;
    loop {
        match state.backend().feed.subscribe(ticket.room_id).await {
            Ok(mut stream) => {
                while let Some(message) = stream.next().await {
                    match message {
                        FeedMessage::Status(status) => {
                            let next = realtime_from_status(status);
                            if next == RealtimeState::Subscribed {
                                delay = INITIAL_RESUBSCRIBE_DELAY;
                            }
                            set_realtime(&state, ticket, next).await;
                            mode.send_replace(next);
                        }
                        FeedMessage::Change(event) => {
                            debug!(room_id = %ticket.room_id, table = ?event.table, kind = ?event.kind, "change received");
                            let _ = snapshot_service::reconcile(&state, ticket).await;
                        }
                    }
                }
                set_realtime(&state, ticket, RealtimeState::Closed).await;
                mode.send_replace(RealtimeState::Closed);
            }
            Err(err) => {
                warn!(room_id = %ticket.room_id, error = %err, "change feed subscription failed");
                set_realtime(&state, ticket, RealtimeState::Error).await;
                mode.send_replace(RealtimeState::Error);
            }
        }

        sleep(delay).await;
        delay = (delay * 2).min(MAX_RESUBSCRIBE_DELAY);
        set_realtime(&state, ticket, RealtimeState::Subscribing).await;
        mode.send_replace(RealtimeState::Subscribing);
    }
}

/// Poll the room slowly while subscribed and aggressively while degraded.
///
/// A resubscription attempt after a failure keeps the aggressive cadence, and
/// a mode change that keeps the same period does not restart the timer.
async fn run_poll(state: SharedState, ticket: RoomTicket, mut mode: watch::Receiver<RealtimeState>) {
    let mut degraded = false;
    let mut running: Option<(Duration, Instant)> = None;
    loop {
        let period = match *mode.borrow_and_update() {
            RealtimeState::Subscribed => {
                degraded = false;
                Some(state.config().safety_poll)
            }
            RealtimeState::Error | RealtimeState::Closed => {
                degraded = true;
                Some(state.config().aggressive_poll)
            }
            RealtimeState::Subscribing if degraded => Some(state.config().aggressive_poll),
            RealtimeState::Idle | RealtimeState::Subscribing => None,
        };
        running = match (period, running) {
            (Some(period), Some((current, deadline))) if period == current => {
                Some((current, deadline))
            }
            (Some(period), _) => Some((period, Instant::now() + period)),
            (None, _) => None,
        };

        let Some((period, deadline)) = running else {
            if mode.changed().await.is_err() {
                return;
            }
            continue;
        };

        tokio::select! {
            _ = sleep_until(deadline) => {
                debug!(room_id = %ticket.room_id, ?period, "poll tick");
                let _ = snapshot_service::reconcile(&state, ticket).await;
                running = Some((period, Instant::now() + period));
            }
            changed = mode.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// Refresh the caller's presence stamp while subscribed.
async fn run_heartbeat(
    state: SharedState,
    ticket: RoomTicket,
    user_id: Option<Uuid>,
    mode: watch::Receiver<RealtimeState>,
) {
    let Some(user_id) = user_id else {
        return;
    };
    let mut ticker = interval(state.config().heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if *mode.borrow() != RealtimeState::Subscribed {
            continue;
        }
        if let Err(err) = state
            .backend()
            .rooms
            .touch_participant(ticket.room_id, user_id)
            .await
        {
            warn!(room_id = %ticket.room_id, error = %err, "heartbeat failed");
        }
    }
}

/// Ask the backend to remove participants whose presence went stale.
async fn run_stale_sweep(state: SharedState, ticket: RoomTicket) {
    let mut ticker = interval(state.config().stale_sweep);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match state
            .backend()
            .rooms
            .cleanup_stale_participants(ticket.room_id, state.config().stale_threshold)
            .await
        {
            Ok(0) => {}
            Ok(removed) => debug!(room_id = %ticket.room_id, removed, "stale participants swept"),
            Err(err) => warn!(room_id = %ticket.room_id, error = %err, "stale sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::SystemTime};

    use super::*;
    use crate::{
        clock::ManualClock,
        config::SyncConfig,
        dao::{
            local::DeviceStore,
            models::{AuthUser, ParticipantStatus, RoomEntity, RoomStatus, WinningPatterns},
            room_store::{RoomStore, memory::MemoryRoomStore},
        },
        state::ClientState,
    };

    struct Fixture {
        store: Arc<MemoryRoomStore>,
        state: SharedState,
        room_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(SystemTime::UNIX_EPOCH));
        let store = MemoryRoomStore::new(clock.clone());
        let user = AuthUser {
            id: Uuid::new_v4(),
            email: "player@example.com".into(),
        };
        let user_id = user.id;
        let room = RoomEntity {
            id: Uuid::new_v4(),
            code: "BINGO1".into(),
            name: "room".into(),
            host_id: Uuid::new_v4(),
            status: RoomStatus::Lobby,
            drawn_numbers: vec![],
            updated_at: SystemTime::UNIX_EPOCH,
            player_limit: 4,
            current_round: 1,
            rounds: 1,
            prize_pool: 0,
            winning_patterns: WinningPatterns::default(),
            draw_interval_seconds: 10,
        };
        let room_id = room.id;
        store.seed_room(room);
        store
            .upsert_participant(room_id, user_id, ParticipantStatus::Accepted)
            .await
            .unwrap();
        let (backend, _auth) = store.backend_for(Some(user));
        let state = ClientState::new(
            backend,
            SyncConfig::default(),
            DeviceStore::in_memory(),
            clock,
        );
        Fixture {
            store,
            state,
            room_id,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn double_subscribe_keeps_one_feed() {
        let f = fixture().await;
        subscribe(&f.state, f.room_id).await.unwrap();
        subscribe(&f.state, f.room_id).await.unwrap();
        settle().await;

        assert_eq!(f.store.active_subscriptions(f.room_id), 1);
        assert_eq!(subscribed_room(&f.state).await, Some(f.room_id));
        let snapshot = f.state.snapshot().await.unwrap();
        assert_eq!(snapshot.realtime, RealtimeState::Subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_rooms_cancels_previous_feed() {
        let f = fixture().await;
        subscribe(&f.state, f.room_id).await.unwrap();
        settle().await;

        let other = Uuid::new_v4();
        subscribe(&f.state, other).await.unwrap();
        settle().await;

        assert_eq!(f.store.active_subscriptions(f.room_id), 0);
        assert_eq!(f.store.active_subscriptions(other), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_touches_presence_while_subscribed() {
        let f = fixture().await;
        subscribe(&f.state, f.room_id).await.unwrap();
        settle().await;

        tokio::time::sleep(Duration::from_secs(21)).await;
        settle().await;

        assert_eq!(f.store.touch_count(), 2);
    }

    fn seed_drawn(f: &Fixture, drawn: Vec<u8>) {
        let mut room = f.store.room(f.room_id).unwrap();
        room.drawn_numbers = drawn;
        f.store.seed_room(room);
    }

    async fn drawn(f: &Fixture) -> Option<Vec<u8>> {
        f.state
            .snapshot()
            .await
            .and_then(|snapshot| snapshot.room)
            .map(|room| room.drawn_numbers)
    }

    #[tokio::test(start_paused = true)]
    async fn safety_poll_catches_missed_events() {
        let f = fixture().await;
        subscribe(&f.state, f.room_id).await.unwrap();
        settle().await;
        seed_drawn(&f, vec![9]);

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        settle().await;
        assert_eq!(drawn(&f).await, None);

        tokio::time::sleep(Duration::from_secs(9)).await;
        settle().await;
        assert_eq!(drawn(&f).await, Some(vec![9]));
    }

    #[tokio::test(start_paused = true)]
    async fn channel_error_switches_to_aggressive_poll() {
        let f = fixture().await;
        subscribe(&f.state, f.room_id).await.unwrap();
        settle().await;

        f.store.emit_channel_status(f.room_id, ChannelStatus::Error);
        settle().await;
        assert_eq!(
            f.state.snapshot().await.unwrap().realtime,
            RealtimeState::Error
        );
        seed_drawn(&f, vec![9]);

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        settle().await;
        assert_eq!(drawn(&f).await, Some(vec![9]));
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_returns_to_idle() {
        let f = fixture().await;
        subscribe(&f.state, f.room_id).await.unwrap();
        settle().await;

        unsubscribe(&f.state).await;

        assert_eq!(f.store.active_subscriptions(f.room_id), 0);
        assert_eq!(subscribed_room(&f.state).await, None);
        assert_eq!(
            f.state.snapshot().await.unwrap().realtime,
            RealtimeState::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_sweep_runs_on_its_own_timer() {
        let f = fixture().await;
        subscribe(&f.state, f.room_id).await.unwrap();
        settle().await;

        tokio::time::sleep(Duration::from_secs(46)).await;
        settle().await;

        assert_eq!(f.store.sweep_count(), 1);
    }
}
