#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Change feed fan-out between devices sharing one in-memory backend.

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, SystemTime},
};

use bingo_room_sync::{
    ClientState, SharedState, SyncConfig,
    clock::ManualClock,
    dao::{
        local::DeviceStore,
        models::{AuthUser, ParticipantStatus, WinningPatterns},
        room_store::memory::MemoryRoomStore,
    },
    services::{
        admission,
        draw::{self, DrawOutcome, SkipReason},
        realtime,
        room_service::{self, RoomSettings},
        snapshot_service,
    },
    state::{RealtimeState, RoomEvent},
};
use uuid::Uuid;

const T0: Duration = Duration::from_secs(1_700_000_000);

struct World {
    store: Arc<MemoryRoomStore>,
    clock: ManualClock,
}

impl World {
    fn new() -> Self {
        let clock = ManualClock::new(SystemTime::UNIX_EPOCH + T0);
        let store = MemoryRoomStore::new(Arc::new(clock.clone()));
        Self { store, clock }
    }

    fn user(name: &str) -> AuthUser {
        AuthUser {
            id: Uuid::new_v4(),
            email: format!("{name}@example.com"),
        }
    }

    fn device_for(&self, user: &AuthUser) -> SharedState {
        let (backend, _auth) = self.store.backend_for(Some(user.clone()));
        ClientState::new(
            backend,
            SyncConfig::default(),
            DeviceStore::in_memory(),
            Arc::new(self.clock.clone()),
        )
    }
}

fn settings() -> RoomSettings {
    RoomSettings {
        name: "feed".into(),
        player_limit: 6,
        rounds: 1,
        prize_pool: 0,
        winning_patterns: WinningPatterns::default(),
        draw_interval_seconds: 10,
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn one_feed_per_device_and_one_left_notice() {
    let world = World::new();
    let host = world.device_for(&World::user("host"));
    let player = world.device_for(&World::user("player"));
    let room = room_service::create_room(&host, settings()).await.unwrap();

    realtime::subscribe(&host, room.id).await.unwrap();
    realtime::subscribe(&host, room.id).await.unwrap();
    let store = &world.store;
    let room_id = room.id;
    eventually("a single live feed", || async move {
        store.active_subscriptions(room_id) == 1
    })
    .await;

    let row_id = admission::join(&player, room.id, ParticipantStatus::Pending)
        .await
        .unwrap()
        .unwrap()
        .id;
    let host_ref = &host;
    eventually("the host to list the player", || async move {
        host_ref
            .snapshot()
            .await
            .is_some_and(|snapshot| snapshot.pending.contains_key(&row_id))
    })
    .await;

    let mut events = host.events().subscribe();
    room_service::hard_exit(&player).await;
    eventually("the host to drop the player", || async move {
        host_ref
            .snapshot()
            .await
            .is_some_and(|snapshot| snapshot.participant(row_id).is_none())
    })
    .await;
    snapshot_service::refresh_participants(&host, room.id).await;
    snapshot_service::refresh_participants(&host, room.id).await;

    let mut left = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(&event, RoomEvent::ParticipantLeft(p) if p.id == row_id) {
            left += 1;
        }
    }
    assert_eq!(left, 1);
    assert_eq!(world.store.active_subscriptions(room.id), 1);
    assert_eq!(
        host.snapshot().await.unwrap().realtime,
        RealtimeState::Subscribed
    );

    host.shutdown().await;
    assert_eq!(world.store.active_subscriptions(room.id), 0);
}

#[tokio::test]
async fn a_second_tab_learns_about_draws_from_the_feed() {
    let world = World::new();
    let host_user = World::user("host");
    let first_tab = world.device_for(&host_user);
    let second_tab = world.device_for(&host_user);

    let room = room_service::create_room(&first_tab, settings()).await.unwrap();
    room_service::start_game(&first_tab).await.unwrap();
    snapshot_service::bootstrap(&second_tab, room.id).await;
    realtime::subscribe(&second_tab, room.id).await.unwrap();
    let second_ref = &second_tab;
    eventually("the second tab to subscribe", || async move {
        second_ref
            .snapshot()
            .await
            .is_some_and(|snapshot| snapshot.realtime == RealtimeState::Subscribed)
    })
    .await;

    world.clock.advance(Duration::from_secs(10));
    let DrawOutcome::Drawn(number) = draw::tick(&first_tab).await else {
        panic!("expected the first tab to draw");
    };
    eventually("the second tab to see the draw", || async move {
        second_ref
            .snapshot()
            .await
            .and_then(|snapshot| snapshot.room)
            .is_some_and(|room| room.drawn_numbers == vec![number])
    })
    .await;

    world.clock.advance(Duration::from_secs(1));
    assert_eq!(
        draw::tick(&second_tab).await,
        DrawOutcome::Skipped(SkipReason::NotDue)
    );
    assert_eq!(world.store.room(room.id).unwrap().drawn_numbers, vec![number]);

    second_tab.shutdown().await;
}
