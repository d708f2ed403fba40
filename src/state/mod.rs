/// Domain events broadcast to the UI.
pub mod events;
/// Client view of a room and its participants.
pub mod room;
/// Navigation targets.
pub mod screen;
/// Reconciled model of the active room.
pub mod snapshot;
/// Optimistic mutations awaiting confirmation.
pub mod tentative;

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::SystemTime,
};

use dashmap::DashSet;
use tokio::{
    sync::{Mutex, RwLock, watch},
    task::JoinHandle,
};
use tracing::debug;
use uuid::Uuid;

use crate::{
    clock::{Clock, from_millis, to_millis},
    config::SyncConfig,
    dao::{local::DeviceStore, room_store::Backend},
    services::realtime::Subscription,
};

pub use self::events::{EventHub, RoomEvent, SignOutReason};
pub use self::room::{Participant, Room};
pub use self::screen::Screen;
pub use self::snapshot::{ClientSessionSnapshot, ParticipantDiff, RealtimeState};
pub use self::tentative::{Mutation, MutationId, Tentative, TentativeLedger};

/// Handle to the client state shared by services and timer loops.
pub type SharedState = Arc<ClientState>;

const EVENT_CAPACITY: usize = 64;

/// Identity of the active room captured before an await point.
///
/// Results of an async step are only applied while the ticket is still current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomTicket {
    /// Room the operation targets.
    pub room_id: Uuid,
    /// Activation counter of that room.
    pub epoch: u64,
}

/// Room-scoped state, reset whenever the active room changes.
#[derive(Debug)]
pub struct ActiveSession {
    /// Client model of the room.
    pub snapshot: ClientSessionSnapshot,
    /// Participants already announced as gone.
    pub notified_left: HashSet<Uuid>,
    /// Optimistic mutations awaiting confirmation.
    pub ledger: TentativeLedger,
    /// Round whose exhausted draw pool was already announced.
    pub exhausted_round: Option<u32>,
    issued_fetches: u64,
    applied_fetch: u64,
}

impl ActiveSession {
    /// Number a reconciliation fetch about to be sent.
    pub fn issue_fetch(&mut self) -> u64 {
        self.issued_fetches += 1;
        self.issued_fetches
    }

    /// Accept the result of fetch `seq` unless a later fetch already landed.
    pub fn accept_fetch(&mut self, seq: u64) -> bool {
        if seq <= self.applied_fetch {
            return false;
        }
        self.applied_fetch = seq;
        true
    }
}

#[derive(Debug, Default)]
struct Session {
    epoch: u64,
    active: Option<ActiveSession>,
}

/// Client context shared by every service of one application session.
pub struct ClientState {
    backend: Backend,
    config: Arc<SyncConfig>,
    clock: Arc<dyn Clock>,
    device: DeviceStore,
    events: EventHub,
    session: RwLock<Session>,
    subscription: Mutex<Option<Subscription>>,
    in_flight: DashSet<Uuid>,
    draw_busy: AtomicBool,
    watchdog_run: AtomicU64,
    last_interaction: AtomicU64,
    screen: watch::Sender<Screen>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientState {
    /// Construct a new [`ClientState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    pub fn new(
        backend: Backend,
        config: SyncConfig,
        device: DeviceStore,
        clock: Arc<dyn Clock>,
    ) -> SharedState {
        let now = clock.now();
        let (screen, _rx) = watch::channel(Screen::Home);
        Arc::new(Self {
            backend,
            config: Arc::new(config),
            clock,
            device,
            events: EventHub::new(EVENT_CAPACITY),
            session: RwLock::new(Session::default()),
            subscription: Mutex::new(None),
            in_flight: DashSet::new(),
            draw_busy: AtomicBool::new(false),
            watchdog_run: AtomicU64::new(0),
            last_interaction: AtomicU64::new(to_millis(now)),
            screen,
            loops: Mutex::new(Vec::new()),
        })
    }

    /// Backend collaborators.
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Tunables.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Current wall-clock time of this device.
    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    /// Device-local persisted hints.
    pub fn device(&self) -> &DeviceStore {
        &self.device
    }

    /// Domain event hub.
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Ticket of the active room, if any.
    pub async fn current_ticket(&self) -> Option<RoomTicket> {
        let session = self.session.read().await;
        session.active.as_ref().map(|active| RoomTicket {
            room_id: active.snapshot.room_id,
            epoch: session.epoch,
        })
    }

    /// Whether `ticket` still designates the active room.
    pub async fn is_current(&self, ticket: RoomTicket) -> bool {
        self.current_ticket().await == Some(ticket)
    }

    /// Replace the active room with an empty snapshot for `room_id`.
    pub(crate) async fn activate_room(&self, room_id: Uuid, user_id: Option<Uuid>) -> RoomTicket {
        let mut session = self.session.write().await;
        session.epoch += 1;
        session.active = Some(ActiveSession {
            snapshot: ClientSessionSnapshot::new(room_id, user_id),
            notified_left: HashSet::new(),
            ledger: TentativeLedger::new(),
            exhausted_round: None,
            issued_fetches: 0,
            applied_fetch: 0,
        });
        debug!(room_id = %room_id, epoch = session.epoch, "room activated");
        RoomTicket {
            room_id,
            epoch: session.epoch,
        }
    }

    /// Drop the active room snapshot.
    pub(crate) async fn deactivate_room(&self) {
        let mut session = self.session.write().await;
        session.epoch += 1;
        if let Some(active) = session.active.take() {
            debug!(room_id = %active.snapshot.room_id, "room deactivated");
        }
    }

    /// Copy of the active snapshot.
    pub async fn snapshot(&self) -> Option<ClientSessionSnapshot> {
        let session = self.session.read().await;
        session.active.as_ref().map(|active| active.snapshot.clone())
    }

    /// Ticket and copy of the active snapshot, read together.
    pub async fn ticketed_snapshot(&self) -> Option<(RoomTicket, ClientSessionSnapshot)> {
        let session = self.session.read().await;
        session.active.as_ref().map(|active| {
            (
                RoomTicket {
                    room_id: active.snapshot.room_id,
                    epoch: session.epoch,
                },
                active.snapshot.clone(),
            )
        })
    }

    /// Run `f` on the room-scoped state when `ticket` is still current.
    pub(crate) async fn with_session<R>(
        &self,
        ticket: RoomTicket,
        f: impl FnOnce(&mut ActiveSession) -> R,
    ) -> Option<R> {
        let mut session = self.session.write().await;
        if session.epoch != ticket.epoch {
            return None;
        }
        session
            .active
            .as_mut()
            .filter(|active| active.snapshot.room_id == ticket.room_id)
            .map(f)
    }

    /// Run `f` on the snapshot when `ticket` is still current.
    pub(crate) async fn update_snapshot<R>(
        &self,
        ticket: RoomTicket,
        f: impl FnOnce(&mut ClientSessionSnapshot) -> R,
    ) -> Option<R> {
        self.with_session(ticket, |active| f(&mut active.snapshot))
            .await
    }

    /// Slot holding the single change-feed subscription.
    pub(crate) fn subscription(&self) -> &Mutex<Option<Subscription>> {
        &self.subscription
    }

    /// Mark `participant_id` as being mutated; `None` when already in flight.
    pub(crate) fn claim_in_flight(&self, participant_id: Uuid) -> Option<InFlightGuard<'_>> {
        self.in_flight.insert(participant_id).then(|| InFlightGuard {
            set: &self.in_flight,
            id: participant_id,
        })
    }

    /// Whether a mutation of `participant_id` is in flight.
    pub fn is_in_flight(&self, participant_id: Uuid) -> bool {
        self.in_flight.contains(&participant_id)
    }

    /// Take the device-wide draw flag; `None` when a draw is already running.
    pub(crate) fn claim_draw(&self) -> Option<DrawGuard<'_>> {
        self.draw_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DrawGuard {
                flag: &self.draw_busy,
            })
    }

    /// Start a new watchdog run, superseding any earlier one.
    pub(crate) fn next_watchdog_run(&self) -> u64 {
        self.watchdog_run.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Whether `run` is still the latest watchdog run.
    pub(crate) fn is_watchdog_run_current(&self, run: u64) -> bool {
        self.watchdog_run.load(Ordering::Acquire) == run
    }

    /// Record a user interaction now.
    pub fn touch_interaction(&self) {
        self.last_interaction
            .store(to_millis(self.clock.now()), Ordering::Release);
    }

    /// Time of the last user interaction.
    pub fn last_interaction(&self) -> SystemTime {
        from_millis(self.last_interaction.load(Ordering::Acquire))
    }

    /// Screen the UI should currently show.
    pub fn screen(&self) -> Screen {
        *self.screen.borrow()
    }

    /// Watch navigation changes.
    pub fn watch_screen(&self) -> watch::Receiver<Screen> {
        self.screen.subscribe()
    }

    /// Switch to `screen`, announcing it when it differs from the current one.
    pub fn navigate(&self, screen: Screen) {
        let changed = self.screen.send_if_modified(|current| {
            if *current == screen {
                false
            } else {
                *current = screen;
                true
            }
        });
        if changed {
            self.events.broadcast(RoomEvent::Navigate(screen));
        }
    }

    /// Keep `handle` so [`ClientState::shutdown`] can cancel it.
    pub(crate) async fn register_loop(&self, handle: JoinHandle<()>) {
        let mut loops = self.loops.lock().await;
        loops.retain(|h| !h.is_finished());
        loops.push(handle);
    }

    /// Cancel timer loops and the subscription, then drop the active room.
    pub async fn shutdown(&self) {
        let loops: Vec<_> = self.loops.lock().await.drain(..).collect();
        for handle in &loops {
            handle.abort();
        }
        for handle in loops {
            let _ = handle.await;
        }
        if let Some(subscription) = self.subscription.lock().await.take() {
            subscription.cancel().await;
        }
        self.deactivate_room().await;
    }
}

/// Releases an in-flight participant id on drop.
pub(crate) struct InFlightGuard<'a> {
    set: &'a DashSet<Uuid>,
    id: Uuid,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

/// Clears the draw busy flag on drop.
pub(crate) struct DrawGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for DrawGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
