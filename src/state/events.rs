use tokio::sync::broadcast;
use tokio_stream::{
    Stream, StreamExt,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};
use tracing::debug;
use uuid::Uuid;

use crate::{
    dao::models::ParticipantStatus,
    state::{room::Participant, screen::Screen, snapshot::RealtimeState},
};

/// Domain events emitted by the synchronization core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// A participant row appeared in the active room.
    ParticipantJoined(Participant),
    /// A participant row disappeared from the active room. Fired once per departure.
    ParticipantLeft(Participant),
    /// The room row changed.
    RoomUpdated {
        /// Room identifier.
        room_id: Uuid,
    },
    /// This device drew a number.
    NumberDrawn {
        /// Room identifier.
        room_id: Uuid,
        /// Number drawn.
        number: u8,
    },
    /// Every number of the round has been drawn.
    DrawPoolExhausted {
        /// Room identifier.
        room_id: Uuid,
    },
    /// The change-feed connection state changed.
    RealtimeChanged(RealtimeState),
    /// A participant's admission status changed through this device.
    AdmissionChanged {
        /// Participant row identifier.
        participant_id: Uuid,
        /// New status.
        status: ParticipantStatus,
    },
    /// The UI should show another screen.
    Navigate(Screen),
    /// The user was signed out.
    SignedOut {
        /// Why the session ended.
        reason: SignOutReason,
    },
}

/// Why the watchdog ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutReason {
    /// No interaction for too long.
    Inactivity,
    /// The account is in use on another device.
    SessionConflict,
    /// Explicit sign-out or auth state loss.
    Requested,
}

/// Broadcast hub fanning domain events out to every listener.
pub struct EventHub {
    sender: broadcast::Sender<RoomEvent>,
}

impl EventHub {
    /// Construct a new hub backed by a Tokio broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a new subscriber that will receive subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a stream, skipping over events lost to lag.
    pub fn stream(&self) -> impl Stream<Item = RoomEvent> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                debug!(skipped, "event listener lagged");
                None
            }
        })
    }

    /// Send an event to all current subscribers, ignoring delivery errors.
    pub fn broadcast(&self, event: RoomEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_receives_broadcast_events() {
        let hub = EventHub::new(8);
        let mut stream = Box::pin(hub.stream());
        let room_id = Uuid::new_v4();

        hub.broadcast(RoomEvent::RoomUpdated { room_id });

        assert_eq!(stream.next().await, Some(RoomEvent::RoomUpdated { room_id }));
    }

    #[test]
    fn broadcasting_without_listeners_is_harmless() {
        let hub = EventHub::new(1);
        hub.broadcast(RoomEvent::RealtimeChanged(RealtimeState::Idle));
    }
}
