use uuid::Uuid;

/// Navigation target driven by the session watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Screen {
    /// Landing screen, no room.
    #[default]
    Home,
    /// Waiting room before the game starts.
    Lobby {
        /// Room shown.
        room_id: Uuid,
    },
    /// Game in progress.
    Game {
        /// Room shown.
        room_id: Uuid,
    },
    /// Waiting for the host to accept the join request.
    Pending {
        /// Room shown.
        room_id: Uuid,
    },
    /// Permanent block after a rejection.
    Blocked {
        /// Room that rejected the user.
        room_id: Uuid,
    },
    /// No session.
    SignedOut,
}

impl Screen {
    /// Screens tied to a live room whose disappearance must be detected.
    pub fn is_room_critical(self) -> bool {
        matches!(
            self,
            Screen::Lobby { .. } | Screen::Game { .. } | Screen::Pending { .. }
        )
    }

    /// Room shown by the screen, if any.
    pub fn room_id(self) -> Option<Uuid> {
        match self {
            Screen::Lobby { room_id }
            | Screen::Game { room_id }
            | Screen::Pending { room_id }
            | Screen::Blocked { room_id } => Some(room_id),
            Screen::Home | Screen::SignedOut => None,
        }
    }
}
