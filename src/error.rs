use thiserror::Error;
use uuid::Uuid;

use crate::dao::storage::StorageError;

/// Errors that can occur in service layer operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Storage backend is unavailable.
    #[error("storage unavailable")]
    Unavailable(#[source] StorageError),
    /// No user is signed in.
    #[error("no authenticated user")]
    Unauthenticated,
    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Operation cannot be performed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Invalid input provided by the caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The room cannot take another accepted player.
    #[error("room is full ({limit} seats)")]
    RoomFull {
        /// Seats available, host included.
        limit: u32,
    },
    /// The user was rejected too many times from this room.
    #[error("banned from room after {rejections} rejections")]
    Banned {
        /// Rejections recorded so far.
        rejections: u32,
    },
    /// The user is still a member of another active room.
    #[error("already a member of room {room_id}")]
    AlreadyInRoom {
        /// The other room.
        room_id: Uuid,
    },
    /// Only the host of the room may perform this operation.
    #[error("operation reserved to the room host")]
    NotHost,
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { what } => ServiceError::NotFound(what),
            other => ServiceError::Unavailable(other),
        }
    }
}

impl ServiceError {
    /// Whether the failure is transient and a later retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Unavailable(_))
    }
}

/// Errors raised by the tentative mutation ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// A mutation on the same target is already awaiting confirmation.
    #[error("a tentative mutation is already pending for {target}")]
    AlreadyPending {
        /// Target of the conflicting mutation.
        target: String,
    },
    /// No pending mutation carries this id.
    #[error("no pending mutation with id {0}")]
    Unknown(Uuid),
}

impl From<LedgerError> for ServiceError {
    fn from(err: LedgerError) -> Self {
        ServiceError::InvalidState(err.to_string())
    }
}
