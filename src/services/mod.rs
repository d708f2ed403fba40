/// Participant admission: join, approve, reject, kick.
pub mod admission;
/// Host-side number draws guarded by the room timestamp.
pub mod draw;
/// Change-feed subscription, polling fallback, heartbeat and stale sweep.
pub mod realtime;
/// Room lifecycle and per-device room state.
pub mod room_service;
/// Active room selection, bootstrap and reconciliation.
pub mod snapshot_service;
/// Periodic session resume and sign-out checks.
pub mod watchdog;

use crate::{dao::models::AuthUser, error::ServiceError, state::SharedState};

/// Signed-in user, or [`ServiceError::Unauthenticated`].
pub(crate) async fn require_user(state: &SharedState) -> Result<AuthUser, ServiceError> {
    state
        .backend()
        .auth
        .current_user()
        .await?
        .ok_or(ServiceError::Unauthenticated)
}
