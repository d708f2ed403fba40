//! Room session synchronization core for a multiplayer bingo client.
//!
//! The crate keeps one client's view of a shared room consistent with the
//! backend: snapshot reconciliation, the change-feed subscription with its
//! polling fallback, host-side number draws, participant admission and the
//! session resume watchdog. UI code builds one [`state::ClientState`] per
//! application session and drives it through the functions of [`services`].

pub mod clock;
pub mod config;
/// Backend collaborators and device-local persistence.
pub mod dao;
/// Errors surfaced by the services.
pub mod error;
pub mod services;
pub mod state;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use crate::{
    config::SyncConfig,
    error::ServiceError,
    state::{ClientState, SharedState},
};

/// Configure tracing subscribers for hosts that do not install their own.
///
/// Does nothing when a global subscriber is already set.
pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
