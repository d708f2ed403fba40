//! Runtime configuration for the synchronization core: poll cadences, guard windows,
//! watchdog thresholds.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

/// Default location on disk where the client looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/sync.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "BINGO_SYNC_CONFIG_PATH";

/// Highest number a bingo ball can carry.
pub const DEFAULT_MAX_NUMBER: u8 = 75;

/// When the draw coordinator records its local draw stamp relative to the server write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawStampPolicy {
    /// Stamp before the write is confirmed. A failed write then skips one
    /// interval on this device instead of retrying on the next tick.
    BeforeWrite,
    /// Stamp only after the server accepted the write.
    AfterConfirm,
}

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the client session.
pub struct SyncConfig {
    /// Backstop poll cadence while the change feed is healthy.
    pub safety_poll: Duration,
    /// Poll cadence while the change feed is errored or closed.
    pub aggressive_poll: Duration,
    /// Presence heartbeat cadence.
    pub heartbeat: Duration,
    /// Stale participant sweep cadence.
    pub stale_sweep: Duration,
    /// Participants not touched for this long are removed by the sweep.
    pub stale_threshold: Duration,
    /// Minimum age of the room's last update before a draw is trusted.
    pub guard_window: Duration,
    /// How many due-checks run per draw interval.
    pub draw_checks_per_interval: u32,
    /// Draw interval used when a room carries no usable value.
    pub default_draw_interval: Duration,
    /// Watchdog cadence.
    pub watchdog_interval: Duration,
    /// Idle time after which the watchdog signs the user out.
    pub inactivity_timeout: Duration,
    /// Delay before confirming that a room really finished or vanished.
    pub finish_recheck_delay: Duration,
    /// Rejections after which a user can no longer join a room.
    pub ban_threshold: u32,
    /// Highest drawable number.
    pub max_number: u8,
    /// Ordering of the local draw stamp versus the server write.
    pub draw_stamp_policy: DrawStampPolicy,
}

impl SyncConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let config: Self = raw.into();
                    info!(path = %path.display(), "loaded sync config");
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse sync config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "sync config not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read sync config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Period of the local due-check timer for a room drawing every `interval`.
    pub fn draw_check_period(&self, interval: Duration) -> Duration {
        let checks = self.draw_checks_per_interval.max(1);
        (interval / checks).max(Duration::from_millis(100))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            safety_poll: Duration::from_secs(12),
            aggressive_poll: Duration::from_secs(3),
            heartbeat: Duration::from_secs(10),
            stale_sweep: Duration::from_secs(45),
            stale_threshold: Duration::from_secs(60),
            guard_window: Duration::from_secs(3),
            draw_checks_per_interval: 5,
            default_draw_interval: Duration::from_secs(10),
            watchdog_interval: Duration::from_secs(5),
            inactivity_timeout: Duration::from_secs(15 * 60),
            finish_recheck_delay: Duration::from_millis(1_500),
            ban_threshold: 2,
            max_number: DEFAULT_MAX_NUMBER,
            draw_stamp_policy: DrawStampPolicy::BeforeWrite,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
/// JSON representation of the configuration file; every field is optional.
struct RawConfig {
    safety_poll_ms: Option<u64>,
    aggressive_poll_ms: Option<u64>,
    heartbeat_ms: Option<u64>,
    stale_sweep_ms: Option<u64>,
    stale_threshold_ms: Option<u64>,
    guard_window_ms: Option<u64>,
    draw_checks_per_interval: Option<u32>,
    default_draw_interval_ms: Option<u64>,
    watchdog_interval_ms: Option<u64>,
    inactivity_timeout_ms: Option<u64>,
    finish_recheck_delay_ms: Option<u64>,
    ban_threshold: Option<u32>,
    max_number: Option<u8>,
    draw_stamp_policy: Option<DrawStampPolicy>,
}

impl From<RawConfig> for SyncConfig {
    fn from(raw: RawConfig) -> Self {
        let defaults = Self::default();
        let ms = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };
        // Timer periods and windows of zero would spin or panic the loops.
        let period = |value: Option<u64>, fallback: Duration| {
            value
                .map(Duration::from_millis)
                .filter(|period| !period.is_zero())
                .unwrap_or(fallback)
        };

        Self {
            safety_poll: period(raw.safety_poll_ms, defaults.safety_poll),
            aggressive_poll: period(raw.aggressive_poll_ms, defaults.aggressive_poll),
            heartbeat: period(raw.heartbeat_ms, defaults.heartbeat),
            stale_sweep: period(raw.stale_sweep_ms, defaults.stale_sweep),
            stale_threshold: period(raw.stale_threshold_ms, defaults.stale_threshold),
            guard_window: ms(raw.guard_window_ms, defaults.guard_window),
            draw_checks_per_interval: raw
                .draw_checks_per_interval
                .filter(|checks| *checks > 0)
                .unwrap_or(defaults.draw_checks_per_interval),
            default_draw_interval: period(
                raw.default_draw_interval_ms,
                defaults.default_draw_interval,
            ),
            watchdog_interval: period(raw.watchdog_interval_ms, defaults.watchdog_interval),
            inactivity_timeout: period(raw.inactivity_timeout_ms, defaults.inactivity_timeout),
            finish_recheck_delay: ms(raw.finish_recheck_delay_ms, defaults.finish_recheck_delay),
            ban_threshold: raw.ban_threshold.unwrap_or(defaults.ban_threshold),
            max_number: raw
                .max_number
                .filter(|max| *max > 0)
                .unwrap_or(defaults.max_number),
            draw_stamp_policy: raw.draw_stamp_policy.unwrap_or(defaults.draw_stamp_policy),
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
