//! Device-local key-value persistence that survives reloads: last room, resume markers,
//! draw guards and per-round caches.

use std::{
    collections::HashMap,
    fs, io,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::SystemTime,
};

use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::clock::{from_millis, to_millis};

const KEY_LAST_ROOM: &str = "room.last_id";
const KEY_NO_RESUME: &str = "room.no_resume_at";
const KEY_LAST_DRAW: &str = "draw.last_at";
const KEY_PAUSED: &str = "draw.paused";
const KEY_WINNER_ROUND: &str = "round.winner";
const KEY_MARKED: &str = "round.marked";
const KEY_CLAIMED: &str = "round.claimed";
const KEY_SESSION_MARKER: &str = "device.session_marker";

/// Every key tied to a room. They are always cleared together.
const ROOM_KEYS: &[&str] = &[
    KEY_LAST_ROOM,
    KEY_NO_RESUME,
    KEY_LAST_DRAW,
    KEY_PAUSED,
    KEY_WINNER_ROUND,
    KEY_MARKED,
    KEY_CLAIMED,
];

/// Keys holding per-round caches, reset when a new round starts.
const ROUND_KEYS: &[&str] = &[KEY_LAST_DRAW, KEY_WINNER_ROUND, KEY_MARKED, KEY_CLAIMED];

/// Failures raised by a local storage backend.
#[derive(Debug, Error)]
pub enum LocalStorageError {
    /// Reading or writing the backing file failed.
    #[error("local storage i/o failed for `{path}`")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    /// The backing file could not be encoded or decoded.
    #[error("local storage payload is invalid")]
    Encoding(#[from] serde_json::Error),
}

/// Minimal key-value contract offered by the device.
pub trait LocalStorage: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Option<String>;
    /// Write a value.
    fn set(&self, key: &str, value: String) -> Result<(), LocalStorageError>;
    /// Remove several keys in one write.
    fn remove_many(&self, keys: &[&str]) -> Result<(), LocalStorageError>;
}

/// Volatile storage, used by tests and by clients without a writable disk.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LocalStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) -> Result<(), LocalStorageError> {
        self.entries().insert(key.to_string(), value);
        Ok(())
    }

    fn remove_many(&self, keys: &[&str]) -> Result<(), LocalStorageError> {
        let mut entries = self.entries();
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }
}

/// JSON file storage. The whole map is rewritten on every change.
#[derive(Debug)]
pub struct JsonFileStorage {
    path: PathBuf,
    cache: Mutex<HashMap<String, String>>,
}

impl JsonFileStorage {
    /// Open the file at `path`, starting empty when it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LocalStorageError> {
        let path = path.into();
        let cache = match fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => HashMap::new(),
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => {
                return Err(LocalStorageError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };

        Ok(Self {
            path,
            cache: Mutex::new(cache),
        })
    }

    fn flush(&self, entries: &HashMap<String, String>) -> Result<(), LocalStorageError> {
        let payload = serde_json::to_string_pretty(entries)?;
        fs::write(&self.path, payload).map_err(|source| LocalStorageError::Io {
            path: self.path.display().to_string(),
            source,
        })
    }
}

impl LocalStorage for JsonFileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: String) -> Result<(), LocalStorageError> {
        let mut entries = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(key.to_string(), value);
        self.flush(&entries)
    }

    fn remove_many(&self, keys: &[&str]) -> Result<(), LocalStorageError> {
        let mut entries = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for key in keys {
            entries.remove(*key);
        }
        self.flush(&entries)
    }
}

/// Typed view over [`LocalStorage`] exposing the hints the client persists.
///
/// Write failures are logged and swallowed: every hint is advisory and gets
/// cross-checked against the server before being trusted.
#[derive(Clone)]
pub struct DeviceStore {
    storage: Arc<dyn LocalStorage>,
}

impl DeviceStore {
    /// Wrap a storage backend.
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self { storage }
    }

    /// In-memory device, handy for tests.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    fn write(&self, key: &str, value: String) {
        if let Err(err) = self.storage.set(key, value) {
            warn!(key, error = %err, "failed to persist device hint");
        }
    }

    fn clear(&self, keys: &[&str]) {
        if let Err(err) = self.storage.remove_many(keys) {
            warn!(?keys, error = %err, "failed to clear device hints");
        }
    }

    /// Room the device was last inside.
    pub fn last_room_id(&self) -> Option<Uuid> {
        self.storage
            .get(KEY_LAST_ROOM)
            .and_then(|raw| Uuid::parse_str(&raw).ok())
    }

    /// Remember the active room and drop any "no auto-resume" marker.
    pub fn set_last_room_id(&self, room_id: Uuid) {
        self.write(KEY_LAST_ROOM, room_id.to_string());
        self.clear(&[KEY_NO_RESUME]);
    }

    /// Marker set when the user explicitly left a room.
    pub fn no_resume_marker(&self) -> Option<SystemTime> {
        self.read_millis(KEY_NO_RESUME)
    }

    /// Record that the user left on purpose and must not be pulled back in.
    pub fn set_no_resume_marker(&self, at: SystemTime) {
        self.write(KEY_NO_RESUME, to_millis(at).to_string());
    }

    /// Local stamp of the last draw this device performed or observed.
    pub fn last_draw_at(&self) -> Option<SystemTime> {
        self.read_millis(KEY_LAST_DRAW)
    }

    /// Persist the local draw stamp.
    pub fn set_last_draw_at(&self, at: SystemTime) {
        self.write(KEY_LAST_DRAW, to_millis(at).to_string());
    }

    /// Whether the host paused automatic draws on this device.
    pub fn is_paused(&self) -> bool {
        self.storage.get(KEY_PAUSED).as_deref() == Some("1")
    }

    /// Toggle the local pause flag.
    pub fn set_paused(&self, paused: bool) {
        if paused {
            self.write(KEY_PAUSED, "1".into());
        } else {
            self.clear(&[KEY_PAUSED]);
        }
    }

    /// Round for which this device recorded a winner.
    pub fn winner_round(&self) -> Option<u32> {
        self.storage
            .get(KEY_WINNER_ROUND)
            .and_then(|raw| raw.parse().ok())
    }

    /// Record a winner for `round`.
    pub fn set_winner_round(&self, round: u32) {
        self.write(KEY_WINNER_ROUND, round.to_string());
    }

    /// Numbers the player marked on their card this round.
    pub fn marked_numbers(&self) -> Vec<u8> {
        self.read_json(KEY_MARKED).unwrap_or_default()
    }

    /// Replace the marked numbers cache.
    pub fn set_marked_numbers(&self, numbers: &[u8]) {
        self.write_json(KEY_MARKED, &numbers);
    }

    /// Prizes the player already claimed this round.
    pub fn claimed_prizes(&self) -> Vec<String> {
        self.read_json(KEY_CLAIMED).unwrap_or_default()
    }

    /// Replace the claimed prizes cache.
    pub fn set_claimed_prizes(&self, prizes: &[String]) {
        self.write_json(KEY_CLAIMED, &prizes);
    }

    /// Stable marker identifying this device's session, created on first use.
    pub fn session_marker(&self) -> String {
        if let Some(marker) = self.storage.get(KEY_SESSION_MARKER) {
            return marker;
        }
        let marker = Uuid::new_v4().simple().to_string();
        self.write(KEY_SESSION_MARKER, marker.clone());
        marker
    }

    /// Drop every room-scoped key at once.
    pub fn clear_room_state(&self) {
        self.clear(ROOM_KEYS);
    }

    /// Drop the per-round caches while keeping the room id.
    pub fn clear_round_state(&self) {
        self.clear(ROUND_KEYS);
    }

    fn read_millis(&self, key: &str) -> Option<SystemTime> {
        self.storage
            .get(key)
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(from_millis)
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.storage.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "discarding unreadable device cache");
                None
            }
        }
    }

    fn write_json<T: serde::Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(payload) => self.write(key, payload),
            Err(err) => warn!(key, error = %err, "failed to encode device cache"),
        }
    }
}
