//! In-memory backend shared by every simulated device, used by tests and offline demos.

mod store;

pub use self::store::MemoryRoomStore;
