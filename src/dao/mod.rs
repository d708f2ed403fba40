/// Device-local key-value persistence.
pub mod local;
/// Row definitions shared by every backend.
pub mod models;
/// Backend abstractions and implementations.
pub mod room_store;
/// Storage error types.
pub mod storage;
