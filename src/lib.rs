//! Offline sync server for fuel and maintenance logs.
//!
//! Field devices queue creates, updates and deletes while offline and upload
//! them in batches. The server applies what it can, reports stale edits as
//! conflicts instead of overwriting newer data, and keeps a per-user
//! checkpoint of the last sync.

pub mod clock;
pub mod config;
pub mod identity;
pub mod server;
pub mod store;
pub mod sync;

/// Crate version, reported by `/health`.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
