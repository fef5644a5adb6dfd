//! # hq-store
//!
//! SQLite persistence for the HQ control plane: sessions, session messages
//! (dense per-session sequence numbers), workers, pending questions, API
//! keys, and shares.
//!
//! All write methods are transactional — callers never observe partial
//! state. Session writes are serialized per-session via in-process mutex
//! locks; the `UNIQUE(session_id, sequence)` constraint enforces message
//! ordering at the database level as well.

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod migrations;
pub mod records;
pub mod store;

pub use connection::{ConnectionConfig, ConnectionPool, new_file, new_in_memory};
pub use errors::{Result, StoreError};
pub use records::*;
pub use store::Store;
