//! # hq-sync
//!
//! Periodic reconciliation of an object-store prefix with a local mirror
//! directory.
//!
//! - [`object_store::ObjectStore`] — paginated `list` + `get` seam, with an
//!   S3 implementation ([`s3::S3ObjectStore`]) and an in-memory one for
//!   tests ([`object_store::MemoryObjectStore`])
//! - [`state::SyncState`] — the on-disk change-detection cache at
//!   `<localDir>/.hq-sync-state.json`, always written atomically
//! - [`ignore::IgnoreRules`] — gitignore-style filter fed from
//!   `<localDir>/.hqignore` plus built-in defaults
//! - [`poller::SyncPoller`] — the poll cycle: list → diff → bounded
//!   concurrent downloads → delete policy → atomic state persist
//!
//! One poll cycle runs per poller at a time; an overlapping trigger emits
//! `pollSkipped` and returns. Errors are isolated per file within a cycle;
//! a listing failure aborts the cycle leaving state untouched.

#![deny(unsafe_code)]

pub mod errors;
pub mod ignore;
pub mod object_store;
pub mod poller;
pub mod s3;
pub mod state;

pub use errors::{Result, SyncError};
pub use ignore::IgnoreRules;
pub use object_store::{ListPage, MemoryObjectStore, ObjectStore, RemoteObject};
pub use poller::{DeletedFilePolicy, PollSummary, SyncConfig, SyncEvent, SyncPoller};
pub use s3::S3ObjectStore;
pub use state::{SyncState, SyncStateEntry};
