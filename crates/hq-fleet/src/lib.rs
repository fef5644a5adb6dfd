//! # hq-fleet
//!
//! Launching ephemeral workers on the compute fleet.
//!
//! [`backend::ComputeBackend`] is the seam: `spawn` submits a task with
//! per-session environment variables, `stop` cancels it, `describe` reports
//! its state. Production uses [`http::HttpFleetBackend`] against the fleet
//! scheduler; tests use [`mock::MockComputeBackend`].
//!
//! Resource requests are validated against the enumerated cpu/memory
//! combinations the backend supports before anything is submitted.

#![deny(unsafe_code)]

pub mod backend;
pub mod errors;
pub mod http;
pub mod mock;

pub use backend::{
    ComputeBackend, SpawnRequest, SpawnTracking, TaskState, TaskStatus, task_environment,
    task_tags, validate_resources,
};
pub use errors::{FleetError, Result};
pub use http::HttpFleetBackend;
pub use mock::MockComputeBackend;
