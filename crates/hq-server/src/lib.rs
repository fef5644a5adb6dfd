//! # hq-server
//!
//! The user-facing surface of the HQ control plane:
//!
//! - [`ws::registry::ConnectionRegistry`] — process-wide key → socket map
//!   with replace-on-duplicate and heartbeat liveness
//! - [`auth`] — API keys with per-key token buckets, and single-use session
//!   access tokens
//! - [`sessions::SessionService`] — per-session actors driving the
//!   `starting → active → stopped|errored` state machine and its timers
//! - [`blocker::QuestionBlocker`] — suspends a worker on a question until a
//!   human answers
//! - [`ws::relay`] / [`ws::browser`] — the two WebSocket endpoints and the
//!   bidirectional pump between them
//! - [`http`] — the JSON API
//!
//! Construction goes through [`services::Services`]: an explicit container
//! built once at process start (tests build fresh containers instead of
//! resetting globals).

#![deny(unsafe_code)]

pub mod auth;
pub mod blocker;
pub mod error;
pub mod http;
pub mod metrics;
pub mod services;
pub mod sessions;
pub mod ws;

pub use services::{AppState, Services};
