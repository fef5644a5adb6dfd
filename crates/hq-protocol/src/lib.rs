//! # hq-protocol
//!
//! The wire vocabulary of the relay: one closed tagged union per direction,
//! plus the `{type, payload, timestamp}` envelope used on the browser-facing
//! channel and the newline-delimited codec used on the worker channel.
//!
//! - [`browser::BrowserInEvent`] — frames the browser sends the server
//! - [`browser::BrowserOutEvent`] — frames the server sends the browser,
//!   always wrapped in an [`envelope::Envelope`]
//! - [`worker::WorkerFrame`] — newline-delimited frames a worker emits
//! - [`worker::WorkerCommand`] — newline-delimited frames sent to a worker
//!
//! Decoding is strict on the browser side: invalid JSON or an unknown `type`
//! is a [`ProtocolError`] that fails the connection. Worker decoding is
//! lenient at the call site — workers may interleave stderr noise, so the
//! relay logs and drops bad lines instead of terminating.
//!
//! This crate is I/O-free; framing over sockets lives in the server crate.

#![deny(unsafe_code)]

pub mod browser;
pub mod envelope;
pub mod worker;

pub use browser::{BrowserInEvent, BrowserOutEvent, PermissionBehavior};
pub use envelope::Envelope;
pub use worker::{QuestionOption, WorkerCommand, WorkerFrame};

use thiserror::Error;

/// Codec failure on a relay channel.
///
/// Carries the wire-level close code `PROTOCOL_ERROR` semantics: the
/// enclosing browser connection is failed when one of these surfaces.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON.
    #[error("invalid JSON frame: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// The frame's `type` is not in the closed set for its direction.
    #[error("unknown frame type: {0}")]
    UnknownType(String),
}

impl From<ProtocolError> for hq_core::errors::HqError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol {
            message: err.to_string(),
        }
    }
}
