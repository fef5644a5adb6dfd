//! # hq-core
//!
//! Foundation types, errors, branded IDs, and utilities for the HQ control
//! plane.
//!
//! This crate provides the shared vocabulary that all other HQ crates depend
//! on:
//!
//! - **Branded IDs**: [`ids::SessionId`], [`ids::WorkerId`], [`ids::QuestionId`]
//!   and friends as prefixed newtypes
//! - **Errors**: [`errors::HqError`] taxonomy via `thiserror`, mapped to HTTP
//!   status codes at the API boundary
//! - **Session vocabulary**: [`session::SessionStatus`],
//!   [`session::StartupPhase`], [`session::MessageKind`] and the worker /
//!   question / share status enums
//! - **Retry**: [`retry::RetryConfig`] with exponential backoff and full jitter
//! - **Logging**: [`logging::init_tracing`] bootstrap for the binary
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by all other hq crates.

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod retry;
pub mod session;
