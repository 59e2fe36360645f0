//! rsmsl - Rust client for an MSL-style encrypted manifest service.
//!
//! This crate provides:
//! - Device identity (ESN + RSA key) and entity/user authentication claims.
//! - Key exchange, session keys, and a persistent key cache with expiry.
//! - Authenticated encryption, message framing, and replay protection.
//! - Manifest requests, tolerant manifest parsing, and format classification.
//!
//! Feature flags:
//! - `cli`: enable the CLI binary.
//! - `http`: enable the reqwest-backed HTTPS transport.
//! - `chrono`: use chrono for timestamps in CLI output.
//! - `tracing`: enable tracing macros.
#![allow(clippy::result_large_err)]

#[macro_use]
mod macros;

/// Entity and user authentication claims.
pub mod auth;
/// Format classification rules and capability sets.
pub mod classify;
/// Manifest lookup orchestration.
pub mod client;
/// Authenticated encryption and replay protection.
pub mod codec;
/// Client configuration.
pub mod config;
/// Device identity: ESN and RSA key pair.
pub mod device;
/// Common error types and Result alias.
pub mod error;
/// Key exchange.
pub mod handshake;
/// Persistent session key cache.
pub mod keystore;
/// Manifest parsing.
pub mod manifest;
/// Wire framing for protocol messages.
pub mod message;
/// Manifest request construction.
pub mod request;
/// Session keys and live session state.
pub mod session;
/// Request/response transport.
pub mod transport;
/// Shared helper utilities.
pub mod utils;
