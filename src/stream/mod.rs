//! Realtime stream modules.
//!
//! - `proto`: request and response envelopes and the message format.
//! - `connection`: websocket transport with automatic reconnects.
//! - `subscription`: per-subscription delivery, gap detection and resend
//!   buffering.
//! - `session`: session token with periodic refresh.
//! - `client`: routing between all of the above.

/// Client handle and routing task.
pub mod client;
/// Websocket connection and its state machine.
pub mod connection;
/// Stream protocol messages.
pub mod proto;
mod registry;
/// Session token keeper.
pub mod session;
/// Subscription delivery state machine.
pub mod subscription;
