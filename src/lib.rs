//! Rust client for a pub/sub stream service over websockets.
//!
//! The crate is organized by transport surface:
//! - `stream`: websocket connection, wire codec, subscriptions and the
//!   client that ties them together.
//! - `rest`: HTTP client for login and stream management.
//! - `config`: client options and their validation.
//! - `retry`: shared retry helpers for HTTP calls.

/// Client options.
pub mod config;
/// REST client for session tokens and stream records.
pub mod rest;
/// Retry helpers used by the REST client.
pub mod retry;
/// Realtime stream client, protocol types and subscription state.
pub mod stream;

pub use config::{ClientOptions, ConfigError};
pub use rest::{RestClient, RestClientOptions, RestError, StreamRecord};
pub use stream::client::{
    Client, ClientError, ClientEvent, StreamTarget, SubscribeOptions, SubscriptionHandle,
};
pub use stream::proto::{ResendOptions, StreamMessage};
pub use stream::subscription::{SubscriptionEvent, SubscriptionId, SubscriptionState};
