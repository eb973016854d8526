//! tether-channel: Streaming session channel over a duplex socket
//!
//! The core client of tether. A [`SessionChannel`] owns one [`Connection`]
//! to an assistant backend, applies a [`ReconnectPolicy`] on failure, tracks
//! delivery of user-originated messages, and assembles streamed partial
//! responses into complete messages. Consumers observe it through a
//! [`ChannelObserver`].

pub mod auth;
pub mod backoff;
pub mod channel;
pub mod config;
pub mod connection;
pub mod observer;

pub use auth::{StaticToken, TokenProvider};
pub use backoff::ReconnectPolicy;
pub use channel::{ConnectionState, SessionChannel};
pub use config::{ChannelConfig, KeepaliveConfig};
pub use connection::{CloseReason, Connection, ConnectionEvent};
pub use observer::{ChannelError, ChannelObserver};
