//! Consumer-facing notification surface
//!
//! The channel drives exactly one observer; fanning out to multiple UI
//! surfaces is the observer's own responsibility.

use tether_protocol::DeliveryStatus;

use crate::channel::ConnectionState;

/// Errors surfaced to the observer.
///
/// None of these cross the public API as return values or panics; transport
/// and protocol failures are handled locally and reported here.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Inbound frame could not be decoded: {0}")]
    Decode(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Duplicate stream start for message {0}")]
    DuplicateStreamStart(String),

    #[error("No open stream or pending message with id {0}")]
    UnknownCorrelation(String),

    #[error("Message {0} not sent: channel is not connected")]
    NotConnected(String),

    #[error("No delivery confirmation for message {0} within the allowed window")]
    DeliveryTimeout(String),

    #[error("Stream for message {0} interrupted by connection loss")]
    StreamInterrupted(String),

    #[error("Message {0} cancelled")]
    Aborted(String),

    #[error("Remote error: {message}")]
    Remote { message: String, fatal: bool },
}

/// Callback surface through which a consumer observes the channel.
///
/// All methods default to no-ops so implementers subscribe only to what
/// they care about. Called from the channel's driver task; implementations
/// should hand off promptly rather than block.
pub trait ChannelObserver: Send {
    /// Connection lifecycle change
    fn on_state_changed(&mut self, _state: ConnectionState) {}

    /// Remote began a streamed response
    fn on_stream_started(&mut self, _id: &str) {}

    /// Non-streamed message arrived complete
    fn on_message_delivered(&mut self, _id: &str, _content: &str) {}

    /// One incremental delta of a streamed response
    fn on_stream_delta(&mut self, _id: &str, _delta: &str) {}

    /// Streamed response finished; `text` is the full assembled content
    fn on_stream_complete(&mut self, _id: &str, _text: &str) {}

    /// Delivery status of a user-originated message changed
    fn on_status_changed(&mut self, _id: &str, _status: DeliveryStatus) {}

    /// Non-fatal (or already-handled) failure
    fn on_error(&mut self, _error: &ChannelError) {}
}
