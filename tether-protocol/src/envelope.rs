//! Wire envelope types
//!
//! One [`Envelope`] is one frame on the wire: an id, an optional session
//! binding, a capture timestamp, and a kind-discriminated body.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// One wire message unit.
///
/// `id` is unique per logical message for the lifetime of a channel: minted
/// locally (UUID v4) for user commands, assigned by the remote for
/// assistant-originated messages. `session_id` absent means "create a new
/// session"; once the remote returns one it is bound to all subsequent
/// envelopes of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Capture time in epoch milliseconds, monotone per sender
    #[serde(default)]
    pub timestamp: i64,

    #[serde(flatten)]
    pub body: Body,
}

/// Kind-specific envelope payload, discriminated by `type` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    /// Outbound user text
    UserCommand { content: String },

    /// Remote begins a chunked response
    StreamStart,

    /// One incremental delta of a chunked response
    StreamChunk { delta: String },

    /// Remote finished a chunked response
    StreamEnd,

    /// Non-streamed reply or session-creation acknowledgment
    FullMessage { content: String },

    /// Delivery bookkeeping for a user command, keyed by envelope id
    StatusUpdate { status: DeliveryStatus },

    /// Keep-alive, handshake, and abort signaling
    SystemControl { signal: ControlSignal },

    /// Remote-reported error; only `fatal` ones take the connection down
    ErrorNotice {
        message: String,
        #[serde(default)]
        fatal: bool,
    },
}

impl Body {
    /// Short kind name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Body::UserCommand { .. } => "user_command",
            Body::StreamStart => "stream_start",
            Body::StreamChunk { .. } => "stream_chunk",
            Body::StreamEnd => "stream_end",
            Body::FullMessage { .. } => "full_message",
            Body::StatusUpdate { .. } => "status_update",
            Body::SystemControl { .. } => "system_control",
            Body::ErrorNotice { .. } => "error_notice",
        }
    }
}

/// Control signals carried by [`Body::SystemControl`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    /// Connect handshake carrying the bearer credential
    Hello { token: String, protocol_version: u32 },
    /// Keep-alive probe
    Ping,
    /// Keep-alive answer
    Pong,
    /// Ask the remote to stop producing the in-flight response
    Abort,
    /// Server-initiated close; the client must not reconnect
    Shutdown,
    /// Placeholder for frame kinds this client does not understand
    Unknown,
}

/// Delivery status of a user-originated message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Queued,
    Sending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    /// Terminal statuses never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }
}

impl Envelope {
    /// Build an envelope with the given body, stamping the capture time
    pub fn new(id: impl Into<String>, session_id: Option<String>, body: Body) -> Self {
        Self {
            id: id.into(),
            session_id,
            timestamp: now_millis(),
            body,
        }
    }

    /// Build a user command envelope
    pub fn user_command(
        id: impl Into<String>,
        session_id: Option<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            session_id,
            Body::UserCommand {
                content: content.into(),
            },
        )
    }

    /// Build a control envelope with a freshly minted id
    pub fn control(signal: ControlSignal) -> Self {
        Self::new(
            Uuid::new_v4().to_string(),
            None,
            Body::SystemControl { signal },
        )
    }
}

/// Current time as epoch milliseconds
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
