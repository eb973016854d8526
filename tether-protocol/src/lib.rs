//! tether-protocol: Shared wire definitions for the streaming session channel
//!
//! This crate defines the envelope types and the text-frame codec used for
//! communication between a tether client and the assistant backend over a
//! duplex socket.

pub mod codec;
pub mod envelope;

// Re-export main types at crate root
pub use codec::{CodecError, EnvelopeCodec, MAX_FRAME_SIZE};
pub use envelope::{now_millis, Body, ControlSignal, DeliveryStatus, Envelope};

/// Current protocol version, carried in the hello control frame
pub const PROTOCOL_VERSION: u32 = 1;
