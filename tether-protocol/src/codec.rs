//! Frame codec for the session channel
//!
//! Frames are newline-delimited JSON objects, one [`Envelope`] per line.
//! The format is self-describing: a `type` discriminator plus kind-specific
//! fields. Unknown `type` values decode to an ignorable control frame so
//! additions from a newer remote do not fail the whole decode.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::{Body, ControlSignal, Envelope};

/// Maximum frame size (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frame kinds this codec decodes into typed bodies
const KNOWN_KINDS: [&str; 8] = [
    "user_command",
    "stream_start",
    "stream_chunk",
    "stream_end",
    "full_message",
    "status_update",
    "system_control",
    "error_notice",
];

/// Frame codec error
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Codec for [`Envelope`] frames in both directions
#[derive(Debug, Default)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_FRAME_SIZE {
                    return Err(CodecError::FrameTooLarge {
                        size: src.len(),
                        max: MAX_FRAME_SIZE,
                    });
                }
                return Ok(None);
            };

            if pos > MAX_FRAME_SIZE {
                return Err(CodecError::FrameTooLarge {
                    size: pos,
                    max: MAX_FRAME_SIZE,
                });
            }

            let line = src.split_to(pos + 1);
            let line = &line[..pos];

            // Tolerate blank keep-alive lines between frames
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            return decode_envelope(line).map(Some);
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data =
            serde_json::to_vec(&item).map_err(|e| CodecError::Malformed(e.to_string()))?;

        if data.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge {
                size: data.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(data.len() + 1);
        dst.put_slice(&data);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Decode one frame line into an [`Envelope`].
///
/// Frames whose `type` is not in [`KNOWN_KINDS`] are mapped to
/// `SystemControl { signal: Unknown }` instead of failing.
fn decode_envelope(line: &[u8]) -> Result<Envelope, CodecError> {
    let value: serde_json::Value =
        serde_json::from_slice(line).map_err(|e| CodecError::Malformed(e.to_string()))?;

    let obj = value
        .as_object()
        .ok_or_else(|| CodecError::Malformed("frame is not a JSON object".into()))?;

    let kind = obj
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CodecError::Malformed("missing type discriminator".into()))?;

    if !KNOWN_KINDS.contains(&kind) {
        return Ok(Envelope {
            id: obj
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            session_id: obj
                .get("session_id")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            timestamp: obj
                .get("timestamp")
                .and_then(|v| v.as_i64())
                .unwrap_or_default(),
            body: Body::SystemControl {
                signal: ControlSignal::Unknown,
            },
        });
    }

    serde_json::from_value(value).map_err(|e| CodecError::Malformed(e.to_string()))
}
