// src/core/protocol/frame.rs

//! Implements the message frame structure exchanged with the KeySync service
//! and the corresponding `Encoder` and `Decoder` for network communication.
//!
//! The wire format is one JSON document per line. Everything below the frame
//! (sockets, TLS, proxying) is the transport's concern; everything above it
//! (correlation, timeouts, command semantics) belongs to the connection and
//! session layers.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::core::KeySyncError;

/// Frames larger than this are rejected before parsing to bound memory use
/// against a misbehaving peer.
const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// A single message on the session transport.
///
/// `Request` and `Ack` are correlated by `id`; the connection guarantees each
/// id resolves at most once. `Event` is fire-and-forget in both directions:
/// the client uses it for nothing today, the server uses it for watch
/// notifications and pushed errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Event {
        name: String,
        #[serde(default)]
        payload: Value,
    },
    Request {
        id: u64,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Ack {
        id: u64,
        #[serde(default)]
        payload: Value,
    },
}

/// A `tokio_util::codec` implementation for newline-delimited JSON frames.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = KeySyncError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        loop {
            let Some(newline) = src.iter().position(|byte| *byte == b'\n') else {
                if src.len() > MAX_FRAME_LENGTH {
                    return Err(KeySyncError::FrameTooLarge(src.len()));
                }
                return Ok(None);
            };

            if newline > MAX_FRAME_LENGTH {
                return Err(KeySyncError::FrameTooLarge(newline));
            }

            let mut line = src.split_to(newline + 1);
            line.truncate(newline);
            // Tolerate CRLF peers.
            if line.last() == Some(&b'\r') {
                line.truncate(newline - 1);
            }

            if line.is_empty() {
                continue;
            }

            let frame = serde_json::from_slice(&line)
                .map_err(|e| KeySyncError::Protocol(format!("invalid frame: {e}")))?;
            return Ok(Some(frame));
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = KeySyncError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded = serde_json::to_vec(&item)?;
        dst.reserve(encoded.len() + 1);
        dst.extend_from_slice(&encoded);
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

impl Frame {
    /// A convenience method to encode a frame into a `Vec<u8>`, newline
    /// included.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, KeySyncError> {
        let mut buf = BytesMut::new();
        FrameCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }
}
