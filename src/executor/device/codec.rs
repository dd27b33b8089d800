//! Frame codec for the device link.
//!
//! # Wire Format
//!
//! ```text
//! +-------+--------------------+-------------------+----------+
//! | 0xA5  | Length (u16, LE)   | Payload (bincode) | Checksum |
//! +-------+--------------------+-------------------+----------+
//! ```
//!
//! - Maximum payload size: [`MAX_PAYLOAD`] bytes
//! - Checksum: wrapping sum of the payload bytes
//! - Bytes before a start marker are skipped, so a host that attaches to a
//!   device mid-stream resynchronizes on the next frame

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// First byte of every frame.
pub const FRAME_START: u8 = 0xA5;

/// Largest payload a frame may carry.
pub const MAX_PAYLOAD: usize = 4096;

const HEADER_LEN: usize = 3;

/// Errors on the device link.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame length exceeds [`MAX_PAYLOAD`]. Detected before buffering the payload.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("frame checksum mismatch: expected {expected:#04x}, computed {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },

    /// The payload could not be serialized or deserialized.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// The matrix cannot be represented in the wire encoding.
    #[error("cannot encode matrix: {reason}")]
    Unencodable { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wrapping sum of `payload`.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// Codec decoding frames into `In` and encoding `Out` into frames.
///
/// The host uses `FrameCodec<DeviceMessage, HostMessage>`; firmware
/// simulators use the reverse.
pub struct FrameCodec<In, Out> {
    _marker: PhantomData<fn(Out) -> In>,
}

impl<In, Out> FrameCodec<In, Out> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<In, Out> Default for FrameCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Out> std::fmt::Debug for FrameCodec<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec").finish()
    }
}

impl<In: DeserializeOwned, Out> Decoder for FrameCodec<In, Out> {
    type Item = In;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>, ProtocolError> {
        match src.iter().position(|byte| *byte == FRAME_START) {
            Some(0) => {}
            Some(skip) => {
                debug!(skipped = skip, "Resynchronizing on frame start");
                src.advance(skip);
            }
            None => {
                src.clear();
                return Ok(None);
            }
        }

        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u16::from_le_bytes([src[1], src[2]]) as usize;
        if len > MAX_PAYLOAD {
            src.advance(1);
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_PAYLOAD,
            });
        }

        let total = HEADER_LEN + len + 1;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        let payload = &frame[HEADER_LEN..HEADER_LEN + len];
        let expected = frame[total - 1];
        let actual = checksum(payload);
        if expected != actual {
            return Err(ProtocolError::Checksum { expected, actual });
        }

        bincode::deserialize(payload)
            .map(Some)
            .map_err(|e| ProtocolError::Serialization {
                reason: e.to_string(),
            })
    }
}

impl<In, Out: Serialize> Encoder<Out> for FrameCodec<In, Out> {
    type Error = ProtocolError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload = bincode::serialize(&item).map_err(|e| ProtocolError::Serialization {
            reason: e.to_string(),
        })?;
        if payload.len() > MAX_PAYLOAD {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        dst.reserve(HEADER_LEN + payload.len() + 1);
        dst.put_u8(FRAME_START);
        dst.put_u16_le(payload.len() as u16);
        dst.extend_from_slice(&payload);
        dst.put_u8(checksum(&payload));
        Ok(())
    }
}
