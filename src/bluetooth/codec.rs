// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Length-prefixed framing.
//!
//! Frame layout: `[type:1][length:4 BE][payload]`.

use std::collections::VecDeque;

use tracing::{debug, warn};
use uuid::Uuid;

use super::protocol::{Frame, FrameType, HandshakePayload};
use crate::error::CodecError;

/// Size of the frame header (type byte plus length).
pub const HEADER_LEN: usize = 5;

/// Largest payload accepted in either direction.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

const ID_LEN: usize = 16;
const TIMESTAMP_LEN: usize = 8;
const IMAGE_SIZE_LEN: usize = 4;

/// Encode a frame for the wire.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let payload = encode_payload(frame)?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(frame.frame_type().as_byte());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn encode_payload(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let payload = match frame {
        Frame::ConnectRequest(handshake) | Frame::Accept(handshake) => {
            serde_json::to_vec(handshake).map_err(|e| CodecError::CorruptFrame(e.to_string()))?
        }
        Frame::Reject | Frame::Withdraw | Frame::Disconnect => Vec::new(),
        Frame::Text {
            id,
            timestamp,
            text,
        } => {
            let mut out = Vec::with_capacity(ID_LEN + TIMESTAMP_LEN + text.len());
            out.extend_from_slice(id.as_bytes());
            out.extend_from_slice(&timestamp.to_be_bytes());
            out.extend_from_slice(text.as_bytes());
            out
        }
        Frame::Image {
            id,
            timestamp,
            data,
        } => {
            let size = u32::try_from(data.len())
                .map_err(|_| CodecError::PayloadTooLarge(data.len()))?;
            let mut out =
                Vec::with_capacity(ID_LEN + TIMESTAMP_LEN + IMAGE_SIZE_LEN + data.len());
            out.extend_from_slice(id.as_bytes());
            out.extend_from_slice(&timestamp.to_be_bytes());
            out.extend_from_slice(&size.to_be_bytes());
            out.extend_from_slice(data);
            out
        }
        Frame::Ack { id } => id.as_bytes().to_vec(),
    };
    Ok(payload)
}

/// Decode the payload of a complete frame.
pub fn decode_payload(frame_type: FrameType, payload: &[u8]) -> Result<Frame, CodecError> {
    match frame_type {
        FrameType::ConnectRequest => Ok(Frame::ConnectRequest(decode_handshake(payload)?)),
        FrameType::Accept => Ok(Frame::Accept(decode_handshake(payload)?)),
        FrameType::Reject => expect_empty(payload, Frame::Reject),
        FrameType::Withdraw => expect_empty(payload, Frame::Withdraw),
        FrameType::Disconnect => expect_empty(payload, Frame::Disconnect),
        FrameType::Text => {
            let (id, timestamp, rest) = split_message_header(payload)?;
            let text = std::str::from_utf8(rest)
                .map_err(|e| CodecError::CorruptFrame(format!("text is not utf-8: {}", e)))?;
            Ok(Frame::Text {
                id,
                timestamp,
                text: text.to_string(),
            })
        }
        FrameType::Image => {
            let (id, timestamp, rest) = split_message_header(payload)?;
            if rest.len() < IMAGE_SIZE_LEN {
                return Err(CodecError::CorruptFrame("image size missing".into()));
            }
            let declared =
                u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            let data = &rest[IMAGE_SIZE_LEN..];
            if data.len() != declared {
                return Err(CodecError::CorruptFrame(format!(
                    "image size mismatch: declared {}, got {}",
                    declared,
                    data.len()
                )));
            }
            Ok(Frame::Image {
                id,
                timestamp,
                data: data.to_vec(),
            })
        }
        FrameType::Ack => {
            if payload.len() != ID_LEN {
                return Err(CodecError::CorruptFrame(format!(
                    "ack payload must be {} bytes, got {}",
                    ID_LEN,
                    payload.len()
                )));
            }
            Ok(Frame::Ack {
                id: read_uuid(payload),
            })
        }
    }
}

fn decode_handshake(payload: &[u8]) -> Result<HandshakePayload, CodecError> {
    serde_json::from_slice(payload)
        .map_err(|e| CodecError::CorruptFrame(format!("bad handshake: {}", e)))
}

fn expect_empty(payload: &[u8], frame: Frame) -> Result<Frame, CodecError> {
    if payload.is_empty() {
        Ok(frame)
    } else {
        Err(CodecError::CorruptFrame(format!(
            "{} carries {} unexpected bytes",
            frame.frame_type().as_str(),
            payload.len()
        )))
    }
}

fn split_message_header(payload: &[u8]) -> Result<(Uuid, i64, &[u8]), CodecError> {
    if payload.len() < ID_LEN + TIMESTAMP_LEN {
        return Err(CodecError::CorruptFrame(format!(
            "message payload too short: {} bytes",
            payload.len()
        )));
    }
    let id = read_uuid(&payload[..ID_LEN]);
    let mut ts = [0u8; TIMESTAMP_LEN];
    ts.copy_from_slice(&payload[ID_LEN..ID_LEN + TIMESTAMP_LEN]);
    Ok((id, i64::from_be_bytes(ts), &payload[ID_LEN + TIMESTAMP_LEN..]))
}

fn read_uuid(bytes: &[u8]) -> Uuid {
    let mut raw = [0u8; ID_LEN];
    raw.copy_from_slice(&bytes[..ID_LEN]);
    Uuid::from_bytes(raw)
}

/// Buffers stream bytes and yields complete frames.
///
/// After a `CorruptFrame` error the decoder is poisoned and keeps returning
/// the same error; the link it serves must be closed.
pub struct FrameDecoder {
    buffer: Vec<u8>,
    ready: VecDeque<Frame>,
    failed: Option<CodecError>,
}

impl FrameDecoder {
    /// Create a new decoder.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            ready: VecDeque::new(),
            failed: None,
        }
    }

    /// Feed bytes read from the stream.
    ///
    /// Fails on the first malformed frame; frames completed before it are
    /// still returned by [`FrameDecoder::next_frame`].
    pub fn push_bytes(&mut self, data: &[u8]) -> Result<(), CodecError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        self.buffer.extend_from_slice(data);

        loop {
            if self.buffer.len() < HEADER_LEN {
                return Ok(());
            }

            let type_byte = self.buffer[0];
            let frame_type = match FrameType::from_byte(type_byte) {
                Some(ty) => ty,
                None => return Err(self.fail(format!("unknown frame type {:#04x}", type_byte))),
            };

            let length = u32::from_be_bytes([
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
                self.buffer[4],
            ]) as usize;
            if length > MAX_PAYLOAD_LEN {
                return Err(self.fail(format!("frame length {} exceeds maximum", length)));
            }

            if self.buffer.len() < HEADER_LEN + length {
                debug!(
                    "Partial {} frame: {} of {} bytes buffered",
                    frame_type.as_str(),
                    self.buffer.len() - HEADER_LEN,
                    length
                );
                return Ok(());
            }

            let decoded = decode_payload(frame_type, &self.buffer[HEADER_LEN..HEADER_LEN + length]);
            self.buffer.drain(..HEADER_LEN + length);
            match decoded {
                Ok(frame) => self.ready.push_back(frame),
                Err(CodecError::CorruptFrame(reason)) => return Err(self.fail(reason)),
                Err(e) => return Err(e),
            }
        }
    }

    /// Take the next complete frame, if any.
    pub fn next_frame(&mut self) -> Option<Frame> {
        self.ready.pop_front()
    }

    /// The error that poisoned this decoder, if any.
    pub fn failure(&self) -> Option<&CodecError> {
        self.failed.as_ref()
    }

    /// Number of buffered bytes not yet forming a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn fail(&mut self, reason: String) -> CodecError {
        warn!("Corrupt frame: {}", reason);
        let err = CodecError::CorruptFrame(reason);
        self.buffer.clear();
        self.failed = Some(err.clone());
        err
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        decoder.push_bytes(bytes).unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = decoder.next_frame() {
            frames.push(frame);
        }
        frames
    }

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::ConnectRequest(HandshakePayload::new("Alice", 0xff0000)),
            Frame::Accept(HandshakePayload::new("Bob", 0x00ff00)),
            Frame::Reject,
            Frame::Withdraw,
            Frame::Disconnect,
            Frame::Text {
                id: Uuid::new_v4(),
                timestamp: 1_700_000_000_000,
                text: "héllo wörld".into(),
            },
            Frame::Text {
                id: Uuid::new_v4(),
                timestamp: 0,
                text: String::new(),
            },
            Frame::Image {
                id: Uuid::new_v4(),
                timestamp: -5,
                data: vec![0xAB; 300],
            },
            Frame::Ack { id: Uuid::new_v4() },
        ]
    }

    #[test]
    fn test_header_layout() {
        let bytes = encode_frame(&Frame::Disconnect).unwrap();
        assert_eq!(bytes, vec![5, 0, 0, 0, 0]);

        let ack = Frame::Ack { id: Uuid::nil() };
        let bytes = encode_frame(&ack).unwrap();
        assert_eq!(bytes[0], 8);
        assert_eq!(&bytes[1..5], &[0, 0, 0, 16]);
        assert_eq!(bytes.len(), HEADER_LEN + 16);
    }

    #[test]
    fn test_roundtrip_every_frame_type() {
        for frame in sample_frames() {
            let bytes = encode_frame(&frame).unwrap();
            assert_eq!(decode_all(&bytes), vec![frame]);
        }
    }

    #[test]
    fn test_image_size_edges() {
        for size in [0usize, 1, 4096, MAX_PAYLOAD_LEN - ID_LEN - TIMESTAMP_LEN - IMAGE_SIZE_LEN] {
            let frame = Frame::Image {
                id: Uuid::new_v4(),
                timestamp: 42,
                data: vec![7; size],
            };
            let bytes = encode_frame(&frame).unwrap();
            assert_eq!(decode_all(&bytes), vec![frame]);
        }
    }

    #[test]
    fn test_oversized_payload_rejected_on_encode() {
        let frame = Frame::Image {
            id: Uuid::new_v4(),
            timestamp: 0,
            data: vec![0; MAX_PAYLOAD_LEN],
        };
        assert!(matches!(
            encode_frame(&frame),
            Err(CodecError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_byte_by_byte_delivery() {
        let frames = sample_frames();
        let mut stream = Vec::new();
        for frame in &frames {
            stream.extend(encode_frame(frame).unwrap());
        }

        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        for byte in stream {
            decoder.push_bytes(&[byte]).unwrap();
            while let Some(frame) = decoder.next_frame() {
                out.push(frame);
            }
        }
        assert_eq!(out, frames);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_frame_waits() {
        let bytes = encode_frame(&Frame::Text {
            id: Uuid::new_v4(),
            timestamp: 1,
            text: "partial".into(),
        })
        .unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push_bytes(&bytes[..3]).unwrap();
        assert!(decoder.next_frame().is_none());
        decoder.push_bytes(&bytes[3..bytes.len() - 1]).unwrap();
        assert!(decoder.next_frame().is_none());
        decoder.push_bytes(&bytes[bytes.len() - 1..]).unwrap();
        assert!(decoder.next_frame().is_some());
    }

    #[test]
    fn test_unknown_type_is_corrupt_and_sticky() {
        let mut decoder = FrameDecoder::new();
        let err = decoder.push_bytes(&[0x42, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, CodecError::CorruptFrame(_)));

        // No resynchronization: valid bytes afterwards are refused too.
        let valid = encode_frame(&Frame::Reject).unwrap();
        assert!(decoder.push_bytes(&valid).is_err());
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn test_length_over_maximum_is_corrupt() {
        let mut decoder = FrameDecoder::new();
        let len = (MAX_PAYLOAD_LEN as u32 + 1).to_be_bytes();
        let header = [6, len[0], len[1], len[2], len[3]];
        assert!(matches!(
            decoder.push_bytes(&header),
            Err(CodecError::CorruptFrame(_))
        ));
    }

    #[test]
    fn test_frames_before_corruption_survive() {
        let mut bytes = encode_frame(&Frame::Withdraw).unwrap();
        bytes.extend_from_slice(&[0xEE, 0, 0, 0, 0]);

        let mut decoder = FrameDecoder::new();
        assert!(decoder.failure().is_none());
        assert!(decoder.push_bytes(&bytes).is_err());
        assert_eq!(decoder.next_frame(), Some(Frame::Withdraw));
        assert!(matches!(decoder.failure(), Some(CodecError::CorruptFrame(_))));
    }

    #[test]
    fn test_malformed_payloads() {
        // Control frame with trailing bytes.
        assert!(decode_payload(FrameType::Disconnect, &[1]).is_err());
        // Ack of the wrong size.
        assert!(decode_payload(FrameType::Ack, &[0; 4]).is_err());
        // Text shorter than its header.
        assert!(decode_payload(FrameType::Text, &[0; 10]).is_err());
        // Invalid utf-8 text.
        let mut text = vec![0u8; ID_LEN + TIMESTAMP_LEN];
        text.extend_from_slice(&[0xff, 0xfe]);
        assert!(decode_payload(FrameType::Text, &text).is_err());
        // Image declaring more bytes than present.
        let mut image = vec![0u8; ID_LEN + TIMESTAMP_LEN];
        image.extend_from_slice(&10u32.to_be_bytes());
        image.extend_from_slice(&[1, 2, 3]);
        assert!(decode_payload(FrameType::Image, &image).is_err());
        // Handshake that is not JSON.
        assert!(decode_payload(FrameType::ConnectRequest, b"nope").is_err());
    }
}
