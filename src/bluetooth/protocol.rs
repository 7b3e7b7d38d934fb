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

//! Frame definitions for the chat wire protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{ChatMessage, Payload, Profile};

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame types supported by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    ConnectRequest = 1,
    Accept = 2,
    Reject = 3,
    Withdraw = 4,
    Disconnect = 5,
    Text = 6,
    Image = 7,
    Ack = 8,
}

impl FrameType {
    /// Parse the type byte of a frame header.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::ConnectRequest),
            2 => Some(Self::Accept),
            3 => Some(Self::Reject),
            4 => Some(Self::Withdraw),
            5 => Some(Self::Disconnect),
            6 => Some(Self::Text),
            7 => Some(Self::Image),
            8 => Some(Self::Ack),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> u8 {
        *self as u8
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectRequest => "CONNECT_REQ",
            Self::Accept => "ACCEPT",
            Self::Reject => "REJECT",
            Self::Withdraw => "WITHDRAW",
            Self::Disconnect => "DISCONNECT",
            Self::Text => "TEXT",
            Self::Image => "IMAGE",
            Self::Ack => "ACK",
        }
    }
}

/// Handshake payload carried by connect requests and accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    #[serde(rename = "v")]
    pub version: u8,
    pub name: String,
    pub color: u32,
}

impl HandshakePayload {
    pub fn new(name: impl Into<String>, color: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            name: name.into(),
            color,
        }
    }

    pub fn from_profile(profile: &Profile) -> Self {
        Self::new(profile.name.clone(), profile.color)
    }
}

/// One decoded unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    ConnectRequest(HandshakePayload),
    Accept(HandshakePayload),
    Reject,
    Withdraw,
    Disconnect,
    Text {
        id: Uuid,
        timestamp: i64,
        text: String,
    },
    Image {
        id: Uuid,
        timestamp: i64,
        data: Vec<u8>,
    },
    Ack {
        id: Uuid,
    },
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::ConnectRequest(_) => FrameType::ConnectRequest,
            Frame::Accept(_) => FrameType::Accept,
            Frame::Reject => FrameType::Reject,
            Frame::Withdraw => FrameType::Withdraw,
            Frame::Disconnect => FrameType::Disconnect,
            Frame::Text { .. } => FrameType::Text,
            Frame::Image { .. } => FrameType::Image,
            Frame::Ack { .. } => FrameType::Ack,
        }
    }

    /// Build the frame that carries an outgoing chat message.
    pub fn from_message(message: &ChatMessage) -> Self {
        let id = message.id;
        let timestamp = message.timestamp.timestamp_millis();
        match &message.payload {
            Payload::Text(text) => Frame::Text {
                id,
                timestamp,
                text: text.clone(),
            },
            Payload::Image(data) => Frame::Image {
                id,
                timestamp,
                data: data.clone(),
            },
        }
    }

    /// Turn a chat frame into a received message from `address`.
    ///
    /// Returns `None` for control frames.
    pub fn into_message(self, address: &str) -> Option<ChatMessage> {
        match self {
            Frame::Text {
                id,
                timestamp,
                text,
            } => Some(ChatMessage::incoming(address, id, timestamp, Payload::Text(text))),
            Frame::Image {
                id,
                timestamp,
                data,
            } => Some(ChatMessage::incoming(address, id, timestamp, Payload::Image(data))),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_bytes() {
        for b in 1..=8u8 {
            let ty = FrameType::from_byte(b).unwrap();
            assert_eq!(ty.as_byte(), b);
        }
        assert_eq!(FrameType::from_byte(0), None);
        assert_eq!(FrameType::from_byte(9), None);
    }

    #[test]
    fn test_handshake_json() {
        let payload = HandshakePayload::new("Desk", 0x3366ff);
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"v\":1"));
        assert!(json.contains("\"name\":\"Desk\""));

        let parsed: HandshakePayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_message_frame_conversion() {
        let msg = ChatMessage::outgoing("AA:BB", Payload::Text("hi there".into()));
        let frame = Frame::from_message(&msg);
        assert_eq!(frame.frame_type(), FrameType::Text);

        let received = frame.into_message("CC:DD").unwrap();
        assert_eq!(received.id, msg.id);
        assert_eq!(received.timestamp, msg.timestamp);
        assert_eq!(received.payload, msg.payload);
        assert_eq!(received.address, "CC:DD");
    }

    #[test]
    fn test_control_frames_are_not_messages() {
        assert!(Frame::Reject.into_message("AA").is_none());
        assert!(Frame::Disconnect.into_message("AA").is_none());
        assert!(Frame::Ack { id: Uuid::nil() }.into_message("AA").is_none());
    }
}
