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

//! Conversation and message records.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A conversation with one remote device, keyed by its address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Stable transport address of the peer (primary key).
    pub address: String,
    /// Name the peer announced for itself.
    pub display_name: String,
    /// Avatar color announced by the peer (0xRRGGBB).
    pub color: u32,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
    pub unread: bool,
}

impl Conversation {
    pub fn new(address: impl Into<String>, display_name: impl Into<String>, color: u32) -> Self {
        Self {
            address: address.into(),
            display_name: display_name.into(),
            color,
            last_activity: None,
            last_message: None,
            unread: false,
        }
    }
}

/// Whether a message was written locally or received from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Direction::Sent => "SENT",
            Direction::Received => "RECEIVED",
        }
    }

    pub(crate) fn from_str(s: &str) -> Self {
        match s {
            "SENT" => Direction::Sent,
            _ => Direction::Received,
        }
    }
}

/// Delivery status. Only moves forward out of `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Delivered => "DELIVERED",
            DeliveryStatus::Failed => "FAILED",
        }
    }

    pub(crate) fn from_str(s: &str) -> Self {
        match s {
            "DELIVERED" => DeliveryStatus::Delivered,
            "FAILED" => DeliveryStatus::Failed,
            _ => DeliveryStatus::Pending,
        }
    }

    /// Check whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: DeliveryStatus) -> bool {
        matches!(
            (self, next),
            (DeliveryStatus::Pending, DeliveryStatus::Delivered)
                | (DeliveryStatus::Pending, DeliveryStatus::Failed)
        )
    }
}

/// Message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Text(String),
    /// Raw image bytes as received over the link.
    Image(Vec<u8>),
}

impl Payload {
    /// Short text used as the conversation preview.
    pub fn preview(&self) -> String {
        match self {
            Payload::Text(text) => text.clone(),
            Payload::Image(bytes) => format!("[image, {} bytes]", bytes.len()),
        }
    }
}

/// A single chat message belonging to the conversation at `address`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub address: String,
    pub direction: Direction,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
}

impl ChatMessage {
    /// Create an outgoing message stamped with the current time.
    pub fn outgoing(address: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            address: address.into(),
            direction: Direction::Sent,
            payload,
            timestamp: now_millis(),
            status: DeliveryStatus::Pending,
        }
    }

    /// Create a message received from the peer.
    pub fn incoming(address: impl Into<String>, id: Uuid, timestamp_ms: i64, payload: Payload) -> Self {
        Self {
            id,
            address: address.into(),
            direction: Direction::Received,
            payload,
            timestamp: from_millis(timestamp_ms),
            status: DeliveryStatus::Delivered,
        }
    }

    /// Advance the delivery status. Returns false if the move would regress.
    pub fn advance(&mut self, next: DeliveryStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

/// Local user profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub color: u32,
}

/// Current time truncated to millisecond precision, matching the wire format.
pub fn now_millis() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_never_regresses() {
        let mut msg = ChatMessage::outgoing("00:11:22:33:44:55", Payload::Text("hi".into()));
        assert_eq!(msg.status, DeliveryStatus::Pending);

        assert!(msg.advance(DeliveryStatus::Delivered));
        assert!(!msg.advance(DeliveryStatus::Pending));
        assert!(!msg.advance(DeliveryStatus::Failed));
        assert_eq!(msg.status, DeliveryStatus::Delivered);
    }

    #[test]
    fn test_incoming_timestamp() {
        let id = Uuid::new_v4();
        let msg = ChatMessage::incoming("AA", id, 1_700_000_000_123, Payload::Text("x".into()));
        assert_eq!(msg.timestamp.timestamp_millis(), 1_700_000_000_123);
        assert_eq!(msg.direction, Direction::Received);
    }

    #[test]
    fn test_preview() {
        assert_eq!(Payload::Text("hello".into()).preview(), "hello");
        assert_eq!(Payload::Image(vec![0; 3]).preview(), "[image, 3 bytes]");
    }
}
