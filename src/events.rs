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

//! Events delivered to registered listeners.
//!
//! All events are dispatched on the connector task, in the order the
//! transitions happened.

use uuid::Uuid;

use crate::storage::{ChatMessage, Conversation};

/// Outcome of bringing up the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareEvent {
    /// Transport is up and listening.
    Prepared,
    /// Transport could not be brought up.
    Error(String),
}

/// Connection lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectEvent {
    /// Outbound attempt started.
    Connecting,
    /// A peer asked to connect; the local user should accept or reject.
    ConnectedIn(Conversation),
    /// Our request was accepted.
    ConnectedOut(Conversation),
    /// Local user accepted an incoming request.
    ConnectionAccepted,
    ConnectionRejected,
    /// The pending request was cancelled before it was answered.
    ConnectionWithdrawn,
    ConnectionFailed,
    /// Live link broke without an explicit disconnect.
    ConnectionLost,
    Disconnected,
    /// The transport was torn down.
    ConnectionDestroyed,
}

impl ConnectEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectEvent::Connecting => "connecting",
            ConnectEvent::ConnectedIn(_) => "connected_in",
            ConnectEvent::ConnectedOut(_) => "connected_out",
            ConnectEvent::ConnectionAccepted => "connection_accepted",
            ConnectEvent::ConnectionRejected => "connection_rejected",
            ConnectEvent::ConnectionWithdrawn => "connection_withdrawn",
            ConnectEvent::ConnectionFailed => "connection_failed",
            ConnectEvent::ConnectionLost => "connection_lost",
            ConnectEvent::Disconnected => "disconnected",
            ConnectEvent::ConnectionDestroyed => "connection_destroyed",
        }
    }
}

/// Chat traffic events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEvent {
    Received(ChatMessage),
    /// Message written to the link; status is `Delivered`.
    Sent(ChatMessage),
    /// Write failed; status is `Failed`.
    Failed(ChatMessage),
    /// Peer confirmed receipt of one of our messages.
    Acknowledged { address: String, id: Uuid },
}
