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

//! Error types shared across the session engine.

use crate::session::Phase;

/// Failures reported by a transport or by a link built on top of it.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Local radio is off or missing.
    #[error("bluetooth transport unavailable: {0}")]
    Unavailable(String),
    /// The remote device could not be reached.
    #[error("peer {0} unreachable")]
    PeerUnreachable(String),
    /// The transport stopped producing incoming links.
    #[error("no incoming connection")]
    NoIncoming,
    /// The link was closed by either side.
    #[error("link closed")]
    LinkClosed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while framing or unframing wire data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Malformed frame. The link must be torn down.
    #[error("corrupt frame: {0}")]
    CorruptFrame(String),
    /// Payload exceeds the maximum frame length on encode.
    #[error("payload of {0} bytes exceeds maximum frame length")]
    PayloadTooLarge(usize),
}

/// Errors from a read on a framed link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        LinkError::Transport(TransportError::Io(e))
    }
}

/// Errors returned to callers of connector actions.
///
/// These are local diagnostics; observers only ever see listener events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("{action} not allowed while {phase:?}")]
    InvalidStateTransition { action: &'static str, phase: Phase },
    /// The connector task has shut down.
    #[error("connector stopped")]
    Stopped,
}

impl SessionError {
    pub(crate) fn invalid(action: &'static str, phase: Phase) -> Self {
        SessionError::InvalidStateTransition { action, phase }
    }
}
