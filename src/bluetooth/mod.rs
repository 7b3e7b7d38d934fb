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

//! Bluetooth communication module.
//!
//! Framed peer links over a pluggable stream transport.

pub mod codec;
pub mod link;
mod memory;
pub mod protocol;
#[cfg(feature = "rfcomm")]
mod rfcomm;
mod transport;

pub use codec::{encode_frame, FrameDecoder, HEADER_LEN, MAX_PAYLOAD_LEN};
pub use link::{LinkReader, LinkWriter};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use protocol::{Frame, FrameType, HandshakePayload, PROTOCOL_VERSION};
#[cfg(feature = "rfcomm")]
pub use rfcomm::{RfcommTransport, CHAT_SERVICE_UUID};
pub use transport::{IncomingLink, PeerAddress, Transport};
