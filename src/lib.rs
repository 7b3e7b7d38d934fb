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

//! BlueChat Desktop library
//!
//! Peer-to-peer chat sessions over Bluetooth RFCOMM.

pub mod bluetooth;
pub mod config;
pub mod connector;
pub mod error;
pub mod events;
pub mod listeners;
pub mod session;
pub mod state;
pub mod storage;

pub use connector::{Connector, SessionConfig};
pub use error::{CodecError, LinkError, SessionError, TransportError};
pub use events::{ConnectEvent, MessageEvent, PrepareEvent};
pub use session::Phase;
