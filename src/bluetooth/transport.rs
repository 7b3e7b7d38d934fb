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

//! Transport seam between the session engine and the radio.
//!
//! Production uses the RFCOMM transport; tests use the in-memory one.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TransportError;

/// Stable identifier of a remote device (its Bluetooth address).
pub type PeerAddress = String;

/// A link accepted from a remote device.
pub struct IncomingLink<S> {
    pub stream: S,
    pub address: PeerAddress,
}

/// Point-to-point stream transport.
pub trait Transport: Send + Sync + 'static {
    /// Duplex byte stream to one peer.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Make the local radio ready to open and accept links.
    ///
    /// Fails with [`TransportError::Unavailable`] when the radio is off or absent.
    fn power_on(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Open a link to `peer`.
    fn open(
        &self,
        peer: &str,
    ) -> impl Future<Output = Result<Self::Stream, TransportError>> + Send;

    /// Wait for the next incoming link.
    ///
    /// Returns [`TransportError::NoIncoming`] once the transport can no longer
    /// produce links.
    fn accept_incoming(
        &self,
    ) -> impl Future<Output = Result<IncomingLink<Self::Stream>, TransportError>> + Send;

    /// Address of the local adapter.
    fn local_address(&self) -> PeerAddress;
}
