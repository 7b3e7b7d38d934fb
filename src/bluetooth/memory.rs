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

//! In-process transport over `tokio::io::duplex` pipes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::debug;

use super::transport::{IncomingLink, PeerAddress, Transport};
use crate::error::TransportError;

/// Buffer size of each in-memory pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

type Inbox = mpsc::UnboundedSender<IncomingLink<DuplexStream>>;

/// A set of in-memory devices that can dial each other by address.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inboxes: Arc<Mutex<HashMap<PeerAddress, Inbox>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device with the given address.
    pub fn transport(&self, address: impl Into<PeerAddress>) -> MemoryTransport {
        let address = address.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().insert(address.clone(), tx);
        MemoryTransport {
            network: self.clone(),
            address,
            radio: Arc::new(AtomicBool::new(true)),
            incoming: tokio::sync::Mutex::new(rx),
        }
    }

    /// Open a raw pipe from `from` to the device at `to`.
    ///
    /// The returned stream is the dialling end; the other end shows up in the
    /// target's `accept_incoming`.
    pub fn dial(&self, from: &str, to: &str) -> Result<DuplexStream, TransportError> {
        let inbox = self
            .inboxes
            .lock()
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::PeerUnreachable(to.to_string()))?;

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        inbox
            .send(IncomingLink {
                stream: remote,
                address: from.to_string(),
            })
            .map_err(|_| TransportError::PeerUnreachable(to.to_string()))?;
        debug!("Memory link {} -> {}", from, to);
        Ok(local)
    }

}

/// One device on a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    address: PeerAddress,
    radio: Arc<AtomicBool>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<IncomingLink<DuplexStream>>>,
}

impl MemoryTransport {
    /// Switch the simulated radio on or off.
    pub fn set_radio_enabled(&self, enabled: bool) {
        self.radio.store(enabled, Ordering::SeqCst);
    }

    fn radio_on(&self) -> bool {
        self.radio.load(Ordering::SeqCst)
    }
}

impl Transport for MemoryTransport {
    type Stream = DuplexStream;

    async fn power_on(&self) -> Result<(), TransportError> {
        if self.radio_on() {
            Ok(())
        } else {
            Err(TransportError::Unavailable("radio disabled".into()))
        }
    }

    async fn open(&self, peer: &str) -> Result<DuplexStream, TransportError> {
        if !self.radio_on() {
            return Err(TransportError::Unavailable("radio disabled".into()));
        }
        self.network.dial(&self.address, peer)
    }

    async fn accept_incoming(&self) -> Result<IncomingLink<DuplexStream>, TransportError> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::NoIncoming)
    }

    fn local_address(&self) -> PeerAddress {
        self.address.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_open_and_accept() {
        let network = MemoryNetwork::new();
        let a = network.transport("AA");
        let b = network.transport("BB");

        let mut out = a.open("BB").await.unwrap();
        let incoming = b.accept_incoming().await.unwrap();
        assert_eq!(incoming.address, "AA");

        let mut stream = incoming.stream;
        out.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_unknown_peer_unreachable() {
        let network = MemoryNetwork::new();
        let a = network.transport("AA");
        assert!(matches!(
            a.open("ZZ").await,
            Err(TransportError::PeerUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_radio_off() {
        let network = MemoryNetwork::new();
        let a = network.transport("AA");
        a.set_radio_enabled(false);
        assert!(matches!(a.power_on().await, Err(TransportError::Unavailable(_))));
        assert!(matches!(a.open("AA").await, Err(TransportError::Unavailable(_))));
    }
}
