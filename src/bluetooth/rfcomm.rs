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

//! Bluetooth RFCOMM transport backed by BlueZ.

use anyhow::Result;
use bluer::rfcomm::{Listener, SocketAddr, Stream};
use bluer::{Adapter, Address};
use tokio::sync::OnceCell;
use tracing::{info, warn};
use uuid::Uuid;

use super::transport::{IncomingLink, PeerAddress, Transport};
use crate::error::TransportError;

/// Service UUID advertised for the chat channel.
pub const CHAT_SERVICE_UUID: Uuid = Uuid::from_u128(0xfa87c0d0_afac_11de_8a39_0800200c9a66);

/// RFCOMM transport on the default adapter.
pub struct RfcommTransport {
    adapter: Adapter,
    address: Address,
    channel: u8,
    listener: OnceCell<Listener>,
}

impl RfcommTransport {
    /// Open a BlueZ session on the default adapter.
    pub async fn new(channel: u8) -> Result<Self> {
        info!("Initializing Bluetooth transport...");

        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        let address = adapter.address().await?;
        info!("Local address: {}", address);

        Ok(Self {
            adapter,
            address,
            channel,
            listener: OnceCell::new(),
        })
    }

    /// Set the advertised device name.
    pub async fn set_name(&self, name: &str) -> Result<()> {
        self.adapter.set_alias(name.to_string()).await?;
        info!("Bluetooth name set to: {}", name);
        Ok(())
    }

    async fn bring_up(&self) -> Result<Listener, TransportError> {
        let unavailable = |e: bluer::Error| TransportError::Unavailable(e.to_string());

        if !self.adapter.is_powered().await.map_err(unavailable)? {
            info!("Powering on Bluetooth adapter...");
            self.adapter.set_powered(true).await.map_err(unavailable)?;
        }
        self.adapter.set_discoverable(true).await.map_err(unavailable)?;
        self.adapter.set_pairable(true).await.map_err(unavailable)?;

        let local_addr = SocketAddr::new(Address::any(), self.channel);
        let listener = Listener::bind(local_addr)
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        info!(
            "RFCOMM listening on channel {} (service {})",
            self.channel, CHAT_SERVICE_UUID
        );
        Ok(listener)
    }
}

impl Transport for RfcommTransport {
    type Stream = Stream;

    async fn power_on(&self) -> Result<(), TransportError> {
        self.listener.get_or_try_init(|| self.bring_up()).await?;
        Ok(())
    }

    async fn open(&self, peer: &str) -> Result<Stream, TransportError> {
        let address: Address = peer
            .parse()
            .map_err(|_| TransportError::PeerUnreachable(peer.to_string()))?;
        Stream::connect(SocketAddr::new(address, self.channel))
            .await
            .map_err(|e| {
                warn!("RFCOMM connect to {} failed: {}", peer, e);
                TransportError::PeerUnreachable(peer.to_string())
            })
    }

    async fn accept_incoming(&self) -> Result<IncomingLink<Stream>, TransportError> {
        let listener = self.listener.get().ok_or(TransportError::NoIncoming)?;
        let (stream, remote) = listener.accept().await?;
        info!("Connection from: {}", remote.addr);
        Ok(IncomingLink {
            stream,
            address: remote.addr.to_string(),
        })
    }

    fn local_address(&self) -> PeerAddress {
        self.address.to_string()
    }
}
