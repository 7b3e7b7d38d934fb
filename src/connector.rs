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

//! Connection orchestrator.
//!
//! A single task owns the session, the transport and the one active link.
//! User actions arrive as commands over a channel and link activity arrives
//! as internal events, so every transition and every listener dispatch runs
//! on that task, one at a time.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::WriteHalf;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bluetooth::link::{self, LinkWriter, DEFAULT_READ_CHUNK};
use crate::bluetooth::{Frame, HandshakePayload, IncomingLink, PeerAddress, Transport};
use crate::error::{CodecError, LinkError, SessionError, TransportError};
use crate::events::MessageEvent;
use crate::listeners::{
    ConnectListener, ListenerRegistry, MessageListener, PrepareListener, Subscription,
};
use crate::session::{Phase, Session, Transition};
use crate::state::SessionState;
use crate::storage::{
    ChatMessage, Conversation, ConversationStore, DeliveryStatus, Payload, Profile, ProfileStore,
};

/// Tunables for the connector.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long an outbound request may wait for the peer's answer, and how
    /// long an inbound link may stay silent before its connect request.
    pub connect_timeout: Duration,
    /// Size of a single stream read.
    pub read_chunk: usize,
    /// Capacity of the command channel.
    pub command_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_chunk: DEFAULT_READ_CHUNK,
            command_buffer: 32,
        }
    }
}

type Reply<T = ()> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Prepare(Reply),
    Connect { address: PeerAddress, reply: Reply },
    Accept(Reply),
    Reject(Reply),
    Disconnect(Reply),
    Send { payload: Payload, reply: Reply<ChatMessage> },
    RemoveConversation {
        address: PeerAddress,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    MarkRead {
        address: PeerAddress,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Stop(Reply),
}

enum Internal<S> {
    Incoming(IncomingLink<S>),
    AcceptLoopEnded,
    OutboundOpened {
        attempt: u64,
        result: Result<S, TransportError>,
    },
    ConnectTimeout { attempt: u64 },
    ProbationExpired { link: u64 },
    Frame { link: u64, frame: Frame },
    LinkFailed { link: u64, error: LinkError },
}

/// Handle to the connection orchestrator.
///
/// Cheap to clone. The orchestrator task stops once every handle is dropped.
#[derive(Clone)]
pub struct Connector {
    commands: mpsc::Sender<Command>,
    state: Arc<SessionState>,
    listeners: Arc<ListenerRegistry>,
    store: Arc<dyn ConversationStore>,
}

impl Connector {
    /// Start the orchestrator task on the current tokio runtime.
    pub fn spawn<T: Transport>(
        transport: T,
        store: Arc<dyn ConversationStore>,
        profiles: Arc<dyn ProfileStore>,
        config: SessionConfig,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let state = SessionState::new();
        let listeners = ListenerRegistry::new();

        let actor = Actor {
            transport: Arc::new(transport),
            store: store.clone(),
            profiles,
            config,
            session: Session::new(),
            state: state.clone(),
            listeners: listeners.clone(),
            internal_tx,
            accept_task: None,
            outbound: None,
            link: None,
            next_id: 0,
        };
        tokio::spawn(actor.run(command_rx, internal_rx));

        Self {
            commands: command_tx,
            state,
            listeners,
            store,
        }
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    /// Bring up the transport and start listening.
    ///
    /// A transport failure is reported to prepare listeners as
    /// [`PrepareEvent::Error`]; the returned error only covers illegal calls.
    pub async fn prepare(&self) -> Result<(), SessionError> {
        self.request(Command::Prepare).await?
    }

    /// Ask the device at `address` for a conversation.
    pub async fn connect(&self, address: impl Into<PeerAddress>) -> Result<(), SessionError> {
        let address = address.into();
        self.request(|reply| Command::Connect { address, reply }).await?
    }

    pub async fn accept_connection(&self) -> Result<(), SessionError> {
        self.request(Command::Accept).await?
    }

    pub async fn reject_connection(&self) -> Result<(), SessionError> {
        self.request(Command::Reject).await?
    }

    /// End the current session, or withdraw a request still in flight.
    pub async fn send_disconnect_request(&self) -> Result<(), SessionError> {
        self.request(Command::Disconnect).await?
    }

    /// Send a text message on the live session.
    ///
    /// The returned message carries its final delivery status.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<ChatMessage, SessionError> {
        let payload = Payload::Text(text.into());
        self.request(|reply| Command::Send { payload, reply }).await?
    }

    /// Send an image on the live session.
    pub async fn send_image(&self, data: Vec<u8>) -> Result<ChatMessage, SessionError> {
        let payload = Payload::Image(data);
        self.request(|reply| Command::Send { payload, reply }).await?
    }

    /// Delete a conversation, disconnecting first if it is the current one.
    pub async fn remove_conversation(&self, address: impl Into<PeerAddress>) -> anyhow::Result<()> {
        let address = address.into();
        self.request(|reply| Command::RemoveConversation { address, reply })
            .await?
    }

    /// Clear the unread flag of a conversation.
    pub async fn mark_read(&self, address: impl Into<PeerAddress>) -> anyhow::Result<()> {
        let address = address.into();
        self.request(|reply| Command::MarkRead { address, reply })
            .await?
    }

    /// Tear down every link and the transport listener.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.request(Command::Stop).await?
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn is_connection_prepared(&self) -> bool {
        self.state.is_connection_prepared()
    }

    pub fn is_pending(&self) -> bool {
        self.state.is_pending()
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn current_conversation(&self) -> Option<Conversation> {
        self.state.current_conversation()
    }

    pub fn conversations(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn add_prepare_listener(&self, listener: PrepareListener) {
        self.listeners.add_prepare_listener(listener);
    }

    pub fn remove_prepare_listener(&self, listener: &PrepareListener) {
        self.listeners.remove_prepare_listener(listener);
    }

    pub fn add_connect_listener(&self, listener: ConnectListener) {
        self.listeners.add_connect_listener(listener);
    }

    pub fn remove_connect_listener(&self, listener: &ConnectListener) {
        self.listeners.remove_connect_listener(listener);
    }

    pub fn add_message_listener(&self, listener: MessageListener) {
        self.listeners.add_message_listener(listener);
    }

    pub fn remove_message_listener(&self, listener: &MessageListener) {
        self.listeners.remove_message_listener(listener);
    }

    pub fn subscribe_prepare(&self, listener: PrepareListener) -> Subscription {
        self.listeners.subscribe_prepare(listener)
    }

    pub fn subscribe_connect(&self, listener: ConnectListener) -> Subscription {
        self.listeners.subscribe_connect(listener)
    }

    pub fn subscribe_message(&self, listener: MessageListener) -> Subscription {
        self.listeners.subscribe_message(listener)
    }
}

struct Outbound {
    attempt: u64,
    open_task: JoinHandle<()>,
    timer: JoinHandle<()>,
}

impl Outbound {
    fn cancel(self) {
        self.open_task.abort();
        self.timer.abort();
    }
}

struct ActiveLink<S> {
    id: u64,
    address: PeerAddress,
    writer: LinkWriter<WriteHalf<S>>,
    reader_task: JoinHandle<()>,
    /// Inbound link that has not sent its connect request yet.
    probation: Option<JoinHandle<()>>,
}

struct Actor<T: Transport> {
    transport: Arc<T>,
    store: Arc<dyn ConversationStore>,
    profiles: Arc<dyn ProfileStore>,
    config: SessionConfig,
    session: Session,
    state: Arc<SessionState>,
    listeners: Arc<ListenerRegistry>,
    internal_tx: mpsc::UnboundedSender<Internal<T::Stream>>,
    accept_task: Option<JoinHandle<()>>,
    outbound: Option<Outbound>,
    link: Option<ActiveLink<T::Stream>>,
    next_id: u64,
}

impl<T: Transport> Actor<T> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal<T::Stream>>,
    ) {
        info!("Connector started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = internal.recv() => self.handle_internal(event).await,
            }
        }
        self.teardown().await;
        info!("Connector stopped");
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Publish a legal transition and notify listeners.
    fn apply(&mut self, result: Result<Transition, SessionError>) -> Result<(), SessionError> {
        let transition = result?;
        self.state.publish(&self.session);
        match transition {
            Transition::Prepare(event) => {
                info!("Prepare event: {:?}", event);
                self.listeners.prepare.dispatch(&event);
            }
            Transition::Connect(event) => {
                info!("Connection event: {}", event.name());
                self.listeners.connect.dispatch(&event);
            }
            Transition::Quiet => {}
        }
        Ok(())
    }

    /// Like [`Actor::apply`] for transitions driven by the peer or the
    /// transport, where an illegal transition is just a late event.
    fn apply_remote(&mut self, cause: &str, result: Result<Transition, SessionError>) -> bool {
        match self.apply(result) {
            Ok(()) => true,
            Err(e) => {
                debug!("Ignoring {}: {}", cause, e);
                false
            }
        }
    }

    fn dispatch_message(&self, event: MessageEvent) {
        self.listeners.message.dispatch(&event);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Prepare(reply) => {
                let result = self.prepare().await;
                self.reply(reply, result);
            }
            Command::Connect { address, reply } => {
                let result = self.connect(address).await;
                self.reply(reply, result);
            }
            Command::Accept(reply) => {
                let result = self.accept().await;
                self.reply(reply, result);
            }
            Command::Reject(reply) => {
                let result = self.reject().await;
                self.reply(reply, result);
            }
            Command::Disconnect(reply) => {
                let result = self.disconnect().await;
                self.reply(reply, result);
            }
            Command::Send { payload, reply } => {
                let result = self.send(payload).await;
                self.reply(reply, result);
            }
            Command::RemoveConversation { address, reply } => {
                let result = self.remove_conversation(&address).await;
                let _ = reply.send(result);
            }
            Command::MarkRead { address, reply } => {
                let _ = reply.send(self.store.mark_read(&address));
            }
            Command::Stop(reply) => {
                self.teardown().await;
                self.reply(reply, Ok(()));
            }
        }
    }

    fn reply<R>(&self, reply: Reply<R>, result: Result<R, SessionError>) {
        if let Err(e) = &result {
            warn!("Rejected action: {}", e);
        }
        let _ = reply.send(result);
    }

    async fn handle_internal(&mut self, event: Internal<T::Stream>) {
        match event {
            Internal::Incoming(incoming) => self.on_incoming(incoming).await,
            Internal::AcceptLoopEnded => {
                error!("Transport stopped accepting connections");
                self.teardown().await;
            }
            Internal::OutboundOpened { attempt, result } => {
                self.on_outbound_opened(attempt, result).await
            }
            Internal::ConnectTimeout { attempt } => {
                if self.is_current_attempt(attempt) {
                    warn!("Connect request timed out");
                    let _ = self.write(Frame::Withdraw).await;
                    self.fail_outbound().await;
                }
            }
            Internal::ProbationExpired { link } => {
                let expired = self
                    .link
                    .as_ref()
                    .map(|l| l.id == link && l.probation.is_some())
                    .unwrap_or(false);
                if expired {
                    warn!("Inbound link sent no connect request, closing");
                    self.close_link().await;
                }
            }
            Internal::Frame { link, frame } => {
                if self.is_current_link(link) {
                    self.on_frame(frame).await;
                } else {
                    debug!("Dropping {} frame from stale link", frame.frame_type().as_str());
                }
            }
            Internal::LinkFailed { link, error } => {
                if self.is_current_link(link) {
                    self.on_link_failure(error).await;
                }
            }
        }
    }

    fn is_current_link(&self, id: u64) -> bool {
        self.link.as_ref().map(|l| l.id == id).unwrap_or(false)
    }

    fn is_current_attempt(&self, attempt: u64) -> bool {
        self.outbound
            .as_ref()
            .map(|o| o.attempt == attempt)
            .unwrap_or(false)
    }

    fn local_profile(&self) -> Profile {
        match self.profiles.get_profile() {
            Ok(profile) => profile,
            Err(e) => {
                warn!("Profile unavailable, using address: {}", e);
                Profile {
                    name: self.transport.local_address(),
                    color: 0,
                }
            }
        }
    }

    // ---- transport lifecycle ----

    async fn prepare(&mut self) -> Result<(), SessionError> {
        let t = self.session.begin_prepare();
        self.apply(t)?;

        match self.transport.power_on().await {
            Ok(()) => {
                self.start_accept_loop();
                let t = self.session.prepared();
                self.apply(t)
            }
            Err(e) => {
                error!("Failed to prepare transport: {}", e);
                let t = self.session.prepare_failed(e.to_string());
                self.apply(t)
            }
        }
    }

    fn start_accept_loop(&mut self) {
        let transport = self.transport.clone();
        let tx = self.internal_tx.clone();
        self.accept_task = Some(tokio::spawn(async move {
            info!("Waiting for connections...");
            loop {
                match transport.accept_incoming().await {
                    Ok(incoming) => {
                        if tx.send(Internal::Incoming(incoming)).is_err() {
                            break;
                        }
                    }
                    Err(TransportError::NoIncoming) => {
                        let _ = tx.send(Internal::AcceptLoopEnded);
                        break;
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        // Continue listening despite errors
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }));
    }

    async fn teardown(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if let Some(outbound) = self.outbound.take() {
            outbound.cancel();
        }
        self.close_link().await;
        if matches!(self.session.phase(), Phase::Connecting | Phase::PendingOutgoing) {
            // Cancelled attempt resolves as failed before the transport goes.
            let t = self.session.outbound_failed();
            self.apply_remote("outbound cancelled by stop", t);
        }
        let t = self.session.destroy();
        let _ = self.apply(Ok(t));
    }

    // ---- links ----

    fn install_link(&mut self, stream: T::Stream, address: PeerAddress, inbound: bool) -> u64 {
        let id = self.next_id();
        let (mut reader, writer) = link::split(stream, self.config.read_chunk);

        let tx = self.internal_tx.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match reader.read_frame().await {
                    Ok(frame) => {
                        if tx.send(Internal::Frame { link: id, frame }).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        let _ = tx.send(Internal::LinkFailed { link: id, error });
                        break;
                    }
                }
            }
        });

        let probation = if inbound {
            let tx = self.internal_tx.clone();
            let timeout = self.config.connect_timeout;
            Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = tx.send(Internal::ProbationExpired { link: id });
            }))
        } else {
            None
        };

        info!("Link {} installed for {}", id, address);
        self.link = Some(ActiveLink {
            id,
            address,
            writer,
            reader_task,
            probation,
        });
        id
    }

    async fn close_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.reader_task.abort();
            if let Some(timer) = link.probation.take() {
                timer.abort();
            }
            link.writer.close().await;
            info!("Link {} to {} closed", link.id, link.address);
        }
    }

    async fn write(&mut self, frame: Frame) -> Result<(), LinkError> {
        match self.link.as_mut() {
            Some(link) => link.writer.write_frame(&frame).await,
            None => Err(TransportError::LinkClosed.into()),
        }
    }

    async fn on_incoming(&mut self, incoming: IncomingLink<T::Stream>) {
        let IncomingLink { stream, address } = incoming;
        if self.session.phase() == Phase::Listening && self.link.is_none() {
            self.install_link(stream, address, true);
        } else {
            info!(
                "Busy ({}), rejecting link from {}",
                self.session.phase().as_str(),
                address
            );
            let read_chunk = self.config.read_chunk;
            tokio::spawn(async move {
                let (_reader, mut writer) = link::split(stream, read_chunk);
                if let Err(e) = writer.write_frame(&Frame::Reject).await {
                    debug!("Busy reject to {} not delivered: {}", address, e);
                }
                writer.close().await;
            });
        }
    }

    async fn on_link_failure(&mut self, error: LinkError) {
        match &error {
            LinkError::Codec(CodecError::CorruptFrame(reason)) => {
                warn!("Closing link after corrupt frame: {}", reason)
            }
            LinkError::Transport(TransportError::LinkClosed) => info!("Link closed by peer"),
            other => warn!("Link error: {}", other),
        }

        let on_probation = self
            .link
            .as_ref()
            .map(|l| l.probation.is_some())
            .unwrap_or(false);
        self.close_link().await;
        if on_probation {
            return;
        }

        let t = match self.session.phase() {
            Phase::Connected | Phase::Disconnecting => self.session.link_lost(),
            Phase::Connecting | Phase::PendingOutgoing => {
                if let Some(outbound) = self.outbound.take() {
                    outbound.cancel();
                }
                self.session.outbound_failed()
            }
            Phase::PendingIncoming => self.session.remote_withdrew(),
            phase => Err(SessionError::invalid("link_failure", phase)),
        };
        self.apply_remote("link failure", t);
    }

    // ---- outbound ----

    async fn connect(&mut self, address: PeerAddress) -> Result<(), SessionError> {
        let conversation = match self.store.get(&address) {
            Ok(Some(conversation)) => conversation,
            Ok(None) => Conversation::new(address.clone(), address.clone(), 0),
            Err(e) => {
                warn!("Failed to look up {}: {}", address, e);
                Conversation::new(address.clone(), address.clone(), 0)
            }
        };

        let t = self.session.connect(conversation);
        self.apply(t)?;

        // A silent inbound link would otherwise block the outbound one.
        self.close_link().await;

        let attempt = self.next_id();
        let transport = self.transport.clone();
        let tx = self.internal_tx.clone();
        let target = address.clone();
        let open_task = tokio::spawn(async move {
            let result = transport.open(&target).await;
            let _ = tx.send(Internal::OutboundOpened { attempt, result });
        });

        let tx = self.internal_tx.clone();
        let timeout = self.config.connect_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Internal::ConnectTimeout { attempt });
        });

        info!("Connecting to {}", address);
        self.outbound = Some(Outbound {
            attempt,
            open_task,
            timer,
        });
        Ok(())
    }

    async fn on_outbound_opened(&mut self, attempt: u64, result: Result<T::Stream, TransportError>) {
        if !self.is_current_attempt(attempt) {
            debug!("Dropping result of abandoned connect attempt {}", attempt);
            return;
        }

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Connect failed: {}", e);
                self.fail_outbound().await;
                return;
            }
        };

        let address = match self.session.conversation() {
            Some(conversation) => conversation.address.clone(),
            None => {
                self.fail_outbound().await;
                return;
            }
        };

        self.install_link(stream, address, false);
        let handshake = HandshakePayload::from_profile(&self.local_profile());
        match self.write(Frame::ConnectRequest(handshake)).await {
            Ok(()) => {
                let t = self.session.request_sent();
                self.apply_remote("request sent", t);
            }
            Err(e) => {
                warn!("Failed to send connect request: {}", e);
                self.fail_outbound().await;
            }
        }
    }

    async fn fail_outbound(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            outbound.cancel();
        }
        self.close_link().await;
        let t = self.session.outbound_failed();
        self.apply_remote("outbound failure", t);
    }

    // ---- inbound frames ----

    async fn on_frame(&mut self, frame: Frame) {
        debug!("Received {} frame", frame.frame_type().as_str());

        let on_probation = self
            .link
            .as_ref()
            .map(|l| l.probation.is_some())
            .unwrap_or(false);
        if on_probation {
            match frame {
                Frame::ConnectRequest(handshake) => self.on_connect_request(handshake),
                other => {
                    warn!(
                        "Expected connect request, got {}; closing link",
                        other.frame_type().as_str()
                    );
                    self.close_link().await;
                }
            }
            return;
        }

        match frame {
            Frame::ConnectRequest(_) => {
                warn!("Unexpected connect request on an established link");
            }
            Frame::Accept(handshake) => {
                let t = self.session.remote_accepted(handshake.name, handshake.color);
                if self.apply_remote("accept", t) {
                    if let Some(outbound) = self.outbound.take() {
                        outbound.cancel();
                    }
                    self.remember_current_conversation();
                }
            }
            Frame::Reject => {
                let t = self.session.remote_rejected();
                if t.is_ok() {
                    if let Some(outbound) = self.outbound.take() {
                        outbound.cancel();
                    }
                    self.close_link().await;
                }
                self.apply_remote("reject", t);
            }
            Frame::Withdraw => {
                let t = self.session.remote_withdrew();
                if t.is_ok() {
                    self.close_link().await;
                }
                self.apply_remote("withdraw", t);
            }
            Frame::Disconnect => {
                let t = match self.session.phase() {
                    Phase::PendingIncoming => self.session.remote_withdrew(),
                    _ => self.session.remote_disconnected(),
                };
                if t.is_ok() {
                    self.close_link().await;
                }
                self.apply_remote("disconnect", t);
            }
            Frame::Ack { id } => {
                if let Some(address) = self.connected_address() {
                    debug!("Peer acknowledged {}", id);
                    self.dispatch_message(MessageEvent::Acknowledged { address, id });
                }
            }
            chat @ (Frame::Text { .. } | Frame::Image { .. }) => self.on_chat_frame(chat).await,
        }
    }

    fn on_connect_request(&mut self, handshake: HandshakePayload) {
        let address = match self.link.as_mut() {
            Some(link) => {
                if let Some(timer) = link.probation.take() {
                    timer.abort();
                }
                link.address.clone()
            }
            None => return,
        };
        info!("Connect request from {} ({})", handshake.name, address);

        let mut conversation = match self.store.get(&address) {
            Ok(Some(existing)) => existing,
            _ => Conversation::new(address.clone(), handshake.name.clone(), handshake.color),
        };
        conversation.display_name = handshake.name;
        conversation.color = handshake.color;

        let t = self.session.incoming_request(conversation);
        self.apply_remote("connect request", t);
    }

    async fn on_chat_frame(&mut self, frame: Frame) {
        let address = match self.connected_address() {
            Some(address) => address,
            None => {
                warn!("Chat frame outside a live session");
                return;
            }
        };
        let message = match frame.into_message(&address) {
            Some(message) => message,
            None => return,
        };

        if let Err(e) = self.store.add_message(&message) {
            error!("Failed to store received message {}: {}", message.id, e);
        }
        self.touch_conversation(&message, true);
        info!("Message received from {}", address);
        self.dispatch_message(MessageEvent::Received(message.clone()));

        if let Err(e) = self.write(Frame::Ack { id: message.id }).await {
            self.on_link_failure(e).await;
        }
    }

    fn connected_address(&self) -> Option<PeerAddress> {
        if self.session.is_connected() {
            self.session.conversation().map(|c| c.address.clone())
        } else {
            None
        }
    }

    // ---- local actions ----

    async fn accept(&mut self) -> Result<(), SessionError> {
        if self.session.phase() != Phase::PendingIncoming {
            return Err(SessionError::invalid("accept_connection", self.session.phase()));
        }

        let handshake = HandshakePayload::from_profile(&self.local_profile());
        if let Err(e) = self.write(Frame::Accept(handshake)).await {
            // Peer went away while the user was deciding.
            self.on_link_failure(e).await;
            return Ok(());
        }

        let t = self.session.accept();
        self.apply(t)?;
        self.remember_current_conversation();
        Ok(())
    }

    async fn reject(&mut self) -> Result<(), SessionError> {
        if self.session.phase() != Phase::PendingIncoming {
            return Err(SessionError::invalid("reject_connection", self.session.phase()));
        }

        if let Err(e) = self.write(Frame::Reject).await {
            debug!("Reject not delivered: {}", e);
        }
        self.close_link().await;
        let t = self.session.reject();
        self.apply(t)
    }

    async fn disconnect(&mut self) -> Result<(), SessionError> {
        match self.session.phase() {
            Phase::Connected => {
                let t = self.session.begin_disconnect();
                self.apply(t)?;
                if let Err(e) = self.write(Frame::Disconnect).await {
                    debug!("Disconnect not delivered: {}", e);
                }
                self.close_link().await;
                let t = self.session.disconnected();
                self.apply(t)
            }
            Phase::Connecting | Phase::PendingOutgoing => {
                if self.link.is_some() {
                    if let Err(e) = self.write(Frame::Withdraw).await {
                        debug!("Withdraw not delivered: {}", e);
                    }
                }
                if let Some(outbound) = self.outbound.take() {
                    outbound.cancel();
                }
                self.close_link().await;
                let t = self.session.withdraw();
                self.apply(t)
            }
            Phase::PendingIncoming => self.reject().await,
            _ => {
                let t = self.session.forget_lost();
                self.apply(t)
            }
        }
    }

    async fn send(&mut self, payload: Payload) -> Result<ChatMessage, SessionError> {
        let address = self
            .connected_address()
            .ok_or_else(|| SessionError::invalid("send_message", self.session.phase()))?;

        let mut message = ChatMessage::outgoing(address, payload);
        if let Err(e) = self.store.add_message(&message) {
            error!("Failed to store outgoing message {}: {}", message.id, e);
        }
        self.touch_conversation(&message, false);

        match self.write(Frame::from_message(&message)).await {
            Ok(()) => {
                self.set_status(&mut message, DeliveryStatus::Delivered);
                self.dispatch_message(MessageEvent::Sent(message.clone()));
            }
            Err(LinkError::Codec(e)) => {
                warn!("Message {} not sent: {}", message.id, e);
                self.set_status(&mut message, DeliveryStatus::Failed);
                self.dispatch_message(MessageEvent::Failed(message.clone()));
            }
            Err(e) => {
                self.set_status(&mut message, DeliveryStatus::Failed);
                self.dispatch_message(MessageEvent::Failed(message.clone()));
                self.on_link_failure(e).await;
            }
        }
        Ok(message)
    }

    fn set_status(&self, message: &mut ChatMessage, status: DeliveryStatus) {
        if message.advance(status) {
            if let Err(e) = self.store.update_message_status(message.id, status) {
                error!("Failed to update status of {}: {}", message.id, e);
            }
        }
    }

    async fn remove_conversation(&mut self, address: &str) -> anyhow::Result<()> {
        let is_current = self
            .session
            .conversation()
            .map(|c| c.address == address)
            .unwrap_or(false);
        if is_current {
            if let Err(e) = self.disconnect().await {
                debug!("Nothing to disconnect before removal: {}", e);
            }
        }
        self.store.delete(address)
    }

    // ---- persistence helpers ----

    fn remember_current_conversation(&self) {
        let current = match self.session.conversation() {
            Some(conversation) => conversation,
            None => return,
        };
        let mut record = match self.store.get(&current.address) {
            Ok(Some(existing)) => existing,
            _ => current.clone(),
        };
        record.display_name = current.display_name.clone();
        record.color = current.color;
        if let Err(e) = self.store.upsert(&record) {
            error!("Failed to store conversation {}: {}", record.address, e);
        }
    }

    fn touch_conversation(&self, message: &ChatMessage, unread: bool) {
        let mut record = match self.store.get(&message.address) {
            Ok(Some(existing)) => existing,
            _ => match self.session.conversation() {
                Some(current) => current.clone(),
                None => Conversation::new(message.address.clone(), message.address.clone(), 0),
            },
        };
        record.last_activity = Some(message.timestamp);
        record.last_message = Some(message.payload.preview());
        record.unread = unread;
        if let Err(e) = self.store.upsert(&record) {
            error!("Failed to update conversation {}: {}", record.address, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::MemoryNetwork;
    use crate::events::{ConnectEvent, PrepareEvent};
    use crate::storage::SqliteStore;

    fn spawn_on(network: &MemoryNetwork, address: &str) -> Connector {
        Connector::spawn(
            network.transport(address),
            Arc::new(SqliteStore::in_memory().unwrap()),
            Arc::new(Profile {
                name: address.to_string(),
                color: 1,
            }),
            SessionConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_illegal_actions_are_local_errors() {
        let network = MemoryNetwork::new();
        let connector = spawn_on(&network, "AA");

        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = events.clone();
        connector.add_connect_listener(Arc::new(move |e: &ConnectEvent| sink.lock().push(e.clone())));

        assert!(matches!(
            connector.accept_connection().await,
            Err(SessionError::InvalidStateTransition { phase: Phase::Idle, .. })
        ));
        assert!(connector.reject_connection().await.is_err());
        assert!(connector.send_message("hi").await.is_err());
        assert!(connector.connect("BB").await.is_err());
        assert!(events.lock().is_empty());
        assert_eq!(connector.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_prepare_twice_is_invalid() {
        let network = MemoryNetwork::new();
        let connector = spawn_on(&network, "AA");
        connector.prepare().await.unwrap();
        assert!(connector.is_connection_prepared());
        assert!(connector.prepare().await.is_err());
        assert_eq!(connector.phase(), Phase::Listening);
    }

    #[tokio::test]
    async fn test_stop_destroys_and_allows_prepare_again() {
        let network = MemoryNetwork::new();
        let connector = spawn_on(&network, "AA");
        let prepared = Arc::new(parking_lot::Mutex::new(0));
        let counter = prepared.clone();
        connector.add_prepare_listener(Arc::new(move |e: &PrepareEvent| {
            if *e == PrepareEvent::Prepared {
                *counter.lock() += 1;
            }
        }));

        connector.prepare().await.unwrap();
        connector.stop().await.unwrap();
        assert_eq!(connector.phase(), Phase::Idle);
        connector.prepare().await.unwrap();
        assert_eq!(*prepared.lock(), 2);
    }
}
