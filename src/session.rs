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

//! Session state machine.
//!
//! Pure transition logic with no I/O. Every method either performs one
//! transition and returns the events it produced, or returns
//! [`SessionError::InvalidStateTransition`] and leaves the session untouched.
//! The connector applies these from its single task, so transitions never
//! interleave.

use tracing::{debug, info};

use crate::error::SessionError;
use crate::events::{ConnectEvent, PrepareEvent};
use crate::storage::Conversation;

/// Phase of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Preparing,
    Listening,
    /// Outbound link being opened.
    Connecting,
    /// Peer asked to connect; waiting for the local user.
    PendingIncoming,
    /// Request sent; waiting for the peer.
    PendingOutgoing,
    Connected,
    Disconnecting,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "Idle",
            Phase::Preparing => "Preparing",
            Phase::Listening => "Listening",
            Phase::Connecting => "Connecting",
            Phase::PendingIncoming => "Pending (incoming)",
            Phase::PendingOutgoing => "Pending (outgoing)",
            Phase::Connected => "Connected",
            Phase::Disconnecting => "Disconnecting",
        }
    }

    /// A session with a peer is occupied (pending or live).
    pub fn is_occupied(&self) -> bool {
        matches!(
            self,
            Phase::Connecting
                | Phase::PendingIncoming
                | Phase::PendingOutgoing
                | Phase::Connected
                | Phase::Disconnecting
        )
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Phase::Connecting | Phase::PendingIncoming | Phase::PendingOutgoing
        )
    }

    pub fn is_prepared(&self) -> bool {
        !matches!(self, Phase::Idle | Phase::Preparing)
    }
}

/// Who started the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    Local,
    Remote,
}

/// Events produced by one transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Prepare(PrepareEvent),
    Connect(ConnectEvent),
    /// State changed without anything to report.
    Quiet,
}

/// The single session between this device and at most one peer.
#[derive(Debug)]
pub struct Session {
    phase: Phase,
    conversation: Option<Conversation>,
    initiator: Option<Initiator>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            conversation: None,
            initiator: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Peer of the current session.
    ///
    /// Survives a lost link until the next explicit disconnect or teardown.
    pub fn conversation(&self) -> Option<&Conversation> {
        self.conversation.as_ref()
    }

    pub fn initiator(&self) -> Option<Initiator> {
        self.initiator
    }

    pub fn is_pending(&self) -> bool {
        self.phase.is_pending()
    }

    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }

    fn set_phase(&mut self, phase: Phase) {
        debug!("Session {} -> {}", self.phase.as_str(), phase.as_str());
        self.phase = phase;
    }

    fn require(&self, action: &'static str, allowed: &[Phase]) -> Result<(), SessionError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(SessionError::invalid(action, self.phase))
        }
    }

    fn end_session(&mut self) {
        self.conversation = None;
        self.initiator = None;
    }

    /// Begin bringing up the transport.
    pub fn begin_prepare(&mut self) -> Result<Transition, SessionError> {
        self.require("prepare", &[Phase::Idle])?;
        self.set_phase(Phase::Preparing);
        Ok(Transition::Quiet)
    }

    pub fn prepared(&mut self) -> Result<Transition, SessionError> {
        self.require("prepared", &[Phase::Preparing])?;
        self.set_phase(Phase::Listening);
        info!("Session listening");
        Ok(Transition::Prepare(PrepareEvent::Prepared))
    }

    pub fn prepare_failed(&mut self, reason: String) -> Result<Transition, SessionError> {
        self.require("prepare_failed", &[Phase::Preparing])?;
        self.set_phase(Phase::Idle);
        Ok(Transition::Prepare(PrepareEvent::Error(reason)))
    }

    /// Local user starts connecting to `conversation`.
    pub fn connect(&mut self, conversation: Conversation) -> Result<Transition, SessionError> {
        self.require("connect", &[Phase::Listening])?;
        self.set_phase(Phase::Connecting);
        self.conversation = Some(conversation);
        self.initiator = Some(Initiator::Local);
        Ok(Transition::Connect(ConnectEvent::Connecting))
    }

    /// Outbound link is open and the request has been written.
    pub fn request_sent(&mut self) -> Result<Transition, SessionError> {
        self.require("request_sent", &[Phase::Connecting])?;
        self.set_phase(Phase::PendingOutgoing);
        Ok(Transition::Quiet)
    }

    /// Peer accepted our request.
    pub fn remote_accepted(&mut self, name: String, color: u32) -> Result<Transition, SessionError> {
        self.require("remote_accepted", &[Phase::Connecting, Phase::PendingOutgoing])?;
        let conversation = match self.conversation.as_mut() {
            Some(conversation) => {
                conversation.display_name = name;
                conversation.color = color;
                conversation.clone()
            }
            None => return Err(SessionError::invalid("remote_accepted", self.phase)),
        };
        self.set_phase(Phase::Connected);
        Ok(Transition::Connect(ConnectEvent::ConnectedOut(conversation)))
    }

    /// Peer rejected our request.
    pub fn remote_rejected(&mut self) -> Result<Transition, SessionError> {
        self.require("remote_rejected", &[Phase::Connecting, Phase::PendingOutgoing])?;
        self.set_phase(Phase::Listening);
        self.end_session();
        Ok(Transition::Connect(ConnectEvent::ConnectionRejected))
    }

    /// Outbound attempt timed out, was unreachable or lost its link.
    pub fn outbound_failed(&mut self) -> Result<Transition, SessionError> {
        self.require("outbound_failed", &[Phase::Connecting, Phase::PendingOutgoing])?;
        self.set_phase(Phase::Listening);
        self.end_session();
        Ok(Transition::Connect(ConnectEvent::ConnectionFailed))
    }

    /// Local user cancels an outbound attempt.
    pub fn withdraw(&mut self) -> Result<Transition, SessionError> {
        self.require("withdraw", &[Phase::Connecting, Phase::PendingOutgoing])?;
        self.set_phase(Phase::Listening);
        self.end_session();
        Ok(Transition::Connect(ConnectEvent::ConnectionWithdrawn))
    }

    /// Peer asked to connect.
    pub fn incoming_request(&mut self, conversation: Conversation) -> Result<Transition, SessionError> {
        self.require("incoming_request", &[Phase::Listening])?;
        self.set_phase(Phase::PendingIncoming);
        self.conversation = Some(conversation.clone());
        self.initiator = Some(Initiator::Remote);
        Ok(Transition::Connect(ConnectEvent::ConnectedIn(conversation)))
    }

    pub fn accept(&mut self) -> Result<Transition, SessionError> {
        self.require("accept_connection", &[Phase::PendingIncoming])?;
        self.set_phase(Phase::Connected);
        Ok(Transition::Connect(ConnectEvent::ConnectionAccepted))
    }

    pub fn reject(&mut self) -> Result<Transition, SessionError> {
        self.require("reject_connection", &[Phase::PendingIncoming])?;
        self.set_phase(Phase::Listening);
        self.end_session();
        Ok(Transition::Connect(ConnectEvent::ConnectionRejected))
    }

    /// Peer cancelled its request, or vanished, before the local decision.
    pub fn remote_withdrew(&mut self) -> Result<Transition, SessionError> {
        self.require("remote_withdrew", &[Phase::PendingIncoming])?;
        self.set_phase(Phase::Listening);
        self.end_session();
        Ok(Transition::Connect(ConnectEvent::ConnectionWithdrawn))
    }

    /// Local disconnect of a live session; completes with [`Session::disconnected`].
    pub fn begin_disconnect(&mut self) -> Result<Transition, SessionError> {
        self.require("send_disconnect_request", &[Phase::Connected])?;
        self.set_phase(Phase::Disconnecting);
        Ok(Transition::Quiet)
    }

    pub fn disconnected(&mut self) -> Result<Transition, SessionError> {
        self.require("disconnected", &[Phase::Disconnecting])?;
        self.set_phase(Phase::Listening);
        self.end_session();
        Ok(Transition::Connect(ConnectEvent::Disconnected))
    }

    /// Peer sent an explicit disconnect.
    pub fn remote_disconnected(&mut self) -> Result<Transition, SessionError> {
        self.require("remote_disconnected", &[Phase::Connected])?;
        self.set_phase(Phase::Listening);
        self.end_session();
        Ok(Transition::Connect(ConnectEvent::Disconnected))
    }

    /// Live link failed. The conversation is kept until an explicit
    /// disconnect or teardown so observers can still see who was lost.
    pub fn link_lost(&mut self) -> Result<Transition, SessionError> {
        self.require("link_lost", &[Phase::Connected, Phase::Disconnecting])?;
        self.set_phase(Phase::Listening);
        self.initiator = None;
        Ok(Transition::Connect(ConnectEvent::ConnectionLost))
    }

    /// Clear a conversation retained after a lost link.
    pub fn forget_lost(&mut self) -> Result<Transition, SessionError> {
        if self.phase != Phase::Listening || self.conversation.is_none() {
            return Err(SessionError::invalid("send_disconnect_request", self.phase));
        }
        self.end_session();
        Ok(Transition::Connect(ConnectEvent::Disconnected))
    }

    /// Transport torn down. Always legal; reports only if something was up.
    pub fn destroy(&mut self) -> Transition {
        let was_idle = self.phase == Phase::Idle;
        self.set_phase(Phase::Idle);
        self.end_session();
        if was_idle {
            Transition::Quiet
        } else {
            Transition::Connect(ConnectEvent::ConnectionDestroyed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Conversation {
        Conversation::new("11:22:33:44:55:66", "Phone", 0x112233)
    }

    fn listening() -> Session {
        let mut s = Session::new();
        s.begin_prepare().unwrap();
        s.prepared().unwrap();
        s
    }

    #[test]
    fn test_prepare_success() {
        let mut s = Session::new();
        assert_eq!(s.begin_prepare().unwrap(), Transition::Quiet);
        assert_eq!(s.phase(), Phase::Preparing);
        assert_eq!(
            s.prepared().unwrap(),
            Transition::Prepare(PrepareEvent::Prepared)
        );
        assert_eq!(s.phase(), Phase::Listening);
        assert!(s.phase().is_prepared());
    }

    #[test]
    fn test_prepare_failure_returns_to_idle() {
        let mut s = Session::new();
        s.begin_prepare().unwrap();
        assert!(matches!(
            s.prepare_failed("radio off".into()).unwrap(),
            Transition::Prepare(PrepareEvent::Error(_))
        ));
        assert_eq!(s.phase(), Phase::Idle);
    }

    #[test]
    fn test_outbound_accepted() {
        let mut s = listening();
        s.connect(peer()).unwrap();
        assert!(s.is_pending());
        s.request_sent().unwrap();
        assert_eq!(s.phase(), Phase::PendingOutgoing);

        let t = s.remote_accepted("Renamed".into(), 7).unwrap();
        match t {
            Transition::Connect(ConnectEvent::ConnectedOut(c)) => {
                assert_eq!(c.display_name, "Renamed");
                assert_eq!(c.color, 7);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(s.is_connected());
        assert!(!s.is_pending());
        assert_eq!(s.initiator(), Some(Initiator::Local));
    }

    #[test]
    fn test_outbound_rejected_and_failed() {
        let mut s = listening();
        s.connect(peer()).unwrap();
        s.request_sent().unwrap();
        assert_eq!(
            s.remote_rejected().unwrap(),
            Transition::Connect(ConnectEvent::ConnectionRejected)
        );
        assert_eq!(s.phase(), Phase::Listening);
        assert!(s.conversation().is_none());

        s.connect(peer()).unwrap();
        assert_eq!(
            s.outbound_failed().unwrap(),
            Transition::Connect(ConnectEvent::ConnectionFailed)
        );
        assert_eq!(s.phase(), Phase::Listening);
    }

    #[test]
    fn test_incoming_reject() {
        let mut s = listening();
        let t = s.incoming_request(peer()).unwrap();
        assert_eq!(t, Transition::Connect(ConnectEvent::ConnectedIn(peer())));
        assert_eq!(s.phase(), Phase::PendingIncoming);
        assert!(s.is_pending());

        assert_eq!(
            s.reject().unwrap(),
            Transition::Connect(ConnectEvent::ConnectionRejected)
        );
        assert_eq!(s.phase(), Phase::Listening);
        assert!(s.conversation().is_none());
    }

    #[test]
    fn test_incoming_accept_then_remote_disconnect() {
        let mut s = listening();
        s.incoming_request(peer()).unwrap();
        assert_eq!(
            s.accept().unwrap(),
            Transition::Connect(ConnectEvent::ConnectionAccepted)
        );
        assert!(s.is_connected());
        assert_eq!(s.initiator(), Some(Initiator::Remote));

        assert_eq!(
            s.remote_disconnected().unwrap(),
            Transition::Connect(ConnectEvent::Disconnected)
        );
        assert_eq!(s.phase(), Phase::Listening);
    }

    #[test]
    fn test_second_request_while_occupied_is_refused() {
        let mut s = listening();
        s.incoming_request(peer()).unwrap();
        let other = Conversation::new("AA:AA:AA:AA:AA:AA", "Other", 0);
        assert!(s.incoming_request(other.clone()).is_err());
        assert_eq!(s.conversation(), Some(&peer()));

        s.accept().unwrap();
        assert!(s.incoming_request(other).is_err());
        assert!(s.is_connected());
    }

    #[test]
    fn test_withdrawn_before_decision() {
        let mut s = listening();
        s.incoming_request(peer()).unwrap();
        assert_eq!(
            s.remote_withdrew().unwrap(),
            Transition::Connect(ConnectEvent::ConnectionWithdrawn)
        );
        assert_eq!(s.phase(), Phase::Listening);
    }

    #[test]
    fn test_link_lost_keeps_conversation_until_disconnect() {
        let mut s = listening();
        s.incoming_request(peer()).unwrap();
        s.accept().unwrap();

        assert_eq!(
            s.link_lost().unwrap(),
            Transition::Connect(ConnectEvent::ConnectionLost)
        );
        assert_eq!(s.phase(), Phase::Listening);
        assert_eq!(s.conversation(), Some(&peer()));

        assert_eq!(
            s.forget_lost().unwrap(),
            Transition::Connect(ConnectEvent::Disconnected)
        );
        assert!(s.conversation().is_none());
        assert!(s.forget_lost().is_err());
    }

    #[test]
    fn test_local_disconnect() {
        let mut s = listening();
        s.incoming_request(peer()).unwrap();
        s.accept().unwrap();
        s.begin_disconnect().unwrap();
        assert_eq!(s.phase(), Phase::Disconnecting);
        assert!(!s.is_connected());
        assert_eq!(
            s.disconnected().unwrap(),
            Transition::Connect(ConnectEvent::Disconnected)
        );
        assert!(s.conversation().is_none());
    }

    #[test]
    fn test_destroy() {
        let mut s = Session::new();
        assert_eq!(s.destroy(), Transition::Quiet);

        let mut s = listening();
        s.connect(peer()).unwrap();
        assert_eq!(
            s.destroy(),
            Transition::Connect(ConnectEvent::ConnectionDestroyed)
        );
        assert_eq!(s.phase(), Phase::Idle);
        assert!(s.conversation().is_none());
    }

    #[test]
    fn test_illegal_actions_leave_state_untouched() {
        let mut s = Session::new();
        let err = s.accept().unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidStateTransition {
                action: "accept_connection",
                phase: Phase::Idle
            }
        );
        assert!(s.reject().is_err());
        assert!(s.begin_disconnect().is_err());
        assert!(s.connect(peer()).is_err());
        assert_eq!(s.phase(), Phase::Idle);

        let mut s = listening();
        assert!(s.begin_prepare().is_err());
        assert!(s.remote_accepted("x".into(), 0).is_err());
        assert_eq!(s.phase(), Phase::Listening);
    }

    /// Drive every input sequence up to a fixed depth and check that the
    /// session never reports more than one occupied phase and that an
    /// occupied phase always has a peer.
    #[test]
    fn test_all_sequences_keep_single_session() {
        type Step = fn(&mut Session) -> bool;
        let steps: [(&'static str, Step); 15] = [
            ("connect", |s| s.connect(peer()).is_ok()),
            ("request_sent", |s| s.request_sent().is_ok()),
            ("remote_accepted", |s| s.remote_accepted("p".into(), 1).is_ok()),
            ("remote_rejected", |s| s.remote_rejected().is_ok()),
            ("outbound_failed", |s| s.outbound_failed().is_ok()),
            ("withdraw", |s| s.withdraw().is_ok()),
            ("incoming", |s| s.incoming_request(peer()).is_ok()),
            ("accept", |s| s.accept().is_ok()),
            ("reject", |s| s.reject().is_ok()),
            ("remote_withdrew", |s| s.remote_withdrew().is_ok()),
            ("begin_disconnect", |s| s.begin_disconnect().is_ok()),
            ("disconnected", |s| s.disconnected().is_ok()),
            ("remote_disconnected", |s| s.remote_disconnected().is_ok()),
            ("link_lost", |s| s.link_lost().is_ok()),
            ("forget_lost", |s| s.forget_lost().is_ok()),
        ];

        fn check(s: &Session, path: &[&str]) {
            let occupied = s.phase().is_occupied();
            if occupied {
                assert!(s.conversation().is_some(), "no peer after {:?}", path);
                assert!(s.initiator().is_some(), "no initiator after {:?}", path);
            }
            assert_eq!(
                s.is_pending() as u8 + s.is_connected() as u8 + (s.phase() == Phase::Disconnecting) as u8,
                occupied as u8,
                "inconsistent flags after {:?}",
                path
            );
        }

        fn walk(s: &Session, depth: usize, path: &mut Vec<&'static str>, steps: &[(&'static str, Step)]) {
            if depth == 0 {
                return;
            }
            for (name, step) in steps {
                let mut next = Session {
                    phase: s.phase,
                    conversation: s.conversation.clone(),
                    initiator: s.initiator,
                };
                let before = next.phase();
                let ok = step(&mut next);
                if !ok {
                    assert_eq!(next.phase(), before, "failed {} changed phase", name);
                }
                path.push(*name);
                check(&next, path);
                walk(&next, depth - 1, path, steps);
                path.pop();
            }
        }

        walk(&listening(), 5, &mut Vec::new(), &steps);
    }
}
