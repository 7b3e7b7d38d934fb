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

//! Read-only view of the session for callers outside the connector task.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::session::{Phase, Session};
use crate::storage::Conversation;

#[derive(Debug, Clone)]
struct Snapshot {
    phase: Phase,
    conversation: Option<Conversation>,
}

/// Shared session state.
///
/// Written only by the connector task, after each transition and before
/// listeners run, so accessors called from a listener see the new state.
#[derive(Debug)]
pub struct SessionState {
    inner: RwLock<Snapshot>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Snapshot {
                phase: Phase::Idle,
                conversation: None,
            }),
        }
    }
}

impl SessionState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn publish(&self, session: &Session) {
        let mut inner = self.inner.write();
        inner.phase = session.phase();
        inner.conversation = session.conversation().cloned();
    }

    pub fn phase(&self) -> Phase {
        self.inner.read().phase
    }

    pub fn current_conversation(&self) -> Option<Conversation> {
        self.inner.read().conversation.clone()
    }

    pub fn is_connection_prepared(&self) -> bool {
        self.phase().is_prepared()
    }

    pub fn is_pending(&self) -> bool {
        self.phase().is_pending()
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == Phase::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_mirrors_session() {
        let state = SessionState::new();
        assert_eq!(state.phase(), Phase::Idle);
        assert!(!state.is_connection_prepared());

        let mut session = Session::new();
        session.begin_prepare().unwrap();
        session.prepared().unwrap();
        session
            .incoming_request(Conversation::new("AA", "Peer", 1))
            .unwrap();
        state.publish(&session);

        assert!(state.is_connection_prepared());
        assert!(state.is_pending());
        assert!(!state.is_connected());
        assert_eq!(state.current_conversation().unwrap().address, "AA");
    }
}
