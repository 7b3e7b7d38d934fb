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

//! Persistence for conversations, messages and the local profile.

mod conversations;
mod models;
mod profile;

use anyhow::Result;
use uuid::Uuid;

pub use conversations::SqliteStore;
pub use models::{
    now_millis, ChatMessage, Conversation, DeliveryStatus, Direction, Payload, Profile,
};
pub use profile::FileProfileStore;

/// Conversation and message persistence consumed by the connector.
pub trait ConversationStore: Send + Sync {
    /// All conversations, most recent activity first.
    fn list_all(&self) -> Result<Vec<Conversation>>;

    /// All conversations paired with their newest message, most recent first.
    fn list_all_with_latest_message(&self) -> Result<Vec<(Conversation, Option<ChatMessage>)>>;

    fn get(&self, address: &str) -> Result<Option<Conversation>>;

    /// Insert or replace the row keyed by `conversation.address`.
    fn upsert(&self, conversation: &Conversation) -> Result<()>;

    /// Delete a conversation and its messages. Unknown addresses are ignored.
    fn delete(&self, address: &str) -> Result<()>;

    fn add_message(&self, message: &ChatMessage) -> Result<()>;

    /// Move a message out of `Pending`. Returns false if the message is
    /// unknown or the move would regress its status.
    fn update_message_status(&self, id: Uuid, status: DeliveryStatus) -> Result<bool>;

    /// Messages of one conversation ordered by timestamp.
    fn messages_for(&self, address: &str) -> Result<Vec<ChatMessage>>;

    fn mark_read(&self, address: &str) -> Result<()>;
}

/// Source of the local user's profile.
pub trait ProfileStore: Send + Sync {
    fn get_profile(&self) -> Result<Profile>;
}

impl ProfileStore for Profile {
    fn get_profile(&self) -> Result<Profile> {
        Ok(self.clone())
    }
}
