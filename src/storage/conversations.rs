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

//! Conversation storage using SQLite.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::models::{from_millis, ChatMessage, Conversation, DeliveryStatus, Direction, Payload};
use super::ConversationStore;

const CONVERSATION_COLUMNS: &str =
    "c.address, c.display_name, c.color, c.last_activity, c.last_message, c.unread";
const MESSAGE_COLUMNS: &str =
    "m.id, m.address, m.direction, m.kind, m.text, m.image, m.timestamp, m.status";

/// SQLite-backed conversation store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open the chat database in `data_dir`.
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("chat.db");
        info!("Opening chat database: {:?}", db_path);
        Self::with_connection(Connection::open(&db_path)?)
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                address TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                color INTEGER NOT NULL,
                last_activity INTEGER,
                last_message TEXT,
                unread INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                address TEXT NOT NULL,
                direction TEXT NOT NULL,
                kind TEXT NOT NULL,
                text TEXT,
                image BLOB,
                timestamp INTEGER NOT NULL,
                status TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_address
                ON messages(address, timestamp);",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let last_activity: Option<i64> = row.get(3)?;
    let unread: i64 = row.get(5)?;
    Ok(Conversation {
        address: row.get(0)?,
        display_name: row.get(1)?,
        color: row.get(2)?,
        last_activity: last_activity.map(from_millis),
        last_message: row.get(4)?,
        unread: unread != 0,
    })
}

/// Read a message starting at column `offset`. Returns `None` when the
/// columns are NULL (no message joined).
fn message_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Option<ChatMessage>> {
    let id: Option<String> = row.get(offset)?;
    let id = match id {
        Some(id) => id,
        None => return Ok(None),
    };
    let id = Uuid::parse_str(&id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(offset, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let direction: String = row.get(offset + 2)?;
    let kind: String = row.get(offset + 3)?;
    let payload = if kind == "IMAGE" {
        let image: Option<Vec<u8>> = row.get(offset + 5)?;
        Payload::Image(image.unwrap_or_default())
    } else {
        let text: Option<String> = row.get(offset + 4)?;
        Payload::Text(text.unwrap_or_default())
    };
    let timestamp: i64 = row.get(offset + 6)?;
    let status: String = row.get(offset + 7)?;

    Ok(Some(ChatMessage {
        id,
        address: row.get(offset + 1)?,
        direction: Direction::from_str(&direction),
        payload,
        timestamp: from_millis(timestamp),
        status: DeliveryStatus::from_str(&status),
    }))
}

impl ConversationStore for SqliteStore {
    fn list_all(&self) -> Result<Vec<Conversation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM conversations c
             ORDER BY c.last_activity IS NULL, c.last_activity DESC, c.address",
            CONVERSATION_COLUMNS
        ))?;
        let conversations = stmt
            .query_map([], conversation_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(conversations)
    }

    fn list_all_with_latest_message(&self) -> Result<Vec<(Conversation, Option<ChatMessage>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, {} FROM conversations c
             LEFT JOIN messages m ON m.id = (
                SELECT id FROM messages
                WHERE address = c.address
                ORDER BY timestamp DESC, rowid DESC
                LIMIT 1
             )
             ORDER BY c.last_activity IS NULL, c.last_activity DESC, c.address",
            CONVERSATION_COLUMNS, MESSAGE_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((conversation_from_row(row)?, message_from_row(row, 6)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn get(&self, address: &str) -> Result<Option<Conversation>> {
        let conn = self.conn.lock();
        let conversation = conn
            .query_row(
                &format!(
                    "SELECT {} FROM conversations c WHERE c.address = ?1",
                    CONVERSATION_COLUMNS
                ),
                [address],
                conversation_from_row,
            )
            .optional()?;
        Ok(conversation)
    }

    fn upsert(&self, conversation: &Conversation) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO conversations
                (address, display_name, color, last_activity, last_message, unread)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conversation.address,
                conversation.display_name,
                conversation.color,
                conversation.last_activity.map(|t| t.timestamp_millis()),
                conversation.last_message,
                conversation.unread as i64,
            ],
        )?;
        debug!("Stored conversation {}", conversation.address);
        Ok(())
    }

    fn delete(&self, address: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM messages WHERE address = ?1", [address])?;
        let removed = tx.execute("DELETE FROM conversations WHERE address = ?1", [address])?;
        tx.commit()?;
        info!("Deleted conversation {} ({} rows)", address, removed);
        Ok(())
    }

    fn add_message(&self, message: &ChatMessage) -> Result<()> {
        let (kind, text, image) = match &message.payload {
            Payload::Text(text) => ("TEXT", Some(text.as_str()), None),
            Payload::Image(data) => ("IMAGE", None, Some(data.as_slice())),
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages (id, address, direction, kind, text, image, timestamp, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id.to_string(),
                message.address,
                message.direction.as_str(),
                kind,
                text,
                image,
                message.timestamp.timestamp_millis(),
                message.status.as_str(),
            ],
        )?;
        Ok(())
    }

    fn update_message_status(&self, id: Uuid, status: DeliveryStatus) -> Result<bool> {
        if !DeliveryStatus::Pending.can_advance_to(status) {
            return Err(anyhow!("cannot move a message to {:?}", status));
        }
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE messages SET status = ?1 WHERE id = ?2 AND status = ?3",
            params![
                status.as_str(),
                id.to_string(),
                DeliveryStatus::Pending.as_str()
            ],
        )?;
        Ok(updated == 1)
    }

    fn messages_for(&self, address: &str) -> Result<Vec<ChatMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages m WHERE m.address = ?1
             ORDER BY m.timestamp ASC, m.rowid ASC",
            MESSAGE_COLUMNS
        ))?;
        let messages = stmt
            .query_map([address], |row| message_from_row(row, 0))?
            .filter_map(|m| m.transpose())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    fn mark_read(&self, address: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE conversations SET unread = 0 WHERE address = ?1",
            [address],
        )?;
        Ok(())
    }
}
