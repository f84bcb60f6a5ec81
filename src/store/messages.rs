//! Message log operations (§4.1): insert, cap enforcement, retrieval,
//! and per-user replay cursors.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::error::StoreError;
use crate::message::{FilePayload, Message, MessageType};

/// Hard cap on row-count in `messages` (§8 invariant).
const CAP: i64 = 1000;

pub struct MessageRepository<'a> {
    pool: &'a SqlitePool,
}

/// A message as read back from storage, with its assigned ids.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub message_id: i64,
    pub sender: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_encrypted: bool,
    pub kind: MessageType,
    pub file: Option<FilePayload>,
    pub encrypted_data: Option<Vec<u8>>,
    pub nonce: Option<Vec<u8>>,
    pub recipient: Option<String>,
}

impl StoredMessage {
    pub fn into_message(self) -> Message {
        Message {
            id: Some(self.id),
            message_id: Some(self.message_id),
            sender: self.sender,
            content: self.content,
            created_at: self.created_at,
            kind: self.kind,
            is_encrypted: self.is_encrypted,
            file: self.file,
            encrypted_data: self.encrypted_data,
            nonce: self.nonce,
            recipient: self.recipient,
        }
    }

    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, StoreError> {
        let kind_str: String = row.try_get("kind")?;
        let kind = if kind_str == "file" {
            MessageType::File
        } else {
            MessageType::Text
        };
        let file = if kind == MessageType::File {
            let filename: Option<String> = row.try_get("file_name")?;
            let size: Option<i64> = row.try_get("file_size")?;
            let data: Option<Vec<u8>> = row.try_get("file_data")?;
            match (filename, size, data) {
                (Some(filename), Some(size), Some(data)) => Some(FilePayload {
                    filename,
                    size: size as u64,
                    data,
                }),
                _ => None,
            }
        } else {
            None
        };
        Ok(Self {
            id: row.try_get("id")?,
            message_id: row.try_get("message_id")?,
            sender: row.try_get("sender")?,
            content: row.try_get("content")?,
            created_at: row.try_get("created_at")?,
            is_encrypted: row.try_get("is_encrypted")?,
            kind,
            file,
            encrypted_data: row.try_get("encrypted_data")?,
            nonce: row.try_get("nonce")?,
            recipient: row.try_get("recipient")?,
        })
    }
}

/// Composite ordering key used everywhere replay needs a total order
/// (§4.1, §8 Ordering invariant).
fn sort_key(m: &StoredMessage) -> (DateTime<Utc>, String, String) {
    (m.created_at, m.sender.clone(), m.content.clone())
}

fn sort_ascending(mut rows: Vec<StoredMessage>) -> Vec<StoredMessage> {
    rows.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    rows
}

impl<'a> MessageRepository<'a> {
    pub(super) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Appends a plaintext or file message, mirrors the id into
    /// `message_id`, then enforces the cap. Cap-enforcement failures are
    /// logged and swallowed (§7).
    pub async fn insert(&self, sender: &str, content: &str, file: Option<&FilePayload>) -> Result<i64, StoreError> {
        let now = Utc::now();
        let kind = if file.is_some() { "file" } else { "text" };
        let result = sqlx::query(
            "INSERT INTO messages (message_id, sender, content, created_at, is_encrypted, kind, file_name, file_size, file_data)
             VALUES (0, ?, ?, ?, 0, ?, ?, ?, ?)",
        )
        .bind(sender)
        .bind(content)
        .bind(now)
        .bind(kind)
        .bind(file.map(|f| f.filename.clone()))
        .bind(file.map(|f| f.size as i64))
        .bind(file.map(|f| f.data.clone()))
        .execute(self.pool)
        .await?;

        let id = result.last_insert_rowid();
        sqlx::query("UPDATE messages SET message_id = ? WHERE id = ?")
            .bind(id)
            .bind(id)
            .execute(self.pool)
            .await?;

        self.enforce_cap().await;
        Ok(id)
    }

    /// Appends an encrypted private message: ciphertext, nonce,
    /// recipient, and sender plaintext; cap enforced identically.
    pub async fn insert_encrypted(
        &self,
        sender: &str,
        recipient: &str,
        ciphertext: &[u8],
        nonce: &[u8],
    ) -> Result<i64, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO messages (message_id, sender, content, created_at, is_encrypted, kind, encrypted_data, nonce, recipient)
             VALUES (0, ?, '', ?, 1, 'text', ?, ?, ?)",
        )
        .bind(sender)
        .bind(now)
        .bind(ciphertext)
        .bind(nonce)
        .bind(recipient)
        .execute(self.pool)
        .await?;

        let id = result.last_insert_rowid();
        sqlx::query("UPDATE messages SET message_id = ? WHERE id = ?")
            .bind(id)
            .bind(id)
            .execute(self.pool)
            .await?;

        self.enforce_cap().await;
        Ok(id)
    }

    async fn enforce_cap(&self) {
        let result = sqlx::query(
            "DELETE FROM messages WHERE id NOT IN (SELECT id FROM messages ORDER BY id DESC LIMIT ?)",
        )
        .bind(CAP)
        .execute(self.pool)
        .await;
        if let Err(e) = result {
            warn!(error = %e, "cap enforcement failed, will retry on next insert");
        }
    }

    /// The 50 most recent rows, re-sorted ascending for display.
    pub async fn get_recent(&self) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = sqlx::query("SELECT * FROM messages ORDER BY id DESC LIMIT 50")
            .fetch_all(self.pool)
            .await?;
        let parsed = rows
            .iter()
            .map(StoredMessage::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sort_ascending(parsed))
    }

    /// Rows newer than `last_id`, capped at `limit`, re-sorted ascending.
    pub async fn get_messages_after(&self, last_id: i64, limit: i64) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = sqlx::query("SELECT * FROM messages WHERE message_id > ? ORDER BY id DESC LIMIT ?")
            .bind(last_id)
            .bind(limit)
            .fetch_all(self.pool)
            .await?;
        let parsed = rows
            .iter()
            .map(StoredMessage::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sort_ascending(parsed))
    }

    pub async fn get_latest_id(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(id), 0) AS id FROM messages")
            .fetch_one(self.pool)
            .await?;
        Ok(row.try_get("id")?)
    }

    pub async fn get_user_cursor(&self, username: &str) -> Result<Option<(i64, DateTime<Utc>)>, StoreError> {
        let row = sqlx::query("SELECT last_message_id, last_seen FROM user_message_state WHERE username = ?")
            .bind(username.to_lowercase())
            .fetch_optional(self.pool)
            .await?;
        Ok(row.map(|r| (r.get("last_message_id"), r.get("last_seen"))))
    }

    pub async fn set_user_cursor(&self, username: &str, last_message_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO user_message_state (username, last_message_id, last_seen)
             VALUES (?, ?, ?)
             ON CONFLICT(username) DO UPDATE SET last_message_id = excluded.last_message_id, last_seen = excluded.last_seen",
        )
        .bind(username.to_lowercase())
        .bind(last_message_id)
        .bind(Utc::now())
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_user_cursor(&self, username: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM user_message_state WHERE username = ?")
            .bind(username.to_lowercase())
            .execute(self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    #[tokio::test]
    async fn insert_assigns_matching_id_and_message_id() {
        let db = Database::new(":memory:").await.unwrap();
        let id = db.messages().insert("alice", "hi", None).await.unwrap();
        let recent = db.messages().get_recent().await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, id);
        assert_eq!(recent[0].message_id, id);
    }

    #[tokio::test]
    async fn cap_enforcement_keeps_newest_1000() {
        let db = Database::new(":memory:").await.unwrap();
        for i in 0..1100 {
            db.messages().insert("alice", &format!("m{i}"), None).await.unwrap();
        }
        let stats = db.stats().await.unwrap();
        assert_eq!(stats.message_count, 1000);

        let recent = db.messages().get_recent().await.unwrap();
        assert_eq!(recent.len(), 50);
        assert_eq!(recent.last().unwrap().content, "m1099");
    }

    #[tokio::test]
    async fn get_recent_is_sorted_ascending_by_composite_key() {
        let db = Database::new(":memory:").await.unwrap();
        db.messages().insert("bob", "second", None).await.unwrap();
        db.messages().insert("alice", "first", None).await.unwrap();
        let recent = db.messages().get_recent().await.unwrap();
        let mut sorted = recent.clone();
        sorted.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        assert_eq!(
            recent.iter().map(|m| &m.content).collect::<Vec<_>>(),
            sorted.iter().map(|m| &m.content).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn cursor_round_trips_and_clears() {
        let db = Database::new(":memory:").await.unwrap();
        assert!(db.messages().get_user_cursor("alice").await.unwrap().is_none());
        db.messages().set_user_cursor("alice", 42).await.unwrap();
        let (id, _) = db.messages().get_user_cursor("ALICE").await.unwrap().unwrap();
        assert_eq!(id, 42);
        db.messages().clear_user_cursor("Alice").await.unwrap();
        assert!(db.messages().get_user_cursor("alice").await.unwrap().is_none());
    }
}
