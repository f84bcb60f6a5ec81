//! The Message Store (§4.1): an on-disk relational log behind one
//! contract, backed here by embedded SQLite with WAL enabled.

pub mod bans;
pub mod messages;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::error::StoreError;

pub use bans::{BanPeriod, BanRepository};
pub use messages::{MessageRepository, StoredMessage};

/// Embedded migration files, applied in order. Each is gated by an
/// existence check rather than a version table, the way the teacher's
/// `db/mod.rs` guards re-running a migration against an already-current
/// schema.
const MIGRATIONS: &[(&str, &str)] = &[("001_init", include_str!("../../migrations/001_init.sql"))];

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = if path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::from_str(&format!("sqlite://{path}"))?
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(60))
            .connect_with(options)
            .await?;

        sqlx::query("PRAGMA temp_store = MEMORY;")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA cache_size = -20000;")
            .execute(&pool)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        for (name, sql) in MIGRATIONS {
            if self.table_exists("messages").await? && *name == "001_init" {
                continue;
            }
            self.run_migration_file(name, sql).await?;
        }
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT name FROM sqlite_master WHERE type='table' AND name = ?")
            .bind(table)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn run_migration_file(&self, name: &str, sql: &str) -> Result<(), StoreError> {
        info!(migration = name, "applying migration");
        for statement in sql.split(';') {
            let statement = statement
                .lines()
                .filter(|l| !l.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            if let Err(e) = sqlx::query(statement).execute(&self.pool).await {
                let msg = e.to_string();
                if msg.contains("already exists") {
                    warn!(migration = name, %msg, "statement skipped, already applied");
                    continue;
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    pub fn messages(&self) -> MessageRepository<'_> {
        MessageRepository::new(&self.pool)
    }

    pub fn bans(&self) -> BanRepository<'_> {
        BanRepository::new(&self.pool)
    }

    /// Admin introspection (§4.1 Stats).
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let message_count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM messages")
            .fetch_one(&self.pool)
            .await?
            .get("c");
        let user_count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM user_message_state")
            .fetch_one(&self.pool)
            .await?
            .get("c");
        let open_bans: i64 =
            sqlx::query("SELECT COUNT(*) AS c FROM ban_history WHERE unbanned_at IS NULL")
                .fetch_one(&self.pool)
                .await?
                .get("c");
        Ok(StoreStats {
            message_count: message_count as u64,
            tracked_users: user_count as u64,
            open_bans: open_bans as u64,
        })
    }

    /// Admin introspection (§4.1 Backup): copies the live database file
    /// to `path` via SQLite's own backup mechanism.
    pub async fn backup(&self, path: &str) -> Result<(), StoreError> {
        sqlx::query("VACUUM INTO ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// `:cleardb` (§4.6 Database ops): purges the message log and every
    /// user's replay cursor, forcing a clean Replay on next reconnect.
    /// Ban history is untouched; it is an audit log, not a cache.
    pub async fn clear_messages(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM messages").execute(&self.pool).await?;
        sqlx::query("DELETE FROM user_message_state").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StoreStats {
    pub message_count: u64,
    pub tracked_users: u64,
    pub open_bans: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_database_creates_schema() {
        let db = Database::new(":memory:").await.unwrap();
        assert!(db.table_exists("messages").await.unwrap());
        assert!(db.table_exists("user_message_state").await.unwrap());
        assert!(db.table_exists("ban_history").await.unwrap());
    }

    #[tokio::test]
    async fn clear_messages_purges_log_and_cursors() {
        let db = Database::new(":memory:").await.unwrap();
        db.messages().insert("alice", "hi", None).await.unwrap();
        db.messages().set_user_cursor("alice", 1).await.unwrap();

        db.clear_messages().await.unwrap();

        assert_eq!(db.stats().await.unwrap().message_count, 0);
        assert!(db.messages().get_user_cursor("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_on_empty_database_is_zero() {
        let db = Database::new(":memory:").await.unwrap();
        let stats = db.stats().await.unwrap();
        assert_eq!(stats.message_count, 0);
        assert_eq!(stats.tracked_users, 0);
        assert_eq!(stats.open_bans, 0);
    }
}
