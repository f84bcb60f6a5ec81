//! Ban history log (§4.1, §3 Ban Period): append-only rows backing
//! admin audit and ban-gap redaction during Replay. Distinct from the
//! in-memory ban/kick maps in [`crate::moderation`].

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::StoreError;

pub struct BanRepository<'a> {
    pool: &'a SqlitePool,
}

#[derive(Debug, Clone)]
pub struct BanPeriod {
    pub banned_at: DateTime<Utc>,
    pub unbanned_at: Option<DateTime<Utc>>,
    pub banned_by: String,
}

impl<'a> BanRepository<'a> {
    pub(super) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Appends an open ban row. Invariant: at most one open row per
    /// username at a time (enforced by callers closing any prior open
    /// row via `record_unban` before banning again, as moderation state
    /// already guarantees ban/kick exclusivity).
    pub async fn record_ban(&self, username: &str, by: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO ban_history (username, banned_at, banned_by) VALUES (?, ?, ?)")
            .bind(username.to_lowercase())
            .bind(Utc::now())
            .bind(by)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Closes the currently-open row for `username`, if any. No-op
    /// otherwise.
    pub async fn record_unban(&self, username: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE ban_history SET unbanned_at = ?
             WHERE username = ? AND unbanned_at IS NULL
             AND id = (SELECT id FROM ban_history WHERE username = ? AND unbanned_at IS NULL ORDER BY id DESC LIMIT 1)",
        )
        .bind(Utc::now())
        .bind(username.to_lowercase())
        .bind(username.to_lowercase())
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Chronological list of ban periods for a user.
    pub async fn get_ban_periods(&self, username: &str) -> Result<Vec<BanPeriod>, StoreError> {
        let rows = sqlx::query(
            "SELECT banned_at, unbanned_at, banned_by FROM ban_history WHERE username = ? ORDER BY banned_at ASC",
        )
        .bind(username.to_lowercase())
        .fetch_all(self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(BanPeriod {
                    banned_at: row.try_get("banned_at")?,
                    unbanned_at: row.try_get("unbanned_at")?,
                    banned_by: row.try_get("banned_by")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    #[tokio::test]
    async fn unban_without_prior_ban_is_a_no_op() {
        let db = Database::new(":memory:").await.unwrap();
        db.bans().record_unban("nobody").await.unwrap();
        let periods = db.bans().get_ban_periods("nobody").await.unwrap();
        assert!(periods.is_empty());
    }

    #[tokio::test]
    async fn ban_then_unban_closes_the_open_row() {
        let db = Database::new(":memory:").await.unwrap();
        db.bans().record_ban("bob", "root").await.unwrap();
        let periods = db.bans().get_ban_periods("BOB").await.unwrap();
        assert_eq!(periods.len(), 1);
        assert!(periods[0].unbanned_at.is_none());

        db.bans().record_unban("bob").await.unwrap();
        let periods = db.bans().get_ban_periods("bob").await.unwrap();
        assert_eq!(periods.len(), 1);
        assert!(periods[0].unbanned_at.is_some());
    }
}
