//! Replay (§4.7): personalized history delivered on successful
//! admission. Runs synchronously on the admission path so a client
//! sees its history before any live broadcast.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::error::StoreError;
use crate::store::{Database, StoredMessage};

/// Dedup key used when topping up a short `get_messages_after` result
/// with `get_recent` (§4.7: "(sender, content, created_at@second)").
fn dedup_key(m: &StoredMessage) -> (String, String, i64) {
    (m.sender.clone(), m.content.clone(), m.created_at.timestamp())
}

fn sort_key(m: &StoredMessage) -> (DateTime<Utc>, String, String) {
    (m.created_at, m.sender.clone(), m.content.clone())
}

/// Assembles and delivers replay for `username`, updating its cursor
/// to the Store's then-current max id afterward (§8 Replay
/// monotonicity invariant).
pub async fn replay_for(store: &Database, config: &Config, username: &str) -> Result<Vec<StoredMessage>, StoreError> {
    let messages = store.messages();

    let cursor = messages.get_user_cursor(username).await?;
    let mut combined = match cursor {
        None => messages.get_recent().await?,
        Some((last_id, _)) => {
            let mut after = messages.get_messages_after(last_id, 50).await?;
            if after.len() < 25 {
                let mut seen: HashSet<(String, String, i64)> = after.iter().map(dedup_key).collect();
                for m in messages.get_recent().await? {
                    if seen.insert(dedup_key(&m)) {
                        after.push(m);
                    }
                }
            }
            after
        }
    };

    combined.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));

    if config.ban_gap_redaction {
        let periods = store.bans().get_ban_periods(username).await?;
        combined.retain(|m| {
            !periods.iter().any(|p| match p.unbanned_at {
                Some(unbanned_at) => m.created_at >= p.banned_at && m.created_at < unbanned_at,
                None => m.created_at >= p.banned_at,
            })
        });
    }

    let latest_id = messages.get_latest_id().await?;
    messages.set_user_cursor(username, latest_id).await?;

    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(redact: bool) -> Config {
        let mut cfg: Config = toml::from_str(
            r#"
            listen_addr = "127.0.0.1:0"
            admin_secret = "s3cret"
            "#,
        )
        .unwrap();
        cfg.ban_gap_redaction = redact;
        cfg
    }

    #[tokio::test]
    async fn replay_with_ban_gap_redacts_messages_in_window() {
        let db = Database::new(":memory:").await.unwrap();
        db.messages().insert("alice", "M1", None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        db.bans().record_ban("dave", "root").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        db.messages().insert("alice", "M2", None).await.unwrap();
        db.messages().insert("alice", "M3", None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        db.bans().record_unban("dave").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        db.messages().insert("alice", "M4", None).await.unwrap();

        let redacted = replay_for(&db, &config(true), "dave").await.unwrap();
        let contents: Vec<&str> = redacted.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["M1", "M4"]);
    }

    #[tokio::test]
    async fn replay_without_redaction_returns_everything() {
        let db = Database::new(":memory:").await.unwrap();
        for c in ["M1", "M2", "M3"] {
            db.messages().insert("alice", c, None).await.unwrap();
        }
        db.bans().record_ban("dave", "root").await.unwrap();

        let all = replay_for(&db, &config(false), "dave").await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn replay_sets_cursor_to_latest_id() {
        let db = Database::new(":memory:").await.unwrap();
        db.messages().insert("alice", "hi", None).await.unwrap();
        let id = db.messages().insert("alice", "there", None).await.unwrap();

        replay_for(&db, &config(true), "bob").await.unwrap();
        let (cursor_id, _) = db.messages().get_user_cursor("bob").await.unwrap().unwrap();
        assert_eq!(cursor_id, id);
    }
}
