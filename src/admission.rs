//! Admission (§4.5): validates the handshake and decides whether a new
//! connection becomes a Session.
//!
//! Grounded in the teacher's registration flow (`handlers/` NICK/USER
//! validation chain), generalized to this protocol's single-frame
//! handshake.

use crate::config::Config;
use crate::error::AdmissionError;
use crate::hub::HubHandle;
use crate::message::Handshake;

/// Validated handshake, ready for Session construction.
pub struct Admitted {
    pub username: String,
    pub is_admin: bool,
}

fn is_valid_username_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'
}

/// Runs the full validation order of §4.5, steps 1-5. `existing_names`
/// must reflect the live Sessions map at the moment of the check;
/// duplicate detection is therefore inherently racy with concurrent
/// admissions and is resolved by Hub registration being the single
/// serialization point (the second registrant to reach the Hub wins
/// only if it beat the first's insert, matching the teacher's
/// accepted-latent-race note for this class of check).
pub async fn admit(
    handshake: &Handshake,
    config: &Config,
    hub: &HubHandle,
    existing_names: &[String],
) -> Result<Admitted, AdmissionError> {
    let username = handshake.username.trim().to_string();

    // 1. non-empty, <=32 bytes, charset, no leading ':'/'.' or "..".
    if username.is_empty() {
        return Err(AdmissionError::EmptyUsername);
    }
    if username.len() > 32 {
        return Err(AdmissionError::UsernameTooLong);
    }
    if !username.chars().all(is_valid_username_char) {
        return Err(AdmissionError::InvalidUsernameChars);
    }
    if username.starts_with(':') || username.starts_with('.') || username.contains("..") {
        return Err(AdmissionError::InvalidUsernameChars);
    }

    let lowered = username.to_lowercase();

    // 2. allowlist.
    if !config.allowlist.is_empty() && !config.allowlist.iter().any(|n| n.to_lowercase() == lowered) {
        return Err(AdmissionError::NotAllowlisted);
    }

    // 3. admin check.
    let is_admin = handshake.admin;
    if is_admin {
        let in_admin_list = config.admin_usernames.iter().any(|n| n.to_lowercase() == lowered);
        let key_ok = handshake
            .admin_key
            .as_deref()
            .map(|k| k == config.admin_secret)
            .unwrap_or(false);
        if !in_admin_list || !key_ok {
            return Err(AdmissionError::InvalidAdminKey);
        }
    }

    // 4. duplicate name, case-insensitive.
    if existing_names.iter().any(|n| n.to_lowercase() == lowered) {
        return Err(AdmissionError::UsernameTaken);
    }

    // 5. ban / temp-kick check.
    if hub.moderation.is_permanently_banned(&username) {
        return Err(AdmissionError::Banned);
    }
    if hub.moderation.is_banned(&username) {
        return Err(AdmissionError::Kicked);
    }

    Ok(Admitted { username, is_admin })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::ModerationState;
    use crate::store::Database;
    use tokio::sync::broadcast;

    async fn test_hub() -> HubHandle {
        let db = Database::new(":memory:").await.unwrap();
        let moderation = ModerationState::new(db.clone());
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (hub, handle) = crate::hub::Hub::new(db, moderation, shutdown_rx);
        tokio::spawn(hub.run());
        handle
    }

    fn config() -> Config {
        toml::from_str(
            r#"
            listen_addr = "127.0.0.1:0"
            admin_secret = "s3cret"
            admin_usernames = ["root"]
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn rejects_duplicate_case_insensitive_name() {
        let config = config();
        let hub = test_hub().await;
        let hs = Handshake {
            username: "ALICE".to_string(),
            admin: false,
            admin_key: None,
        };
        let err = admit(&hs, &config, &hub, &["alice".to_string()]).await.unwrap_err();
        assert_eq!(err, AdmissionError::UsernameTaken);
    }

    #[tokio::test]
    async fn rejects_bad_admin_key() {
        let config = config();
        let hub = test_hub().await;
        let hs = Handshake {
            username: "root".to_string(),
            admin: true,
            admin_key: Some("wrong".to_string()),
        };
        let err = admit(&hs, &config, &hub, &[]).await.unwrap_err();
        assert_eq!(err, AdmissionError::InvalidAdminKey);
    }

    #[tokio::test]
    async fn accepts_valid_admin() {
        let config = config();
        let hub = test_hub().await;
        let hs = Handshake {
            username: "root".to_string(),
            admin: true,
            admin_key: Some("s3cret".to_string()),
        };
        let admitted = admit(&hs, &config, &hub, &[]).await.unwrap();
        assert!(admitted.is_admin);
        assert_eq!(admitted.username, "root");
    }

    #[tokio::test]
    async fn rejects_username_with_double_dot() {
        let config = config();
        let hub = test_hub().await;
        let hs = Handshake {
            username: "a..b".to_string(),
            admin: false,
            admin_key: None,
        };
        let err = admit(&hs, &config, &hub, &[]).await.unwrap_err();
        assert_eq!(err, AdmissionError::InvalidUsernameChars);
    }
}
