//! Wire types: the Handshake, chat Messages, and control frames.
//!
//! The client's view of a message is inherently polymorphic over
//! {text, file, encrypted, control}; on the wire this is one tagged
//! JSON object, matched on `type` at the boundary (§9 Dynamic dispatch).

use serde::{Deserialize, Serialize};

/// First frame a client sends on a new connection (§4.5).
#[derive(Debug, Clone, Deserialize)]
pub struct Handshake {
    pub username: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub admin_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    File,
}

/// A chat Message: the fundamental log record (§3).
///
/// `id` and `message_id` are assigned by the Store on insert and are
/// absent on a message still in flight from a client.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,

    pub sender: String,
    #[serde(default)]
    pub content: String,
    pub created_at: chrono::DateTime<chrono::Utc>,

    #[serde(rename = "type")]
    pub kind: MessageType,

    #[serde(default)]
    pub is_encrypted: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FilePayload>,

    /// Present only for encrypted private messages. Opaque to the
    /// server: it stores and forwards these bytes without
    /// interpreting them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilePayload {
    pub filename: String,
    pub size: u64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Out-of-band frames the server pushes: user-list updates, auth
/// failures, pings, system messages. Distinguished from a `Message`
/// by the absence of `sender`/`created_at`.
#[derive(Debug, Clone, Serialize)]
pub struct ControlFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: serde_json::Value,
}

impl ControlFrame {
    pub fn userlist(names: Vec<String>) -> Self {
        Self {
            kind: "userlist",
            data: serde_json::json!(names),
        }
    }

    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self {
            kind: "auth_failed",
            data: serde_json::json!({ "reason": reason.into() }),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            kind: "system",
            data: serde_json::json!({ "text": text.into() }),
        }
    }

    pub fn ping() -> Self {
        Self {
            kind: "ping",
            data: serde_json::Value::Null,
        }
    }
}

mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .encode(bytes)
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        use base64::Engine;
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}
