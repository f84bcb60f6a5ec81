//! Server configuration, loaded from a TOML file.
//!
//! Mirrors the external loader's contract (spec §6): the flat set of
//! fields below is everything this crate reads. The interactive setup
//! wizard and `.env` parsing that produce this file in production are
//! out of scope here — this module only owns the struct and its loader.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(String, std::io::Error),
    #[error("failed to parse config file {0}: {1}")]
    Parse(String, toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the server listens on, e.g. "0.0.0.0:8080".
    pub listen_addr: String,

    /// Shared secret admin clients must present in the handshake's
    /// `admin_key` field when `admin: true`.
    pub admin_secret: String,

    /// Usernames (case-insensitive) permitted to authenticate as admin.
    #[serde(default)]
    pub admin_usernames: Vec<String>,

    /// Path to the SQLite database file, or ":memory:".
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Per-message file payload ceiling, in bytes.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,

    /// Optional allowlist; if non-empty, only these usernames (lowercased)
    /// may connect.
    #[serde(default)]
    pub allowlist: Vec<String>,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Redact messages sent during a user's ban windows from their replay.
    #[serde(default = "default_true")]
    pub ban_gap_redaction: bool,

    /// Base URL of the plugin registry, used by `:plugin store`/`refresh`.
    #[serde(default)]
    pub plugin_registry_url: Option<String>,

    /// Optional server-wide E2E passphrase, forwarded to clients out of
    /// band; never used by the server for anything cryptographic.
    #[serde(default)]
    pub e2e_passphrase: Option<String>,

    /// Directory holding installed plugin subdirectories.
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// TCP port for the Prometheus `/metrics` endpoint. 0 disables it.
    #[serde(default)]
    pub metrics_port: u16,

    #[serde(default)]
    pub idle_timeouts: IdleTimeoutsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Idle/keepalive knobs for a Session's pumps. Defaults are borrowed
/// from the ircd this crate grew out of; spec.md names the mechanism
/// without giving numbers.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct IdleTimeoutsConfig {
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_secs: u64,
}

impl Default for IdleTimeoutsConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            timeout_secs: default_timeout(),
            registration_timeout_secs: default_registration_timeout(),
        }
    }
}

fn default_ping_interval() -> u64 {
    90
}
fn default_timeout() -> u64 {
    120
}
fn default_registration_timeout() -> u64 {
    60
}
fn default_database_path() -> String {
    "relaychat.db".to_string()
}
fn default_max_file_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_plugin_dir() -> String {
    "plugins".to_string()
}
fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse(path.display().to_string(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_in_defaults() {
        let raw = r#"
            listen_addr = "127.0.0.1:9999"
            admin_secret = "s3cret"
        "#;
        let cfg: Config = toml::from_str(raw).unwrap();
        assert_eq!(cfg.database_path, "relaychat.db");
        assert_eq!(cfg.max_file_bytes, 10 * 1024 * 1024);
        assert!(cfg.ban_gap_redaction);
        assert_eq!(cfg.metrics_port, 0);
        assert_eq!(cfg.idle_timeouts.ping_interval_secs, 90);
        assert_eq!(cfg.log_format, LogFormat::Pretty);
    }

    #[test]
    fn load_missing_file_is_a_read_error() {
        let err = Config::load("/nonexistent/path/relaychat.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read(_, _)));
    }
}
