//! Unified error hierarchy for relaychat-hub.
//!
//! Each component boundary gets its own error enum, mirroring the error
//! shape the rest of the server's channels and handlers expect: nothing
//! here is a panic path except the one documented programmer-error trap.

use thiserror::Error;

/// Errors from the persistent message/ban store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Reasons a handshake can be rejected (§4.5). Each variant's Display
/// text is the reason string sent to the client before the transport
/// closes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Malformed handshake")]
    MalformedHandshake,
    #[error("Username is required")]
    EmptyUsername,
    #[error("Username must be 32 bytes or fewer")]
    UsernameTooLong,
    #[error("Username contains invalid characters")]
    InvalidUsernameChars,
    #[error("Username is not allowed")]
    NotAllowlisted,
    #[error("invalid admin key")]
    InvalidAdminKey,
    #[error("Username already taken")]
    UsernameTaken,
    #[error("You are banned from this server")]
    Banned,
    #[error("You have been kicked and may not reconnect yet")]
    Kicked,
}

/// Errors raised while loading, starting, or routing to a plugin.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("invalid plugin name: {0}")]
    InvalidName(String),
    #[error("manifest error: {0}")]
    Manifest(String),
    #[error("plugin binary not found: {0}")]
    BinaryNotFound(String),
    #[error("failed to spawn plugin process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("plugin platform mismatch: {0}. Try reinstalling the plugin built for this OS/architecture")]
    PlatformMismatch(String),
    #[error("plugin did not shut down within the grace period and was killed")]
    ShutdownTimeout,
    #[error("plugin {0} is not installed")]
    NotInstalled(String),
    #[error("plugin install failed: {0}")]
    Install(String),
    #[error("{0}")]
    Other(String),
}

/// Errors from a Session's two pumps.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport read error: {0}")]
    Read(String),
    #[error("transport write error: {0}")]
    Write(String),
    #[error("frame too large ({0} bytes, max {1})")]
    FrameTooLarge(usize, usize),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Errors raised by command parsing/dispatch (§4.6).
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("this command requires administrator privileges")]
    AdminOnly,
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),
    #[error("unterminated quoted argument")]
    UnterminatedQuote,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_reason_strings_match_spec_wording() {
        assert_eq!(AdmissionError::UsernameTaken.to_string(), "Username already taken");
        assert_eq!(AdmissionError::Banned.to_string(), "You are banned from this server");
    }

    #[test]
    fn plugin_error_wraps_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let err: PluginError = io_err.into();
        assert!(matches!(err, PluginError::Spawn(_)));
    }
}
