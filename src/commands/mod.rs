//! Command Dispatcher (§4.6): quote-aware tokenization, admin-only
//! enforcement, and routing to the Hub, Store, or Plugin Host.
//!
//! Grounded in the teacher's `handlers/mod.rs` `Registry`/`Handler`
//! pattern, generalized from IRC verbs to this protocol's `:`-prefixed
//! commands.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::CommandError;
use crate::hub::{HubHandle, OutgoingFrame};
use crate::message::ControlFrame;
use crate::plugins::PluginHost;
use crate::store::Database;

const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(300);

struct PendingConfirmation {
    expected_token: &'static str,
    command: PendingCommand,
    expires_at: Instant,
}

#[derive(Clone)]
enum PendingCommand {
    ClearDb,
    Ban(String),
    Kick(String),
}

/// Per-server dispatcher state: the one pending confirmation per user
/// (§4.6).
pub struct Dispatcher {
    store: Database,
    hub: HubHandle,
    plugins: PluginHost,
    pending: Mutex<HashMap<String, PendingConfirmation>>,
}

/// Identity of the Session issuing a command.
pub struct CommandContext<'a> {
    pub username: &'a str,
    pub is_admin: bool,
}

/// Quote-aware tokenizer (§4.3/§4.6): double-quoted arguments may
/// contain spaces; `\"` and `\\` are honored as escapes.
pub fn tokenize(line: &str) -> Result<Vec<String>, CommandError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    let mut started_token = false;

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                started_token = true;
            }
            '\\' if in_quotes => match chars.next() {
                Some('"') => current.push('"'),
                Some('\\') => current.push('\\'),
                Some(other) => {
                    current.push('\\');
                    current.push(other);
                }
                None => return Err(CommandError::UnterminatedQuote),
            },
            c if c.is_whitespace() && !in_quotes => {
                if started_token {
                    tokens.push(std::mem::take(&mut current));
                    started_token = false;
                }
            }
            c => {
                current.push(c);
                started_token = true;
            }
        }
    }

    if in_quotes {
        return Err(CommandError::UnterminatedQuote);
    }
    if started_token {
        tokens.push(current);
    }
    Ok(tokens)
}

fn is_admin_only(command: &str) -> bool {
    matches!(
        command,
        ":ban" | ":unban" | ":kick" | ":allow" | ":forcedisconnect" | ":cleardb" | ":backup"
            | ":plugin" | ":install" | ":uninstall" | ":enable" | ":disable"
    )
}

impl Dispatcher {
    pub fn new(store: Database, hub: HubHandle, plugins: PluginHost) -> Self {
        Self {
            store,
            hub,
            plugins,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `username` has a confirmation awaiting its next message
    /// (§4.6). The read loop uses this to route a bare confirmation
    /// token (no `:` prefix) into `dispatch` instead of treating it as
    /// chat.
    pub async fn has_pending(&self, username: &str) -> bool {
        self.pending.lock().await.contains_key(&username.to_lowercase())
    }

    /// Handles one `:`-prefixed line. Returns a system-message string to
    /// send privately back to the requester, if any.
    pub async fn dispatch(&self, ctx: &CommandContext<'_>, line: &str) -> Result<Option<String>, CommandError> {
        if let Some(reply) = self.try_confirm(ctx, line).await {
            return Ok(Some(reply));
        }

        let tokens = tokenize(line)?;
        let Some(command) = tokens.first().cloned() else {
            return Ok(None);
        };

        if is_admin_only(&command) && !ctx.is_admin {
            return Err(CommandError::AdminOnly);
        }

        let args = &tokens[1..];
        match command.as_str() {
            ":ban" => self.request_confirmation(ctx, "BAN", PendingCommand::Ban(arg(args, 0)?)).await,
            ":kick" => self.request_confirmation(ctx, "KICK", PendingCommand::Kick(arg(args, 0)?)).await,
            ":unban" => {
                let target = arg(args, 0)?;
                self.hub.moderation.unban_user(&target).await;
                Ok(Some(format!("{target} unbanned")))
            }
            ":allow" => {
                let target = arg(args, 0)?;
                self.hub.moderation.allow_user(&target).await;
                Ok(Some(format!("{target} allowed to reconnect")))
            }
            ":forcedisconnect" => {
                let target = arg(args, 0)?;
                self.hub.force_disconnect(target.clone()).await;
                Ok(Some(format!("{target} disconnected")))
            }
            ":cleardb" => self.request_confirmation(ctx, "CONFIRM", PendingCommand::ClearDb).await,
            ":backup" => {
                let path = args.first().cloned().unwrap_or_else(|| "backup.db".to_string());
                self.store.backup(&path).await?;
                Ok(Some(format!("backup written to {path}")))
            }
            ":stats" => {
                let stats = self.store.stats().await?;
                Ok(Some(format!(
                    "messages={} tracked_users={} open_bans={}",
                    stats.message_count, stats.tracked_users, stats.open_bans
                )))
            }
            ":plugin" | ":install" | ":uninstall" | ":enable" | ":disable" | ":list" => {
                self.dispatch_plugin_op(&command, args).await
            }
            other => {
                // Plugin-provided command lookup (§4.6): forward args as
                // an opaque JSON array to whichever plugin declares it.
                let data = serde_json::json!(args);
                self.plugins
                    .dispatch_command(other.trim_start_matches(':'), data)
                    .await
                    .map(|_| None)
                    .map_err(CommandError::from)
            }
        }
    }

    async fn dispatch_plugin_op(&self, command: &str, args: &[String]) -> Result<Option<String>, CommandError> {
        let sub = if command == ":plugin" {
            args.first().map(|s| s.as_str()).unwrap_or("")
        } else {
            command.trim_start_matches(':')
        };
        let rest = if command == ":plugin" { &args[1.min(args.len())..] } else { args };

        match sub {
            "list" => {
                let summaries = self.plugins.list().await;
                Ok(Some(serde_json::to_string(&summaries).unwrap_or_default()))
            }
            "install" => {
                let name = arg(rest, 0)?;
                let source = arg(rest, 1)?;
                let checksum = rest.get(2).map(|s| s.as_str());
                self.plugins.install(&name, &source, checksum).await?;
                Ok(Some(format!("{name} installed")))
            }
            "uninstall" => {
                let name = arg(rest, 0)?;
                self.plugins.uninstall(&name).await?;
                Ok(Some(format!("{name} uninstalled")))
            }
            "enable" => {
                let name = arg(rest, 0)?;
                self.plugins.enable(&name).await?;
                Ok(Some(format!("{name} enabled")))
            }
            "disable" => {
                let name = arg(rest, 0)?;
                self.plugins.disable(&name).await?;
                Ok(Some(format!("{name} disabled")))
            }
            "store" | "refresh" => Ok(Some("plugin registry browsing is not implemented in this build".to_string())),
            _ => Err(CommandError::Unknown(command.to_string())),
        }
    }

    /// Interposes a confirmation prompt for a destructive operation
    /// instead of executing it immediately (§4.6).
    async fn request_confirmation(
        &self,
        ctx: &CommandContext<'_>,
        token: &'static str,
        command: PendingCommand,
    ) -> Result<Option<String>, CommandError> {
        self.pending.lock().await.insert(
            ctx.username.to_lowercase(),
            PendingConfirmation {
                expected_token: token,
                command,
                expires_at: Instant::now() + CONFIRMATION_TIMEOUT,
            },
        );
        Ok(Some(format!("Type {token} to confirm this action within 5 minutes")))
    }

    /// If `line` is a confirmation reply for a pending operation,
    /// executes it and returns the result message.
    async fn try_confirm(&self, ctx: &CommandContext<'_>, line: &str) -> Option<String> {
        let key = ctx.username.to_lowercase();
        let pending = {
            let mut guard = self.pending.lock().await;
            match guard.get(&key) {
                Some(p) if p.expires_at < Instant::now() => {
                    guard.remove(&key);
                    return Some("confirmation expired".to_string());
                }
                Some(p) if p.expected_token == line.trim() => guard.remove(&key),
                _ => None,
            }
        };
        let pending = pending?;
        match pending.command {
            PendingCommand::ClearDb => {
                match self.store.clear_messages().await {
                    Ok(()) => {
                        info!(user = ctx.username, "cleardb confirmed");
                        Some("database cleared".to_string())
                    }
                    Err(e) => {
                        warn!(user = ctx.username, error = %e, "cleardb failed");
                        Some(format!("failed to clear database: {e}"))
                    }
                }
            }
            PendingCommand::Ban(target) => {
                let newly = self.hub.moderation.ban_user(&target, ctx.username).await;
                if newly {
                    crate::metrics::SESSIONS_BANNED.inc();
                    self.hub
                        .broadcast(OutgoingFrame::Control(ControlFrame::system(format!(
                            "{target} was permanently banned"
                        ))))
                        .await;
                    self.hub.force_disconnect(target.clone()).await;
                }
                Some(format!("{target} permanently banned"))
            }
            PendingCommand::Kick(target) => {
                let kicked = self.hub.moderation.kick_user(&target).await;
                if kicked {
                    crate::metrics::SESSIONS_BANNED.inc();
                    self.hub.force_disconnect(target.clone()).await;
                    Some(format!("{target} kicked for 24 hours"))
                } else {
                    warn!(target, "kick attempt ignored, user permanently banned");
                    Some(format!("{target} is already permanently banned"))
                }
            }
        }
    }
}

fn arg(args: &[String], idx: usize) -> Result<String, CommandError> {
    args.get(idx)
        .cloned()
        .ok_or(CommandError::MissingArgument("target"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_splits_on_whitespace() {
        assert_eq!(tokenize(":ban bob").unwrap(), vec![":ban", "bob"]);
    }

    #[test]
    fn tokenize_honors_quoted_spaces() {
        assert_eq!(
            tokenize(r#":backup "my backup.db""#).unwrap(),
            vec![":backup", "my backup.db"]
        );
    }

    #[test]
    fn tokenize_honors_escapes() {
        assert_eq!(
            tokenize(r#":say "She said \"hi\"""#).unwrap(),
            vec![":say", r#"She said "hi""#]
        );
    }

    #[test]
    fn tokenize_rejects_unterminated_quote() {
        assert!(tokenize(r#":backup "unterminated"#).is_err());
    }
}
