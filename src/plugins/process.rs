//! Plugin subprocess lifecycle and the newline-delimited JSON wire
//! protocol (§4.8).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, instrument, warn};

use crate::error::PluginError;
use crate::hub::OutgoingFrame;
use crate::message::{Message, MessageType};
use crate::metrics;

/// Host -> plugin request.
#[derive(Debug, Clone, Serialize)]
pub struct PluginRequest {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub data: serde_json::Value,
}

/// Plugin -> host response.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginResponse {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StderrLogLine {
    level: String,
    message: String,
}

/// A running plugin subprocess and its half-owned pipes. The stdin
/// handle is behind a mutex since Stop/SendMessage both write to it.
pub struct PluginProcess {
    child: Child,
    stdin: Mutex<ChildStdin>,
}

/// Substrings the OS surfaces for a binary built for the wrong
/// platform (§4.8 Start).
const PLATFORM_MISMATCH_SUBSTRINGS: &[&str] = &[
    "exec format error",
    "not a valid win32 application",
    "wrong architecture",
    "%1 is not a valid win32 application",
];

impl PluginProcess {
    /// Spawns the plugin binary with its plugin directory as CWD, pipes
    /// stdin/stdout/stderr, sends `init`, and spawns stdout/stderr
    /// drain tasks. The stdout drain forwards decoded `message`
    /// responses onto `inbound_tx` (dropped if that bounded channel is
    /// full — §4.8 Broadcast semantics).
    #[instrument(skip(inbound_tx, init_config), fields(plugin = %name))]
    pub async fn start(
        name: &str,
        binary_path: &PathBuf,
        plugin_dir: &PathBuf,
        init_config: serde_json::Value,
        inbound_tx: mpsc::Sender<OutgoingFrame>,
    ) -> Result<Self, PluginError> {
        let mut command = tokio::process::Command::new(binary_path);
        command
            .current_dir(plugin_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = command.spawn().map_err(classify_spawn_error)?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let process = Self {
            child,
            stdin: Mutex::new(stdin),
        };

        process
            .send(PluginRequest {
                kind: "init",
                command: None,
                data: init_config,
            })
            .await?;

        let plugin_name = name.to_string();
        tokio::spawn(drain_stdout(plugin_name.clone(), stdout, inbound_tx));
        tokio::spawn(drain_stderr(plugin_name, stderr));

        Ok(process)
    }

    pub async fn send(&self, req: PluginRequest) -> Result<(), PluginError> {
        let mut line = serde_json::to_string(&req).expect("PluginRequest is always serializable");
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(PluginError::Spawn)?;
        metrics::PLUGIN_MESSAGES_OUT.inc();
        Ok(())
    }

    /// Sends `shutdown`, waits up to 5 seconds, then kills (§4.8 Stop).
    pub async fn stop(mut self) -> Result<(), PluginError> {
        let _ = self
            .send(PluginRequest {
                kind: "shutdown",
                command: None,
                data: serde_json::Value::Null,
            })
            .await;

        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!("plugin did not exit within grace period, killing");
                let _ = self.child.kill().await;
                Err(PluginError::ShutdownTimeout)
            }
        }
    }
}

fn classify_spawn_error(e: std::io::Error) -> PluginError {
    let msg = e.to_string();
    if PLATFORM_MISMATCH_SUBSTRINGS.iter().any(|s| msg.contains(s)) {
        PluginError::PlatformMismatch(msg)
    } else {
        PluginError::Spawn(e)
    }
}

async fn drain_stdout(
    plugin_name: String,
    stdout: tokio::process::ChildStdout,
    inbound_tx: mpsc::Sender<OutgoingFrame>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<PluginResponse>(&line) {
                    Ok(resp) if resp.kind == "message" => {
                        let text = resp
                            .data
                            .as_ref()
                            .and_then(|d| d.get("content"))
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        let sender = resp
                            .data
                            .as_ref()
                            .and_then(|d| d.get("sender"))
                            .and_then(|v| v.as_str())
                            .unwrap_or(&plugin_name)
                            .to_string();
                        let message = Message {
                            id: None,
                            message_id: None,
                            sender,
                            content: text,
                            created_at: chrono::Utc::now(),
                            kind: MessageType::Text,
                            is_encrypted: false,
                            file: None,
                            encrypted_data: None,
                            nonce: None,
                            recipient: None,
                        };
                        if inbound_tx.try_send(OutgoingFrame::Message(message)).is_err() {
                            warn!(plugin = %plugin_name, "plugin inbound channel full, dropping message");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(plugin = %plugin_name, error = %e, "failed to decode plugin stdout line"),
                }
            }
            Ok(None) => {
                info!(plugin = %plugin_name, "plugin stdout closed, process likely exited");
                break;
            }
            Err(e) => {
                warn!(plugin = %plugin_name, error = %e, "error reading plugin stdout");
                break;
            }
        }
    }
}

async fn drain_stderr(plugin_name: String, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match serde_json::from_str::<StderrLogLine>(&line) {
            Ok(log) => match log.level.as_str() {
                "error" => tracing::error!(plugin = %plugin_name, "{}", log.message),
                "warn" => warn!(plugin = %plugin_name, "{}", log.message),
                _ => info!(plugin = %plugin_name, "{}", log.message),
            },
            Err(_) => info!(plugin = %plugin_name, "{}", line),
        }
    }
}
