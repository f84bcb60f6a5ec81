//! Session (§4.3): one accepted connection's two cooperating pumps,
//! its bounded output queue, and the read-side dispatch into Admission,
//! Replay, and the Command Dispatcher.
//!
//! Grounded in the teacher's `network/connection.rs` "Unified
//! Zero-Copy Loop": a handshake phase followed by a single
//! `tokio::select!` between inbound frames and the outgoing queue.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{info, instrument, warn};

use crate::admission::{self, Admitted};
use crate::commands::{CommandContext, Dispatcher};
use crate::config::Config;
use crate::error::SessionError;
use crate::hub::{HubHandle, OutgoingFrame};
use crate::message::{ControlFrame, Handshake, Message as ChatMessage, MessageType};
use crate::metrics;
use crate::plugins::PluginHost;
use crate::replay;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

const OUTPUT_QUEUE_CAPACITY: usize = 256;

pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: HubHandle,
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    plugins: Arc<PluginHost>,
) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(s) => s,
        Err(e) => {
            warn!(%addr, error = %e, "websocket handshake failed");
            return;
        }
    };
    run_session(ws_stream, addr, hub, config, dispatcher, plugins).await;
}

#[instrument(skip_all, fields(%addr))]
async fn run_session(
    mut ws: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    hub: HubHandle,
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    plugins: Arc<PluginHost>,
) {
    let max_frame_bytes = config.max_file_bytes + 512;

    let registration_timeout = Duration::from_secs(config.idle_timeouts.registration_timeout_secs);
    let handshake = match tokio::time::timeout(registration_timeout, read_json_frame::<Handshake>(&mut ws, max_frame_bytes)).await {
        Ok(Ok(Some(h))) => h,
        Ok(Ok(None)) => return,
        Ok(Err(_)) => {
            let _ = close_with_reason(&mut ws, "Malformed handshake").await;
            return;
        }
        Err(_) => {
            let _ = close_with_reason(&mut ws, "Handshake timed out").await;
            return;
        }
    };

    // Existing names snapshot: queried from the Hub's single-writer
    // actor. The check is inherently racy with a concurrent admission
    // of the same name arriving between this query and registration;
    // resolved in practice by the Hub's single-task registration
    // serializing the actual insert (§4.5 doc comment on `admit`).
    let existing_names: Vec<String> = hub.usernames().await;

    let admitted: Admitted = match admission::admit(&handshake, &config, &hub, &existing_names).await {
        Ok(a) => a,
        Err(e) => {
            let _ = close_with_reason(&mut ws, &e.to_string()).await;
            return;
        }
    };

    metrics::SESSIONS_ADMITTED.inc();
    let session_id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
    info!(session_id, username = %admitted.username, is_admin = admitted.is_admin, "session admitted");

    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<OutgoingFrame>(OUTPUT_QUEUE_CAPACITY);
    // The Hub holds `close_tx` for as long as this Session stays
    // registered; dropping its entry (unregister, eviction, ban/kick,
    // force-disconnect) resolves `close_rx` below without an explicit
    // message (§5 Cancellation).
    let (close_tx, mut close_rx) = oneshot::channel::<()>();
    hub.register(
        session_id,
        admitted.username.clone(),
        admitted.is_admin,
        outgoing_tx.clone(),
        close_tx,
    )
    .await;

    // Replay runs synchronously before any live broadcast is observed
    // (§4.7).
    match replay::replay_for(&hub.store, &config, &admitted.username).await {
        Ok(messages) => {
            for stored in messages {
                if send_frame(&mut ws, &OutgoingFrame::Message(stored.into_message())).await.is_err() {
                    hub.unregister(session_id).await;
                    return;
                }
            }
        }
        Err(e) => warn!(error = %e, "replay failed, continuing without history"),
    }

    let dispatcher_ctx_username = admitted.username.clone();
    let is_admin = admitted.is_admin;
    let mut ping_interval = tokio::time::interval(Duration::from_secs(config.idle_timeouts.ping_interval_secs));
    let read_timeout = Duration::from_secs(config.idle_timeouts.timeout_secs);
    let mut deadline = tokio::time::Instant::now() + read_timeout;

    loop {
        tokio::select! {
            frame = ws.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        deadline = tokio::time::Instant::now() + read_timeout;
                        if text.len() > max_frame_bytes {
                            warn!(session_id, "frame exceeds max_file_bytes, dropping connection");
                            break;
                        }
                        handle_incoming(
                            &text,
                            &dispatcher_ctx_username,
                            is_admin,
                            &admitted.username,
                            &hub,
                            &dispatcher,
                            &plugins,
                            &outgoing_tx,
                        )
                        .await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Pong and other control frames reset the pong
                        // watchdog without being dispatched as chat.
                        deadline = tokio::time::Instant::now() + read_timeout;
                    }
                    Some(Err(e)) => {
                        warn!(session_id, error = %e, "read error, unregistering");
                        break;
                    }
                }
            }
            outgoing = outgoing_rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        if send_frame(&mut ws, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping_interval.tick() => {
                if send_frame(&mut ws, &OutgoingFrame::Control(ControlFrame::ping())).await.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!(session_id, "pong watchdog expired, closing idle connection");
                break;
            }
            _ = &mut close_rx => {
                info!(session_id, "session closed by hub (evicted, banned, or force-disconnected)");
                break;
            }
        }
    }

    hub.unregister(session_id).await;
    let _ = ws.close(None).await;
    info!(session_id, "session closed");
}

async fn handle_incoming(
    text: &str,
    username: &str,
    is_admin: bool,
    sender_identity: &str,
    hub: &HubHandle,
    dispatcher: &Dispatcher,
    plugins: &PluginHost,
    outgoing_tx: &mpsc::Sender<OutgoingFrame>,
) {
    if text.starts_with(':') || dispatcher.has_pending(username).await {
        let ctx = CommandContext { username, is_admin };
        match dispatcher.dispatch(&ctx, text).await {
            Ok(Some(reply)) => {
                let _ = outgoing_tx
                    .try_send(OutgoingFrame::Control(ControlFrame::system(reply)));
            }
            Ok(None) => {}
            Err(e) => {
                let _ = outgoing_tx.try_send(OutgoingFrame::Control(ControlFrame::system(e.to_string())));
            }
        }
        return;
    }

    let incoming: Result<ChatMessage, _> = serde_json::from_str(text);
    match incoming {
        Ok(mut msg) => {
            msg.sender = sender_identity.to_string();
            msg.created_at = chrono::Utc::now();
            let stored_id = if msg.is_encrypted {
                hub.store
                    .messages()
                    .insert_encrypted(
                        sender_identity,
                        msg.recipient.as_deref().unwrap_or_default(),
                        msg.encrypted_data.as_deref().unwrap_or_default(),
                        msg.nonce.as_deref().unwrap_or_default(),
                    )
                    .await
            } else {
                hub.store
                    .messages()
                    .insert(sender_identity, &msg.content, msg.file.as_ref())
                    .await
            };
            match stored_id {
                Ok(id) => {
                    msg.id = Some(id);
                    msg.message_id = Some(id);
                    hub.broadcast(OutgoingFrame::Message(msg.clone())).await;
                    if msg.kind == MessageType::Text && !msg.is_encrypted {
                        plugins.send_message(sender_identity, &msg.content).await;
                    }
                }
                Err(e) => warn!(error = %e, "failed to persist message"),
            }
        }
        Err(_) => {
            warn!(username, "dropped malformed frame");
        }
    }
}

async fn read_json_frame<T: serde::de::DeserializeOwned>(
    ws: &mut WebSocketStream<TcpStream>,
    max_bytes: usize,
) -> Result<Option<T>, SessionError> {
    match ws.next().await {
        Some(Ok(WsMessage::Text(text))) => {
            if text.len() > max_bytes {
                return Err(SessionError::FrameTooLarge(text.len(), max_bytes));
            }
            serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| SessionError::Malformed(e.to_string()))
        }
        Some(Ok(WsMessage::Close(_))) | None => Ok(None),
        Some(Ok(_)) => Err(SessionError::Malformed("expected a text frame".to_string())),
        Some(Err(e)) => Err(SessionError::Read(e.to_string())),
    }
}

async fn send_frame(ws: &mut WebSocketStream<TcpStream>, frame: &OutgoingFrame) -> Result<(), SessionError> {
    let json = match frame {
        OutgoingFrame::Message(m) => serde_json::to_string(m).expect("Message is always serializable"),
        OutgoingFrame::Control(c) => serde_json::to_string(c).expect("ControlFrame is always serializable"),
    };
    ws.send(WsMessage::Text(json))
        .await
        .map_err(|e| SessionError::Write(e.to_string()))
}

async fn close_with_reason(ws: &mut WebSocketStream<TcpStream>, reason: &str) -> Result<(), SessionError> {
    let frame = ControlFrame::auth_failed(reason);
    let _ = send_frame(ws, &OutgoingFrame::Control(frame)).await;
    ws.close(None).await.map_err(|e| SessionError::Write(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_frame_bytes_includes_the_512_byte_margin() {
        let config = Config {
            max_file_bytes: 1000,
            listen_addr: String::new(),
            admin_secret: String::new(),
            admin_usernames: vec![],
            database_path: ":memory:".to_string(),
            allowlist: vec![],
            tls: None,
            ban_gap_redaction: true,
            plugin_registry_url: None,
            e2e_passphrase: None,
            plugin_dir: "plugins".to_string(),
            log_format: Default::default(),
            metrics_port: 0,
            idle_timeouts: Default::default(),
        };
        assert_eq!(config.max_file_bytes + 512, 1512);
    }
}
