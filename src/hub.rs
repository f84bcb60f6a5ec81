//! The Hub (§4.4): single-task actor serializing register, unregister,
//! and broadcast; owns the Sessions map exclusively.
//!
//! Grounded in the teacher's `state/matrix.rs` manager-delegation
//! container and `main.rs`'s background-task fan-out (the router-task
//! draining a receiver into per-peer sends, the periodic reaper
//! spawns, and the SIGINT/SIGTERM-driven shutdown broadcast).

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, instrument, warn};

use crate::message::{ControlFrame, Message};
use crate::metrics;
use crate::moderation::ModerationState;
use crate::store::Database;

/// What the Hub's broadcast loop sends down every Session's queue.
#[derive(Debug, Clone)]
pub enum OutgoingFrame {
    Message(Message),
    Control(ControlFrame),
}

struct RegisteredSession {
    username: String,
    is_admin: bool,
    tx: mpsc::Sender<OutgoingFrame>,
    /// Dropped (never sent) when this entry leaves the Sessions map, so
    /// that drop is the close signal the Session's `select!` loop waits
    /// on (§5 Cancellation: "close output queue -> close transport").
    #[allow(dead_code)]
    close: oneshot::Sender<()>,
}

enum HubCommand {
    Register {
        username: String,
        is_admin: bool,
        tx: mpsc::Sender<OutgoingFrame>,
        session_id: u64,
        close_tx: oneshot::Sender<()>,
    },
    Unregister {
        session_id: u64,
    },
    Broadcast(OutgoingFrame),
    ForceDisconnect {
        username: String,
    },
    ListUsernames {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Cloneable, non-owning handle to the Hub (§3 Ownership: "Sessions
/// reference the Hub by weak handle").
#[derive(Clone)]
pub struct HubHandle {
    cmd_tx: mpsc::Sender<HubCommand>,
    pub moderation: ModerationState,
    pub store: Database,
    pub plugin_inbound_tx: mpsc::Sender<OutgoingFrame>,
}

impl HubHandle {
    /// `close_tx` is held by the Hub for as long as this Session stays
    /// registered; the Session's other half (`close_rx`) resolves the
    /// moment the Hub drops its entry, which is how eviction, ban/kick,
    /// and `:forcedisconnect` actually close the transport rather than
    /// merely removing the bookkeeping entry.
    pub async fn register(
        &self,
        session_id: u64,
        username: String,
        is_admin: bool,
        tx: mpsc::Sender<OutgoingFrame>,
        close_tx: oneshot::Sender<()>,
    ) {
        let _ = self
            .cmd_tx
            .send(HubCommand::Register {
                username,
                is_admin,
                tx,
                session_id,
                close_tx,
            })
            .await;
    }

    pub async fn unregister(&self, session_id: u64) {
        let _ = self.cmd_tx.send(HubCommand::Unregister { session_id }).await;
    }

    pub async fn broadcast(&self, frame: OutgoingFrame) {
        let _ = self.cmd_tx.send(HubCommand::Broadcast(frame)).await;
    }

    pub async fn force_disconnect(&self, username: String) {
        let _ = self.cmd_tx.send(HubCommand::ForceDisconnect { username }).await;
    }

    /// Snapshot of currently-registered usernames, used by Admission's
    /// duplicate-name check (§4.5 step 4). Queried through the Hub's
    /// single-writer actor rather than a shared map, so the snapshot is
    /// always consistent with the actor's own view.
    pub async fn usernames(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(HubCommand::ListUsernames { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

pub struct Hub {
    sessions: HashMap<u64, RegisteredSession>,
    cmd_rx: mpsc::Receiver<HubCommand>,
    plugin_inbound_rx: mpsc::Receiver<OutgoingFrame>,
    shutdown_rx: broadcast::Receiver<()>,
    moderation: ModerationState,
}

impl Hub {
    pub fn new(
        store: Database,
        moderation: ModerationState,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> (Self, HubHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        let (plugin_inbound_tx, plugin_inbound_rx) = mpsc::channel(100);
        let handle = HubHandle {
            cmd_tx,
            moderation: moderation.clone(),
            store,
            plugin_inbound_tx,
        };
        let hub = Self {
            sessions: HashMap::new(),
            cmd_rx,
            plugin_inbound_rx,
            shutdown_rx,
            moderation,
        };
        (hub, handle)
    }

    /// Runs the single-task event loop until shutdown is signaled.
    /// Mirrors `main.rs`'s pattern of one task owning the router
    /// channel plus several `tokio::select!` branches for periodic
    /// work.
    #[instrument(skip_all, name = "hub")]
    pub async fn run(mut self) {
        let mut ban_reaper = tokio::time::interval(Duration::from_secs(3600));
        let mut stale_reaper = tokio::time::interval(Duration::from_secs(300));

        loop {
            tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => self.handle_command(cmd).await,
                Some(frame) = self.plugin_inbound_rx.recv() => {
                    metrics::PLUGIN_MESSAGES_IN.inc();
                    self.broadcast_frame(frame).await;
                }
                _ = ban_reaper.tick() => {
                    let reaped = self.moderation.reap_expired();
                    if reaped > 0 {
                        info!(reaped, "ban reaper pruned expired temp kicks");
                    }
                }
                _ = stale_reaper.tick() => {
                    self.ping_all().await;
                }
                _ = self.shutdown_rx.recv() => {
                    info!("hub shutting down");
                    break;
                }
                else => break,
            }
        }
    }

    async fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register {
                username,
                is_admin,
                tx,
                session_id,
                close_tx,
            } => {
                self.sessions.insert(
                    session_id,
                    RegisteredSession {
                        username,
                        is_admin,
                        tx,
                        close: close_tx,
                    },
                );
                metrics::CONNECTED_SESSIONS.set(self.sessions.len() as i64);
                self.broadcast_userlist().await;
            }
            HubCommand::Unregister { session_id } => {
                if self.sessions.remove(&session_id).is_some() {
                    metrics::CONNECTED_SESSIONS.set(self.sessions.len() as i64);
                    self.broadcast_userlist().await;
                }
            }
            HubCommand::Broadcast(frame) => self.broadcast_frame(frame).await,
            HubCommand::ForceDisconnect { username } => {
                let target: Vec<u64> = self
                    .sessions
                    .iter()
                    .filter(|(_, s)| s.username.eq_ignore_ascii_case(&username))
                    .map(|(id, _)| *id)
                    .collect();
                for id in target {
                    self.sessions.remove(&id);
                }
                metrics::CONNECTED_SESSIONS.set(self.sessions.len() as i64);
                self.broadcast_userlist().await;
            }
            HubCommand::ListUsernames { reply } => {
                let names = self.sessions.values().map(|s| s.username.clone()).collect();
                let _ = reply.send(names);
            }
        }
    }

    /// Non-blocking send to every Session; a full queue evicts that
    /// Session (§4.4 per-iteration contract, §4.3 backpressure policy).
    async fn broadcast_frame(&mut self, frame: OutgoingFrame) {
        if let OutgoingFrame::Message(_) = &frame {
            metrics::MESSAGES_BROADCAST.inc();
        }
        let mut evicted = Vec::new();
        for (id, session) in self.sessions.iter() {
            if session.tx.try_send(frame.clone()).is_err() {
                evicted.push(*id);
            }
        }
        if !evicted.is_empty() {
            for id in &evicted {
                self.sessions.remove(id);
                metrics::SESSIONS_EVICTED.inc();
                warn!(session_id = id, "evicted session: output queue full or closed");
            }
            metrics::CONNECTED_SESSIONS.set(self.sessions.len() as i64);
            self.broadcast_userlist().await;
        }
    }

    async fn ping_all(&mut self) {
        self.broadcast_frame(OutgoingFrame::Control(ControlFrame::ping())).await;
    }

    async fn broadcast_userlist(&mut self) {
        let mut names: Vec<String> = self.sessions.values().map(|s| s.username.clone()).collect();
        names.sort();
        let mut evicted = Vec::new();
        for (id, session) in self.sessions.iter() {
            if session
                .tx
                .try_send(OutgoingFrame::Control(ControlFrame::userlist(names.clone())))
                .is_err()
            {
                evicted.push(*id);
            }
        }
        for id in evicted {
            self.sessions.remove(&id);
            metrics::SESSIONS_EVICTED.inc();
        }
    }

    #[allow(dead_code)]
    fn admin_sessions(&self) -> impl Iterator<Item = &RegisteredSession> {
        self.sessions.values().filter(|s| s.is_admin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_unregister_is_idempotent() {
        let db = Database::new(":memory:").await.unwrap();
        let moderation = ModerationState::new(db.clone());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (hub, handle) = Hub::new(db, moderation, shutdown_rx);
        let join = tokio::spawn(hub.run());

        let (tx, mut rx) = mpsc::channel(256);
        let (close_tx, mut close_rx) = oneshot::channel();
        handle.register(1, "alice".to_string(), false, tx, close_tx).await;
        // drain the userlist control frame sent on register
        let _ = rx.recv().await;

        handle.unregister(1).await;
        handle.unregister(1).await; // idempotent, no panic
        // unregister drops the stored close_tx without sending, which is
        // the close signal the Session's select! loop waits on.
        assert!(matches!(close_rx.try_recv(), Err(oneshot::error::TryRecvError::Closed)));

        let _ = shutdown_tx.send(());
        join.await.unwrap();
    }
}
