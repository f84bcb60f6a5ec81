//! Shared integration-test harness: a `TestHub` wiring together an
//! in-memory Store, Moderation, and Hub without a network listener,
//! analogous to the teacher's `tests/common/{server,client}.rs`.

#![allow(dead_code)]

use std::sync::Arc;

use relaychat_hub::commands::Dispatcher;
use relaychat_hub::config::Config;
use relaychat_hub::hub::{Hub, HubHandle};
use relaychat_hub::moderation::ModerationState;
use relaychat_hub::plugins::PluginHost;
use relaychat_hub::store::Database;
use tokio::sync::broadcast;

pub struct TestHub {
    pub handle: HubHandle,
    pub dispatcher: Arc<Dispatcher>,
    pub config: Config,
    _shutdown_tx: broadcast::Sender<()>,
}

impl TestHub {
    pub async fn new() -> Self {
        let db = Database::new(":memory:").await.unwrap();
        let moderation = ModerationState::new(db.clone());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (hub, handle) = Hub::new(db.clone(), moderation, shutdown_rx);
        tokio::spawn(hub.run());

        let tmp_dir = std::env::temp_dir().join("relaychat-test-plugins");
        let plugins = PluginHost::new(tmp_dir, handle.plugin_inbound_tx.clone());
        let dispatcher = Arc::new(Dispatcher::new(db, handle.clone(), plugins));

        let config: Config = toml::from_str(
            r#"
            listen_addr = "127.0.0.1:0"
            admin_secret = "testsecret"
            admin_usernames = ["root"]
            "#,
        )
        .unwrap();

        Self {
            handle,
            dispatcher,
            config,
            _shutdown_tx: shutdown_tx,
        }
    }
}
