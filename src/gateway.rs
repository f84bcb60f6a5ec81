//! Gateway: binds the listening socket and spawns a Session per
//! accepted connection, mirroring the teacher's `network/gateway.rs`.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::commands::Dispatcher;
use crate::config::Config;
use crate::hub::HubHandle;
use crate::plugins::PluginHost;
use crate::session;

pub struct Gateway {
    listener: TcpListener,
    hub: HubHandle,
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    plugins: Arc<PluginHost>,
}

impl Gateway {
    pub async fn bind(
        config: Arc<Config>,
        hub: HubHandle,
        dispatcher: Arc<Dispatcher>,
        plugins: Arc<PluginHost>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        info!(addr = %config.listen_addr, "gateway listening");
        Ok(Self {
            listener,
            hub,
            config,
            dispatcher,
            plugins,
        })
    }

    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let hub = self.hub.clone();
                    let config = self.config.clone();
                    let dispatcher = self.dispatcher.clone();
                    let plugins = self.plugins.clone();
                    tokio::spawn(async move {
                        session::handle_connection(stream, addr, hub, config, dispatcher, plugins).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                }
            }
        }
    }
}
