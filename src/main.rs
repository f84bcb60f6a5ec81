//! relaychatd: binary entrypoint.
//!
//! Mirrors the teacher's `main.rs` boot sequence: load config, init
//! tracing, open the store, construct the Hub and its satellites,
//! spawn periodic background tasks, then run the Gateway until a
//! shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relaychat_hub::commands::Dispatcher;
use relaychat_hub::config::{Config, LogFormat};
use relaychat_hub::gateway::Gateway;
use relaychat_hub::hub::Hub;
use relaychat_hub::moderation::ModerationState;
use relaychat_hub::plugins::PluginHost;
use relaychat_hub::store::Database;
use relaychat_hub::{http, metrics};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "relaychat.toml".to_string());
    let config = Config::load(&config_path)?;
    init_tracing(config.log_format);

    if config.admin_secret.len() < 8 {
        anyhow::bail!("admin_secret must be at least 8 characters; refusing to start with a weak secret");
    }

    let config = Arc::new(config);
    info!(listen_addr = %config.listen_addr, "starting relaychatd");

    let store = Database::new(&config.database_path).await?;
    let moderation = ModerationState::new(store.clone());

    let (shutdown_tx, _) = broadcast::channel(1);

    let (hub, hub_handle) = Hub::new(store.clone(), moderation, shutdown_tx.subscribe());
    tokio::spawn(hub.run());

    let plugin_host = Arc::new(PluginHost::new(
        PathBuf::from(&config.plugin_dir),
        hub_handle.plugin_inbound_tx.clone(),
    ));

    let dispatcher = Arc::new(Dispatcher::new(store.clone(), hub_handle.clone(), (*plugin_host).clone()));

    metrics::init();
    if config.metrics_port != 0 {
        let port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = http::run_http_server(port).await {
                tracing::error!(error = %e, "metrics server exited");
            }
        });
    }

    let gateway = Gateway::bind(config.clone(), hub_handle.clone(), dispatcher, plugin_host).await?;
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = gateway.run() => {}
        _ = wait_for_shutdown_signal() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(());
            let _ = shutdown_rx.recv().await;
        }
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
