//! Minimal HTTP surface for the Prometheus `/metrics` endpoint,
//! mirroring the teacher's `http.rs`.

use axum::{routing::get, Router};
use tracing::info;

async fn metrics_handler() -> String {
    crate::metrics::gather()
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let addr = format!("0.0.0.0:{port}");
    info!(%addr, "metrics server listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await
}
