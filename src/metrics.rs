//! Prometheus metrics (§A.5): operational counters and gauges exposed
//! on `/metrics`, mirroring the teacher's `metrics.rs` shape with
//! chat-hub-specific names.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Counters

    pub static ref MESSAGES_BROADCAST: IntCounter = IntCounter::new(
        "relaychat_messages_broadcast_total",
        "Total chat messages fanned out to sessions"
    ).unwrap();

    pub static ref SESSIONS_ADMITTED: IntCounter = IntCounter::new(
        "relaychat_sessions_admitted_total",
        "Total sessions that completed admission"
    ).unwrap();

    pub static ref SESSIONS_EVICTED: IntCounter = IntCounter::new(
        "relaychat_sessions_evicted_total",
        "Total sessions evicted for backpressure or ping failure"
    ).unwrap();

    pub static ref SESSIONS_BANNED: IntCounter = IntCounter::new(
        "relaychat_sessions_banned_total",
        "Total ban/kick moderation actions"
    ).unwrap();

    pub static ref PLUGIN_MESSAGES_IN: IntCounter = IntCounter::new(
        "relaychat_plugin_messages_in_total",
        "Total messages received from plugins and reinjected into broadcast"
    ).unwrap();

    pub static ref PLUGIN_MESSAGES_OUT: IntCounter = IntCounter::new(
        "relaychat_plugin_messages_out_total",
        "Total messages sent to plugins"
    ).unwrap();

    // Gauges

    pub static ref CONNECTED_SESSIONS: IntGauge = IntGauge::new(
        "relaychat_connected_sessions",
        "Currently registered sessions"
    ).unwrap();

    pub static ref LOADED_PLUGINS: IntGauge = IntGauge::new(
        "relaychat_loaded_plugins",
        "Currently loaded plugin instances"
    ).unwrap();
}

/// Must be called once at startup before any metric is recorded.
pub fn init() {
    REGISTRY.register(Box::new(MESSAGES_BROADCAST.clone())).unwrap();
    REGISTRY.register(Box::new(SESSIONS_ADMITTED.clone())).unwrap();
    REGISTRY.register(Box::new(SESSIONS_EVICTED.clone())).unwrap();
    REGISTRY.register(Box::new(SESSIONS_BANNED.clone())).unwrap();
    REGISTRY.register(Box::new(PLUGIN_MESSAGES_IN.clone())).unwrap();
    REGISTRY.register(Box::new(PLUGIN_MESSAGES_OUT.clone())).unwrap();
    REGISTRY.register(Box::new(CONNECTED_SESSIONS.clone())).unwrap();
    REGISTRY.register(Box::new(LOADED_PLUGINS.clone())).unwrap();
}

/// Encodes the registry in Prometheus text format for the `/metrics`
/// HTTP handler.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
