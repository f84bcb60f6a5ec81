//! relaychat-hub: the Hub, Plugin Host, and Message Store contract
//! underlying `relaychatd`. Exposed as a library so integration tests
//! can wire up a Hub without a real network listener.

pub mod admission;
pub mod commands;
pub mod config;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod http;
pub mod message;
pub mod metrics;
pub mod moderation;
pub mod plugins;
pub mod replay;
pub mod session;
pub mod store;
