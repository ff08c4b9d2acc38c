//! Proxy Watch - Proxy Pool Health Dashboard
//!
//! Tracks the health of a pool of HTTP/SOCKS proxies: stores proxy
//! records, probes them, and orchestrates large parallel check runs with
//! durable, pollable progress and cooperative cancellation.

pub mod orchestrator;
pub mod proxy;
pub mod store;
pub mod tui;

pub use proxy::*;

/// Application result type
pub type Result<T> = anyhow::Result<T>;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database file path
    pub database_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "proxywatch.db".to_string(),
        }
    }
}
