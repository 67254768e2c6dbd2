//! Package analysis pipeline core library
//!
//! Watches package registries for new releases, queues each release for
//! sandboxed analysis, stores the results, loads them into partitioned
//! tables and serves indicator searches over them.

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod bus;
pub mod config;
pub mod error;
pub mod feeds;
pub mod index;
pub mod loader;
pub mod manager;
pub mod notification;
pub mod obfuscation;
pub mod query;
pub mod sandbox;
pub mod static_scan;
pub mod store;
pub mod types;
pub mod worker;

pub use config::PipelineConfig;
pub use error::{FeedError, LoadError, PipelineError, Result};
pub use types::*;

use std::time::Duration;

/// HTTP client shared by feeds and registry lookups
pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(format!("pkgwatch/{}", VERSION))
        .timeout(timeout)
        .build()?;
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_client_creation() {
        assert!(http_client(feeds::FEED_TIMEOUT).is_ok());
    }
}
