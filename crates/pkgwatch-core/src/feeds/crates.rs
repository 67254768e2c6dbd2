//! crates.io feed

use super::{fetch_body, parse_rfc3339, FeedFormat, FeedItem, FeedSource};
use crate::error::{FeedError, Result};
use crate::types::Ecosystem;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

const FEED_URL: &str = "https://crates.io/api/v1/summary";

#[derive(Deserialize)]
struct Summary {
    #[serde(default)]
    just_updated: Vec<SummaryCrate>,
}

#[derive(Deserialize)]
struct SummaryCrate {
    name: Option<String>,
    updated_at: Option<String>,
    newest_version: Option<String>,
    repository: Option<String>,
}

/// The `just_updated` list of the crates.io summary endpoint
pub struct CratesFeed {
    http: reqwest::Client,
    feed_url: String,
}

impl CratesFeed {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            feed_url: FEED_URL.to_string(),
        }
    }

    pub fn with_url(mut self, feed_url: impl Into<String>) -> Self {
        self.feed_url = feed_url.into();
        self
    }
}

pub(crate) fn parse_feed(body: &[u8]) -> Result<Vec<FeedItem>> {
    let summary: Summary = serde_json::from_slice(body).map_err(|e| FeedError::Malformed {
        feed: "crates.io".to_string(),
        reason: e.to_string(),
    })?;

    Ok(summary
        .just_updated
        .into_iter()
        .filter_map(|c| {
            let Some(modified_at) = c.updated_at.as_deref().and_then(parse_rfc3339) else {
                debug!("Dropping crates.io entry {:?} without a usable timestamp", c.name);
                return None;
            };
            Some(FeedItem {
                name: c.name,
                version: c.newest_version,
                modified_at,
                repository: c.repository,
            })
        })
        .collect())
}

#[async_trait]
impl FeedSource for CratesFeed {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::CratesIo
    }

    fn format(&self) -> FeedFormat {
        FeedFormat::JsonSummary
    }

    async fn fetch(&self) -> Result<Vec<FeedItem>> {
        let body = fetch_body(&self.http, "crates.io", &self.feed_url).await?;
        parse_feed(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_just_updated() {
        let body = br#"{
            "num_downloads": 1,
            "new_crates": [],
            "just_updated": [
                {"id": "serde", "name": "serde", "updated_at": "2024-03-01T11:58:12.345678+00:00",
                 "newest_version": "1.0.197", "repository": "https://github.com/serde-rs/serde"},
                {"id": "norepo", "name": "norepo", "updated_at": "2024-03-01T11:57:00Z",
                 "newest_version": "0.1.0", "repository": null},
                {"id": "broken", "name": "broken", "updated_at": "yesterday", "newest_version": "1.0.0"}
            ]
        }"#;
        let items = parse_feed(body).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name.as_deref(), Some("serde"));
        assert_eq!(items[0].version.as_deref(), Some("1.0.197"));
        assert!(items[1].repository.is_none());
    }

    #[test]
    fn test_not_json() {
        assert!(parse_feed(b"<html>rate limited</html>").is_err());
    }
}
