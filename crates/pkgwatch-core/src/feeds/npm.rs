//! npm registry feed

use super::rss::parse_items;
use super::{fetch_body, FeedFormat, FeedItem, FeedSource};
use crate::error::{FeedError, Result};
use crate::manager::parse_latest_version;
use crate::types::Ecosystem;
use async_trait::async_trait;
use tracing::debug;

const FEED_URL: &str = "https://registry.npmjs.org/-/rss";
const REGISTRY_URL: &str = "https://registry.npmjs.org";

/// npm's RSS feed of recent publishes.
///
/// Item titles carry only the package name, so each entry that survives the
/// time window gets its version from the registry's `latest` dist-tag.
pub struct NpmFeed {
    http: reqwest::Client,
    feed_url: String,
    registry_url: String,
}

impl NpmFeed {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            feed_url: FEED_URL.to_string(),
            registry_url: REGISTRY_URL.to_string(),
        }
    }

    /// Use other endpoints (mirrors, tests)
    pub fn with_urls(mut self, feed_url: impl Into<String>, registry_url: impl Into<String>) -> Self {
        self.feed_url = feed_url.into();
        self.registry_url = registry_url.into().trim_end_matches('/').to_string();
        self
    }
}

/// Turn npm RSS into feed items; the version is filled in later
pub(crate) fn parse_feed(xml: &str) -> Result<Vec<FeedItem>> {
    Ok(parse_items("npm", xml)?
        .into_iter()
        .filter_map(|item| {
            let modified_at = item.published()?;
            Some(FeedItem {
                name: item.title.map(|t| t.trim().to_string()),
                version: None,
                modified_at,
                repository: None,
            })
        })
        .collect())
}

#[async_trait]
impl FeedSource for NpmFeed {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Npm
    }

    fn format(&self) -> FeedFormat {
        FeedFormat::Rss
    }

    async fn fetch(&self) -> Result<Vec<FeedItem>> {
        let body = fetch_body(&self.http, "npm", &self.feed_url).await?;
        parse_feed(&String::from_utf8_lossy(&body))
    }

    async fn complete(&self, mut item: FeedItem) -> Result<FeedItem> {
        let Some(name) = item.name.as_deref().filter(|n| !n.is_empty()) else {
            return Ok(item);
        };
        let url = format!("{}/{}", self.registry_url, name);
        debug!("Looking up latest npm version for {}", name);

        let lookup = async {
            let body = fetch_body(&self.http, "npm", &url).await?;
            parse_latest_version(Ecosystem::Npm, name, &body)
        };
        let version = lookup.await.map_err(|e| FeedError::VersionLookup {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        item.version = Some(version);
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_feed() {
        let xml = r#"<rss version="2.0"><channel>
            <item><title>left-pad</title><pubDate>Fri, 01 Mar 2024 11:59:00 GMT</pubDate></item>
            <item><title>@scope/thing</title><pubDate>Fri, 01 Mar 2024 11:58:30 GMT</pubDate></item>
            <item><title>undated</title></item>
        </channel></rss>"#;
        let items = parse_feed(xml).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name.as_deref(), Some("left-pad"));
        assert_eq!(items[1].name.as_deref(), Some("@scope/thing"));
        assert!(items.iter().all(|i| i.version.is_none()));
    }

    #[tokio::test]
    async fn test_lookup_failure_is_an_error() {
        // Nothing listens on port 9 of localhost
        let feed = NpmFeed::new(reqwest::Client::new()).with_urls("http://127.0.0.1:9/-/rss", "http://127.0.0.1:9");
        let item = FeedItem {
            name: Some("left-pad".into()),
            version: None,
            modified_at: chrono::Utc::now(),
            repository: None,
        };
        assert!(feed.complete(item).await.is_err());
    }
}
