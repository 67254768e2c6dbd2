//! PyPI feed

use super::rss::parse_items;
use super::{fetch_body, FeedFormat, FeedItem, FeedSource};
use crate::error::Result;
use crate::types::Ecosystem;
use async_trait::async_trait;

const FEED_URL: &str = "https://pypi.org/rss/updates.xml";

/// PyPI's RSS feed of recent releases, titled `"<name> <version>"`
pub struct PypiFeed {
    http: reqwest::Client,
    feed_url: String,
}

impl PypiFeed {
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

pub(crate) fn parse_feed(xml: &str) -> Result<Vec<FeedItem>> {
    Ok(parse_items("pypi", xml)?
        .into_iter()
        .filter_map(|item| {
            let modified_at = item.published()?;
            let title = item.title.unwrap_or_default();
            let mut parts = title.split_whitespace();
            Some(FeedItem {
                name: parts.next().map(String::from),
                version: parts.next().map(String::from),
                modified_at,
                repository: item.link,
            })
        })
        .collect())
}

#[async_trait]
impl FeedSource for PypiFeed {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::PyPI
    }

    fn format(&self) -> FeedFormat {
        FeedFormat::Rss
    }

    async fn fetch(&self) -> Result<Vec<FeedItem>> {
        let body = fetch_body(&self.http, "pypi", &self.feed_url).await?;
        parse_feed(&String::from_utf8_lossy(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_split() {
        let xml = r#"<rss><channel>
            <item><title>requests 2.31.0</title><link>https://pypi.org/project/requests/2.31.0/</link>
                  <pubDate>Fri, 01 Mar 2024 11:58:00 GMT</pubDate></item>
            <item><title>lonely</title><pubDate>Fri, 01 Mar 2024 11:58:00 GMT</pubDate></item>
        </channel></rss>"#;
        let items = parse_feed(xml).unwrap();
        assert_eq!(items[0].name.as_deref(), Some("requests"));
        assert_eq!(items[0].version.as_deref(), Some("2.31.0"));
        assert!(items[0].repository.is_some());
        // Missing version is left for the poller to drop
        assert_eq!(items[1].name.as_deref(), Some("lonely"));
        assert!(items[1].version.is_none());
    }
}
