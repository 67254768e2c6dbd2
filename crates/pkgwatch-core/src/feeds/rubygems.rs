//! RubyGems feeds

use super::{fetch_body, parse_rfc3339, FeedFormat, FeedItem, FeedSource};
use crate::error::{FeedError, Result};
use crate::types::Ecosystem;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

const LATEST_URL: &str = "https://rubygems.org/api/v1/activity/latest.json";
const JUST_UPDATED_URL: &str = "https://rubygems.org/api/v1/activity/just_updated.json";

#[derive(Deserialize)]
struct Activity {
    name: Option<String>,
    version: Option<String>,
    version_created_at: Option<String>,
    source_code_uri: Option<String>,
}

/// RubyGems' "latest" and "just updated" activity logs, merged by gem name
pub struct RubyGemsFeed {
    http: reqwest::Client,
    urls: Vec<String>,
}

impl RubyGemsFeed {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            urls: vec![LATEST_URL.to_string(), JUST_UPDATED_URL.to_string()],
        }
    }

    /// Activity logs to read, in fetch order
    pub fn with_urls(mut self, urls: Vec<String>) -> Self {
        self.urls = urls;
        self
    }
}

pub(crate) fn parse_activity(body: &[u8]) -> Result<Vec<FeedItem>> {
    let entries: Vec<Activity> = serde_json::from_slice(body).map_err(|e| FeedError::Malformed {
        feed: "rubygems".to_string(),
        reason: e.to_string(),
    })?;
    Ok(entries
        .into_iter()
        .filter_map(|a| {
            let modified_at = a.version_created_at.as_deref().and_then(parse_rfc3339)?;
            Some(FeedItem {
                name: a.name,
                version: a.version,
                modified_at,
                repository: a.source_code_uri,
            })
        })
        .collect())
}

/// Merge feeds fetched in order, keeping one entry per gem name.
///
/// A name seen again in a later feed replaces the earlier entry in place.
/// Entries without a name are kept as-is.
pub fn merge_by_name(feeds: Vec<Vec<FeedItem>>) -> Vec<FeedItem> {
    let mut merged: Vec<FeedItem> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for item in feeds.into_iter().flatten() {
        match item.name.clone() {
            Some(name) => match index.get(&name) {
                Some(&pos) => merged[pos] = item,
                None => {
                    index.insert(name, merged.len());
                    merged.push(item);
                }
            },
            None => merged.push(item),
        }
    }
    merged
}

#[async_trait]
impl FeedSource for RubyGemsFeed {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::RubyGems
    }

    fn format(&self) -> FeedFormat {
        FeedFormat::JsonActivityLog
    }

    async fn fetch(&self) -> Result<Vec<FeedItem>> {
        let mut feeds = Vec::with_capacity(self.urls.len());
        for url in &self.urls {
            let body = fetch_body(&self.http, "rubygems", url).await?;
            feeds.push(parse_activity(&body)?);
        }
        Ok(merge_by_name(feeds))
    }
}
