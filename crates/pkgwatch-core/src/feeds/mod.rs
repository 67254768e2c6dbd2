//! Registry change feeds and the poller that turns them into analysis jobs
//!
//! Every registry exposes "what changed recently" differently: npm and PyPI
//! publish RSS, RubyGems two JSON activity logs, crates.io a JSON summary.
//! Each format lives behind [`FeedSource`]; the windowing, dedup and publish
//! logic is shared by [`Poller`].

mod crates;
mod npm;
mod pypi;
mod rss;
mod rubygems;

pub use crates::CratesFeed;
pub use npm::NpmFeed;
pub use pypi::PypiFeed;
pub use rubygems::{merge_by_name, RubyGemsFeed};

use crate::bus::MessageBus;
use crate::error::{FeedError, PipelineError, Result};
use crate::notification::identifier_metadata;
use crate::types::{Ecosystem, PackageIdentifier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Client timeout for feed and registry requests
pub const FEED_TIMEOUT: Duration = Duration::from_secs(10);

/// Wire format of a registry's change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    JsonSummary,
    Rss,
    JsonActivityLog,
}

impl std::fmt::Display for FeedFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedFormat::JsonSummary => write!(f, "JSON summary"),
            FeedFormat::Rss => write!(f, "RSS"),
            FeedFormat::JsonActivityLog => write!(f, "JSON activity log"),
        }
    }
}

/// One entry from a change feed, before validation
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub name: Option<String>,
    pub version: Option<String>,
    pub modified_at: DateTime<Utc>,
    pub repository: Option<String>,
}

/// A registry change feed
#[async_trait]
pub trait FeedSource: Send + Sync {
    fn ecosystem(&self) -> Ecosystem;

    fn format(&self) -> FeedFormat;

    /// Fetch and parse the feed. Entries with unreadable timestamps are
    /// already dropped; multi-feed sources return their merged view.
    async fn fetch(&self) -> Result<Vec<FeedItem>>;

    /// Fill in anything the feed itself lacks for an entry that survived
    /// the time window. An error aborts the cycle.
    async fn complete(&self, item: FeedItem) -> Result<FeedItem> {
        Ok(item)
    }
}

/// Change feed for `ecosystem`
pub fn source_for(ecosystem: Ecosystem, http: reqwest::Client) -> Result<Arc<dyn FeedSource>> {
    match ecosystem {
        Ecosystem::Npm => Ok(Arc::new(NpmFeed::new(http))),
        Ecosystem::PyPI => Ok(Arc::new(PypiFeed::new(http))),
        Ecosystem::RubyGems => Ok(Arc::new(RubyGemsFeed::new(http))),
        Ecosystem::CratesIo => Ok(Arc::new(CratesFeed::new(http))),
        Ecosystem::Packagist => Err(PipelineError::UnsupportedEcosystem(format!(
            "{} has no change feed",
            ecosystem
        ))),
    }
}

/// GET `url` and return the body, treating non-2xx as a feed error
pub(crate) async fn fetch_body(http: &reqwest::Client, feed: &str, url: &str) -> Result<Vec<u8>> {
    debug!("Fetching {} feed from {}", feed, url);
    let response = http.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FeedError::Status {
            feed: feed.to_string(),
            status: status.as_u16(),
        }
        .into());
    }
    Ok(response.bytes().await?.to_vec())
}

/// Parse an RFC 3339 timestamp as found in JSON feeds
pub(crate) fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Polls one change feed and publishes a job per recently changed package
pub struct Poller {
    source: Arc<dyn FeedSource>,
    bus: Arc<dyn MessageBus>,
    topic: String,
    window: chrono::Duration,
}

impl Poller {
    pub fn new(
        source: Arc<dyn FeedSource>,
        bus: Arc<dyn MessageBus>,
        topic: impl Into<String>,
        window: chrono::Duration,
    ) -> Self {
        Self {
            source,
            bus,
            topic: topic.into(),
            window,
        }
    }

    pub fn ecosystem(&self) -> Ecosystem {
        self.source.ecosystem()
    }

    /// Run one cycle against the current time
    pub async fn poll(&self) -> Result<usize> {
        self.poll_at(Utc::now()).await
    }

    /// Run one cycle, treating `now` as the current time.
    ///
    /// Entries older than `now - window` are skipped. Each distinct
    /// identifier is published once. Any fetch, lookup or publish failure
    /// aborts the cycle.
    pub async fn poll_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let ecosystem = self.source.ecosystem();
        let cutoff = now - self.window;
        let items = self.source.fetch().await?;
        debug!(
            "Fetched {} {} entries from {}",
            items.len(),
            self.source.format(),
            ecosystem
        );

        let mut seen = HashSet::new();
        let mut published = 0;

        for item in items {
            if item.modified_at < cutoff {
                continue;
            }
            let item = self.source.complete(item).await?;

            let (Some(name), Some(version)) = (item.name, item.version) else {
                warn!(ecosystem = %ecosystem, "Skipping feed entry without name or version");
                continue;
            };
            let id = match PackageIdentifier::new(ecosystem, name, version) {
                Ok(id) => id,
                Err(e) => {
                    warn!(ecosystem = %ecosystem, "Skipping feed entry: {}", e);
                    continue;
                }
            };
            if !seen.insert(id.clone()) {
                continue;
            }

            let body = serde_json::to_vec(&id.job_body())?;
            self.bus
                .publish(&self.topic, body, identifier_metadata(&id))
                .await?;
            debug!(ecosystem = %ecosystem, name = %id.name(), version = %id.version(), "Published job");
            published += 1;
        }

        info!(ecosystem = %ecosystem, "Poll complete: {} jobs published", published);
        Ok(published)
    }
}
