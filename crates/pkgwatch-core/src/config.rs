//! Process configuration
//!
//! Built once at startup from an optional TOML file overlaid with
//! environment variables, then handed to each component's constructor.

use crate::error::{PipelineError, Result};
use crate::store::BucketUrl;
use crate::types::Ecosystem;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variables read by [`PipelineConfig::from_env`]
pub mod env {
    pub const PROJECT: &str = "PKGWATCH_PROJECT";
    pub const JOB_TOPIC: &str = "PKGWATCH_JOB_TOPIC";
    pub const WORKER_SUBSCRIPTION: &str = "PKGWATCH_WORKER_SUBSCRIPTION";
    pub const NOTIFICATION_TOPIC: &str = "PKGWATCH_NOTIFICATION_TOPIC";
    pub const RESULTS_BUCKET: &str = "PKGWATCH_RESULTS_BUCKET";
    pub const STATIC_RESULTS_BUCKET: &str = "PKGWATCH_STATIC_RESULTS_BUCKET";
    pub const WAREHOUSE_DIR: &str = "PKGWATCH_WAREHOUSE_DIR";
    pub const INDEX_DIR: &str = "PKGWATCH_INDEX_DIR";
    pub const IMAGE_TAG: &str = "PKGWATCH_IMAGE_TAG";
    pub const PORT: &str = "PORT";
}

/// Configuration shared by every pipeline process
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Deployment/project identifier, used for log context only
    pub project: Option<String>,
    /// Topic URL jobs are published to (`file://...` or `mem://...`)
    pub job_topic: Option<String>,
    /// Subscription URL the worker receives from
    pub worker_subscription: Option<String>,
    /// Topic URL for completion notifications; none disables them
    pub notification_topic: Option<String>,
    /// Bucket URL for dynamic-analysis results
    pub results_bucket: Option<String>,
    /// Bucket URL for static-analysis results; none disables the static stage
    pub static_results_bucket: Option<String>,
    /// Directory holding warehouse tables and the job journal
    #[serde(default = "default_warehouse_dir")]
    pub warehouse_dir: PathBuf,
    /// Directory holding the indicator index
    #[serde(default = "default_index_dir")]
    pub index_dir: PathBuf,
    /// Query service listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Tag appended to every sandbox image reference
    #[serde(default = "default_image_tag")]
    pub image_tag: String,
    /// Per-ecosystem poll window overrides in seconds, keyed by ecosystem tag
    #[serde(default)]
    pub feed_windows: HashMap<String, u64>,
    /// Bad-record budget for batch loads
    #[serde(default = "default_max_bad_records")]
    pub max_bad_records: usize,
    /// Seconds before an unacknowledged message is redelivered
    #[serde(default = "default_ack_deadline")]
    pub ack_deadline_secs: u64,
    /// Upper bound on a single sandbox run
    #[serde(default = "default_sandbox_timeout")]
    pub sandbox_timeout_secs: u64,
}

/// Poll window used when no override is configured
pub const DEFAULT_FEED_WINDOW_SECS: u64 = 5 * 60;

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("pkgwatch")
}

fn default_warehouse_dir() -> PathBuf {
    data_dir().join("warehouse")
}

fn default_index_dir() -> PathBuf {
    data_dir().join("index")
}

fn default_port() -> u16 {
    8080
}

fn default_image_tag() -> String {
    "latest".to_string()
}

fn default_max_bad_records() -> usize {
    10_000
}

fn default_ack_deadline() -> u64 {
    600
}

fn default_sandbox_timeout() -> u64 {
    1800
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            project: None,
            job_topic: None,
            worker_subscription: None,
            notification_topic: None,
            results_bucket: None,
            static_results_bucket: None,
            warehouse_dir: default_warehouse_dir(),
            index_dir: default_index_dir(),
            port: default_port(),
            image_tag: default_image_tag(),
            feed_windows: HashMap::new(),
            max_bad_records: default_max_bad_records(),
            ack_deadline_secs: default_ack_deadline(),
            sandbox_timeout_secs: default_sandbox_timeout(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with the process environment
    pub fn from_env() -> Result<Self> {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    /// Parse a TOML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Optional file, then the environment on top
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        base.with_env(|key| std::env::var(key).ok())
    }

    /// Overlay values returned by `lookup`. Empty values count as unset.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(env::PROJECT) {
            self.project = Some(v);
        }
        if let Some(v) = get(env::JOB_TOPIC) {
            self.job_topic = Some(v);
        }
        if let Some(v) = get(env::WORKER_SUBSCRIPTION) {
            self.worker_subscription = Some(v);
        }
        if let Some(v) = get(env::NOTIFICATION_TOPIC) {
            self.notification_topic = Some(v);
        }
        if let Some(v) = get(env::RESULTS_BUCKET) {
            self.results_bucket = Some(v);
        }
        if let Some(v) = get(env::STATIC_RESULTS_BUCKET) {
            self.static_results_bucket = Some(v);
        }
        if let Some(v) = get(env::WAREHOUSE_DIR) {
            self.warehouse_dir = PathBuf::from(v);
        }
        if let Some(v) = get(env::INDEX_DIR) {
            self.index_dir = PathBuf::from(v);
        }
        if let Some(v) = get(env::IMAGE_TAG) {
            self.image_tag = v;
        }
        if let Some(v) = get(env::PORT) {
            self.port = v
                .trim()
                .parse()
                .map_err(|_| PipelineError::Config(format!("{} is not a port: {}", env::PORT, v)))?;
        }
        Ok(self)
    }

    pub fn require_job_topic(&self) -> Result<&str> {
        require(&self.job_topic, env::JOB_TOPIC)
    }

    pub fn require_worker_subscription(&self) -> Result<&str> {
        require(&self.worker_subscription, env::WORKER_SUBSCRIPTION)
    }

    /// Dynamic results bucket, parsed
    pub fn require_results_bucket(&self) -> Result<BucketUrl> {
        BucketUrl::parse(require(&self.results_bucket, env::RESULTS_BUCKET)?)
    }

    /// Static results bucket, parsed
    pub fn require_static_results_bucket(&self) -> Result<BucketUrl> {
        BucketUrl::parse(require(
            &self.static_results_bucket,
            env::STATIC_RESULTS_BUCKET,
        )?)
    }

    /// Static results bucket if one is configured
    pub fn static_results_bucket(&self) -> Result<Option<BucketUrl>> {
        self.static_results_bucket
            .as_deref()
            .map(BucketUrl::parse)
            .transpose()
    }

    /// Trailing window a poller accepts entries from
    pub fn feed_window(&self, ecosystem: Ecosystem) -> chrono::Duration {
        let secs = self
            .feed_windows
            .get(ecosystem.as_str())
            .copied()
            .unwrap_or(DEFAULT_FEED_WINDOW_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    /// Reject a poll cadence longer than the feed window; entries published
    /// between two cycles would fall outside both windows.
    pub fn check_poll_interval(&self, ecosystem: Ecosystem, interval: Duration) -> Result<()> {
        let window = self.feed_window(ecosystem);
        if interval.as_secs() > window.num_seconds().max(0) as u64 {
            return Err(PipelineError::Config(format!(
                "Poll interval of {}s exceeds the {} feed window of {}s",
                interval.as_secs(),
                ecosystem,
                window.num_seconds()
            )));
        }
        Ok(())
    }

    pub fn ack_deadline(&self) -> Duration {
        Duration::from_secs(self.ack_deadline_secs)
    }

    pub fn sandbox_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox_timeout_secs)
    }
}

fn require<'a>(value: &'a Option<String>, var: &str) -> Result<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| PipelineError::Config(format!("{} must be set", var)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_bad_records, 10_000);
        assert_eq!(config.feed_window(Ecosystem::Npm), chrono::Duration::minutes(5));
        assert!(config.require_job_topic().is_err());
    }

    #[test]
    fn test_env_overlay() {
        let config = PipelineConfig::default()
            .with_env(lookup(&[
                (env::JOB_TOPIC, "file:///tmp/bus/jobs"),
                (env::RESULTS_BUCKET, "file:///tmp/results"),
                (env::PORT, "9090"),
                (env::NOTIFICATION_TOPIC, ""),
            ]))
            .unwrap();

        assert_eq!(config.require_job_topic().unwrap(), "file:///tmp/bus/jobs");
        assert_eq!(config.port, 9090);
        assert!(config.notification_topic.is_none());
        assert!(config.require_results_bucket().is_ok());
    }

    #[test]
    fn test_bad_port_is_config_error() {
        let err = PipelineConfig::default()
            .with_env(lookup(&[(env::PORT, "http")]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_unparsable_bucket_fails() {
        let config = PipelineConfig::default()
            .with_env(lookup(&[(env::RESULTS_BUCKET, "s3://somewhere")]))
            .unwrap();
        assert!(matches!(
            config.require_results_bucket(),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_poll_interval_within_window() {
        let mut config = PipelineConfig::default();
        config.feed_windows.insert("pypi".into(), 60);

        assert!(config.check_poll_interval(Ecosystem::PyPI, Duration::from_secs(60)).is_ok());
        assert!(matches!(
            config.check_poll_interval(Ecosystem::PyPI, Duration::from_secs(61)),
            Err(PipelineError::Config(_))
        ));
        let default = Duration::from_secs(DEFAULT_FEED_WINDOW_SECS);
        assert!(config.check_poll_interval(Ecosystem::Npm, default).is_ok());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pkgwatch.toml");
        std::fs::write(
            &path,
            r#"
job_topic = "mem://jobs"
max_bad_records = 5

[feed_windows]
"crates.io" = 60
"#,
        )
        .unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.job_topic.as_deref(), Some("mem://jobs"));
        assert_eq!(config.max_bad_records, 5);
        assert_eq!(config.feed_window(Ecosystem::CratesIo), chrono::Duration::seconds(60));
        assert_eq!(config.feed_window(Ecosystem::PyPI), chrono::Duration::minutes(5));
    }
}
