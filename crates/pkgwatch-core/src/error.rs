//! Error types for the analysis pipeline

use crate::loader::RecordError;
use thiserror::Error;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Registry feed could not be read or understood
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    /// Batch load failed
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Timeout
    #[error("Operation timed out after {0}s")]
    Timeout(u64),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Message bus failure
    #[error("Message bus error: {0}")]
    Bus(String),

    /// Sandboxed execution failed
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Result store failure
    #[error("Result store error: {0}")]
    Store(String),

    /// Ecosystem has no package-manager support
    #[error("Unsupported ecosystem: {0}")]
    UnsupportedEcosystem(String),

    /// Identifier fields missing or empty
    #[error("Invalid package identifier: {0}")]
    InvalidIdentifier(String),

    /// Query rejected before reaching the index
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Regex error
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

/// Errors raised while reading a registry change feed
#[derive(Error, Debug)]
pub enum FeedError {
    /// Feed body is not well-formed XML
    #[error("XML error in {feed}: {message}")]
    Xml { feed: String, message: String },

    /// Feed body does not have the expected shape
    #[error("Malformed {feed} feed: {reason}")]
    Malformed { feed: String, reason: String },

    /// Registry answered with a non-success status
    #[error("{feed} feed returned HTTP {status}")]
    Status { feed: String, status: u16 },

    /// Version lookup for a feed entry failed
    #[error("Version lookup for {name} failed: {reason}")]
    VersionLookup { name: String, reason: String },
}

/// Errors raised by batch load jobs
#[derive(Error, Debug)]
pub enum LoadError {
    /// Schema file is unusable
    #[error("Schema error: {0}")]
    Schema(String),

    /// More malformed records than the job tolerates
    #[error("{bad_records} bad records exceed the budget of {budget}")]
    BudgetExceeded {
        bad_records: usize,
        budget: usize,
        errors: Vec<RecordError>,
    },

    /// Job reached a failed terminal state
    #[error("Job {job_id} failed: {reason}")]
    JobFailed {
        job_id: String,
        reason: String,
        errors: Vec<RecordError>,
    },

    /// No job with this identifier was ever submitted
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    /// Job was left unfinished by a process that no longer runs it
    #[error("Job {0} was interrupted before reaching a terminal state")]
    Orphaned(String),
}

impl LoadError {
    /// Per-record errors attached to this failure, if any
    pub fn record_errors(&self) -> &[RecordError] {
        match self {
            LoadError::BudgetExceeded { errors, .. } | LoadError::JobFailed { errors, .. } => errors,
            _ => &[],
        }
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        PipelineError::Network(e.to_string())
    }
}
