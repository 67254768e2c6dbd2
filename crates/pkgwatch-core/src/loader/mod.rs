//! Batch loading of stored results into partitioned tables
//!
//! A load is a job: it is submitted to a [`JobRunner`], which owns its
//! lifecycle, and [`load_batch`] blocks until the job is terminal. Each load
//! replaces the target table with whatever the result store holds at that
//! moment; bad records are tolerated up to a budget.

mod schema;
mod warehouse;

pub use schema::{parse_timestamp, FieldMode, FieldSchema, FieldType, TableSchema, NULL_PARTITION};
pub use warehouse::LocalWarehouse;

use crate::error::{LoadError, Result};
use crate::store::ResultStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Objects picked up by a load
pub const SOURCE_SUFFIX: &str = ".json";

/// Why one input record was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    /// Object key the record came from
    pub object: String,
    /// Position of the record within the object
    pub index: usize,
    pub message: String,
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}: {}", self.object, self.index, self.message)
    }
}

/// One of the two analysis kinds with a table of its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisKind {
    Dynamic,
    Static,
}

impl AnalysisKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisKind::Dynamic => "dynamic",
            AnalysisKind::Static => "static",
        }
    }

    pub fn schema(&self) -> Result<TableSchema> {
        match self {
            AnalysisKind::Dynamic => TableSchema::dynamic_analysis(),
            AnalysisKind::Static => TableSchema::static_analysis(),
        }
    }
}

impl std::fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AnalysisKind {
    type Err = crate::error::PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "dynamic" => Ok(AnalysisKind::Dynamic),
            "static" => Ok(AnalysisKind::Static),
            _ => Err(crate::error::PipelineError::Config(format!(
                "unknown analysis kind: {}",
                s
            ))),
        }
    }
}

/// Everything a load job needs: where to read, what to expect, where to write
#[derive(Clone)]
pub struct LoadTarget {
    pub source: Arc<dyn ResultStore>,
    pub schema: TableSchema,
    pub table: String,
    pub partition_field: String,
    pub max_bad_records: usize,
}

impl LoadTarget {
    /// Target with an explicit table and partition field
    pub fn new(
        source: Arc<dyn ResultStore>,
        schema: TableSchema,
        table: impl Into<String>,
        partition_field: impl Into<String>,
        max_bad_records: usize,
    ) -> Result<Self> {
        let partition_field = partition_field.into();
        schema.partition_column(&partition_field)?;
        Ok(Self {
            source,
            schema,
            table: table.into(),
            partition_field,
            max_bad_records,
        })
    }

    /// Target using the table and partition field the kind's schema declares
    pub fn for_kind(
        kind: AnalysisKind,
        source: Arc<dyn ResultStore>,
        max_bad_records: usize,
    ) -> Result<Self> {
        let schema = kind.schema()?;
        let table = schema.table.clone();
        let partition_field = schema.partition_field.clone();
        Self::new(source, schema, table, partition_field, max_bad_records)
    }
}

impl std::fmt::Debug for LoadTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadTarget")
            .field("source", &self.source.location())
            .field("table", &self.table)
            .field("partition_field", &self.partition_field)
            .field("schema_version", &self.schema.version)
            .field("max_bad_records", &self.max_bad_records)
            .finish()
    }
}

/// Lifecycle of a load job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "PENDING"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Succeeded => write!(f, "SUCCEEDED"),
            JobState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Snapshot of a load job, as persisted in the job journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub table: String,
    pub source: String,
    pub schema_version: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub objects: usize,
    #[serde(default)]
    pub rows_loaded: usize,
    #[serde(default)]
    pub bad_records: usize,
    #[serde(default)]
    pub errors: Vec<RecordError>,
    /// Job-level failure reason
    #[serde(default)]
    pub failure: Option<String>,
    /// blake3 over every key and object read
    #[serde(default)]
    pub source_digest: Option<String>,
}

/// Runs load jobs. A job, once submitted, runs to completion or failure.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Start a job and return its identifier. The identifier is durable
    /// before this returns.
    async fn submit(&self, target: &LoadTarget) -> Result<String>;

    /// Block until the job is terminal
    async fn wait(&self, job_id: &str) -> Result<JobStatus>;

    /// Current state without waiting
    async fn status(&self, job_id: &str) -> Result<JobStatus>;

    fn name(&self) -> &str;
}

/// Load everything in `target.source` into `target.table`, replacing its
/// contents, and wait for the outcome.
///
/// Bad records under the budget are reported on the returned status. A
/// failed job surfaces as [`LoadError::JobFailed`] with every record error.
pub async fn load_batch(runner: &dyn JobRunner, target: &LoadTarget) -> Result<JobStatus> {
    let job_id = runner.submit(target).await?;
    info!(
        table = %target.table,
        source = %target.source.location(),
        runner = runner.name(),
        "Job created: {}",
        job_id
    );

    let status = runner.wait(&job_id).await?;
    match status.state {
        JobState::Succeeded => {
            if status.bad_records > 0 {
                warn!(
                    table = %status.table,
                    "Job {} skipped {} bad records (budget {})",
                    job_id,
                    status.bad_records,
                    target.max_bad_records
                );
            }
            info!(
                table = %status.table,
                "Job {} loaded {} rows from {} objects",
                job_id,
                status.rows_loaded,
                status.objects
            );
            Ok(status)
        }
        _ => Err(LoadError::JobFailed {
            reason: status
                .failure
                .clone()
                .unwrap_or_else(|| format!("job ended in state {}", status.state)),
            job_id,
            errors: status.errors,
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::store::MemoryResultStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(name: &str, created: i64) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "Package": {"Ecosystem": "npm", "Name": name, "Version": "1.0.0"},
            "CreatedTimestamp": created,
            "Analysis": {"Files": [{"Path": "/tmp/x", "Write": true}]}
        }))
        .unwrap()
    }

    fn bad_record(name: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "Package": {"Ecosystem": "npm", "Name": name},
            "CreatedTimestamp": 1
        }))
        .unwrap()
    }

    async fn store_with(name: &str, objects: Vec<(&str, Vec<u8>)>) -> Arc<MemoryResultStore> {
        let store = Arc::new(MemoryResultStore::new(name));
        for (key, data) in objects {
            store.put(key, data).await.unwrap();
        }
        store
    }

    #[test]
    fn test_target_from_kind() {
        let store = Arc::new(MemoryResultStore::new("kind-targets"));
        let dynamic = LoadTarget::for_kind(AnalysisKind::Dynamic, store.clone(), 5).unwrap();
        assert_eq!(dynamic.table, "analysis");
        assert_eq!(dynamic.partition_field, "CreatedTimestamp");

        let stat = LoadTarget::for_kind(AnalysisKind::Static, store.clone(), 5).unwrap();
        assert_eq!(stat.table, "static_analysis");
        assert_eq!(stat.partition_field, "Created");

        let schema = TableSchema::dynamic_analysis().unwrap();
        assert!(LoadTarget::new(store, schema, "t", "Analysis", 0).is_err());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("Static".parse::<AnalysisKind>().unwrap(), AnalysisKind::Static);
        assert!("both".parse::<AnalysisKind>().is_err());
    }

    #[tokio::test]
    async fn test_load_under_budget() {
        let dir = TempDir::new().unwrap();
        let warehouse = LocalWarehouse::open(dir.path()).unwrap();
        let store = store_with(
            "load-under-budget",
            vec![
                ("npm/a/1.0.0.json", record("a", 1709294400)),
                ("npm/b/1.0.0.json", record("b", 1709380800)),
                ("npm/c/1.0.0.json", bad_record("c")),
            ],
        )
        .await;
        let target = LoadTarget::for_kind(AnalysisKind::Dynamic, store, 1).unwrap();

        let status = load_batch(&warehouse, &target).await.unwrap();
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(status.rows_loaded, 2);
        assert_eq!(status.bad_records, 1);
        assert_eq!(status.errors[0].object, "npm/c/1.0.0.json");
        assert_eq!(warehouse.table_rows("analysis").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_load_over_budget_enumerates_errors() {
        let dir = TempDir::new().unwrap();
        let warehouse = LocalWarehouse::open(dir.path()).unwrap();
        let store = store_with(
            "load-over-budget",
            vec![
                ("npm/a/1.0.0.json", record("a", 1709294400)),
                ("npm/b/1.0.0.json", bad_record("b")),
                ("npm/c/1.0.0.json", b"{not json".to_vec()),
            ],
        )
        .await;
        let target = LoadTarget::for_kind(AnalysisKind::Dynamic, store, 1).unwrap();

        let err = load_batch(&warehouse, &target).await.unwrap_err();
        match err {
            PipelineError::Load(e @ LoadError::JobFailed { .. }) => {
                let objects: Vec<&str> = e.record_errors().iter().map(|r| r.object.as_str()).collect();
                assert_eq!(objects, vec!["npm/b/1.0.0.json", "npm/c/1.0.0.json"]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
