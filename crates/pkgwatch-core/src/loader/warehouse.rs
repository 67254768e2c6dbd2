//! Directory-backed warehouse
//!
//! Layout under the root:
//!
//! ```text
//! jobs/<job-id>.json              job journal, one file per job
//! tables/<table>/<YYYYMMDD>.jsonl live partitions
//! tables/.staging-<job-id>/       partitions of a running load
//! ```
//!
//! A load stages every partition before touching the live table, so a job
//! that fails (including one that blows its bad-record budget) leaves the
//! previous contents in place.

use super::{JobRunner, JobState, JobStatus, LoadTarget, RecordError, SOURCE_SUFFIX};
use crate::error::{LoadError, PipelineError, Result};
use crate::store::write_atomic;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, warn};
use uuid::Uuid;

const JOBS_DIR: &str = "jobs";
const TABLES_DIR: &str = "tables";
const PARTITION_EXT: &str = "jsonl";

/// Job runner that loads into NDJSON partitions on the local filesystem
pub struct LocalWarehouse {
    root: PathBuf,
    jobs: DashMap<String, watch::Receiver<JobStatus>>,
    swap_lock: Arc<Mutex<()>>,
}

impl LocalWarehouse {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(JOBS_DIR))?;
        std::fs::create_dir_all(root.join(TABLES_DIR))?;
        Ok(Self {
            root,
            jobs: DashMap::new(),
            swap_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Partition names of a live table, in order
    pub fn partitions(&self, table: &str) -> Result<Vec<String>> {
        validate_table(table)?;
        let dir = self.root.join(TABLES_DIR).join(table);
        if !dir.is_dir() {
            return Err(PipelineError::NotFound(format!("table {}", table)));
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PARTITION_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Every row of a live table, partition by partition
    pub fn table_rows(&self, table: &str) -> Result<Vec<Value>> {
        let dir = self.root.join(TABLES_DIR).join(table);
        let mut rows = Vec::new();
        for partition in self.partitions(table)? {
            let data = std::fs::read(dir.join(format!("{}.{}", partition, PARTITION_EXT)))?;
            for row in serde_json::Deserializer::from_slice(&data).into_iter::<Value>() {
                rows.push(row?);
            }
        }
        Ok(rows)
    }

    fn read_journal(&self, job_id: &str) -> Result<JobStatus> {
        let path = journal_path(&self.root, job_id)?;
        match std::fs::read(&path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(LoadError::UnknownJob(job_id.to_string()).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Journal entry for a job this process is not running
    fn settled(&self, job_id: &str) -> Result<JobStatus> {
        let status = self.read_journal(job_id)?;
        if status.state.is_terminal() {
            Ok(status)
        } else {
            Err(LoadError::Orphaned(job_id.to_string()).into())
        }
    }
}

#[async_trait]
impl JobRunner for LocalWarehouse {
    async fn submit(&self, target: &LoadTarget) -> Result<String> {
        validate_table(&target.table)?;
        let job_id = Uuid::new_v4().to_string();
        let status = JobStatus {
            job_id: job_id.clone(),
            table: target.table.clone(),
            source: format!("{}/*{}", target.source.location(), SOURCE_SUFFIX),
            schema_version: target.schema.version.clone(),
            state: JobState::Pending,
            created_at: Utc::now(),
            finished_at: None,
            objects: 0,
            rows_loaded: 0,
            bad_records: 0,
            errors: Vec::new(),
            failure: None,
            source_digest: None,
        };
        persist(&self.root, &status)?;

        let (tx, rx) = watch::channel(status.clone());
        self.jobs.insert(job_id.clone(), rx);
        tokio::spawn(execute(
            self.root.clone(),
            target.clone(),
            status,
            tx,
            self.swap_lock.clone(),
        ));
        Ok(job_id)
    }

    async fn wait(&self, job_id: &str) -> Result<JobStatus> {
        let rx = self.jobs.get(job_id).map(|r| r.value().clone());
        let Some(mut rx) = rx else {
            return self.settled(job_id);
        };
        let finished = rx.wait_for(|s| s.state.is_terminal()).await.map(|s| s.clone());
        match finished {
            Ok(status) => Ok(status),
            // Runner task went away without a terminal update
            Err(_) => self.settled(job_id),
        }
    }

    async fn status(&self, job_id: &str) -> Result<JobStatus> {
        if let Some(rx) = self.jobs.get(job_id) {
            return Ok(rx.borrow().clone());
        }
        self.read_journal(job_id)
    }

    fn name(&self) -> &str {
        "local-warehouse"
    }
}

struct Outcome {
    objects: usize,
    rows: usize,
    errors: Vec<RecordError>,
    digest: String,
}

async fn execute(
    root: PathBuf,
    target: LoadTarget,
    mut status: JobStatus,
    tx: watch::Sender<JobStatus>,
    swap_lock: Arc<Mutex<()>>,
) {
    status.state = JobState::Running;
    publish(&root, &tx, &status);

    let result = run_load(&root, &status.job_id, &target, &swap_lock).await;
    match result {
        Ok(outcome) => {
            status.state = JobState::Succeeded;
            status.objects = outcome.objects;
            status.rows_loaded = outcome.rows;
            status.bad_records = outcome.errors.len();
            status.errors = outcome.errors;
            status.source_digest = Some(outcome.digest);
        }
        Err(e) => {
            if let PipelineError::Load(load) = &e {
                status.errors = load.record_errors().to_vec();
                status.bad_records = status.errors.len();
            }
            status.state = JobState::Failed;
            status.failure = Some(e.to_string());
        }
    }
    status.finished_at = Some(Utc::now());
    publish(&root, &tx, &status);
}

async fn run_load(
    root: &Path,
    job_id: &str,
    target: &LoadTarget,
    swap_lock: &Mutex<()>,
) -> Result<Outcome> {
    let keys = target.source.list(SOURCE_SUFFIX).await?;
    let mut hasher = blake3::Hasher::new();
    let mut partitions: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    let mut errors = Vec::new();
    let mut rows = 0;

    for key in &keys {
        let data = target.source.get(key).await?;
        hasher.update(key.as_bytes());
        hasher.update(&data);

        let stream = serde_json::Deserializer::from_slice(&data).into_iter::<Value>();
        for (index, parsed) in stream.enumerate() {
            let record = match parsed {
                Ok(record) => record,
                Err(e) => {
                    errors.push(RecordError {
                        object: key.clone(),
                        index,
                        message: format!("invalid JSON: {}", e),
                    });
                    break;
                }
            };
            let partition = target
                .schema
                .validate(&record)
                .and_then(|_| target.schema.partition_for(&record, &target.partition_field));
            match partition {
                Ok(partition) => {
                    partitions.entry(partition).or_default().push(record);
                    rows += 1;
                }
                Err(message) => errors.push(RecordError {
                    object: key.clone(),
                    index,
                    message,
                }),
            }
        }
    }

    if errors.len() > target.max_bad_records {
        return Err(LoadError::BudgetExceeded {
            bad_records: errors.len(),
            budget: target.max_bad_records,
            errors,
        }
        .into());
    }

    let tables = root.join(TABLES_DIR);
    let staging = tables.join(format!(".staging-{}", job_id));
    if let Err(e) = stage(&staging, &partitions) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }
    {
        let _guard = swap_lock.lock().unwrap_or_else(|e| e.into_inner());
        swap(&tables, &staging, &target.table, job_id)?;
    }
    debug!(
        table = %target.table,
        "Replaced table with {} partitions",
        partitions.len()
    );

    Ok(Outcome {
        objects: keys.len(),
        rows,
        errors,
        digest: hasher.finalize().to_hex().to_string(),
    })
}

fn stage(staging: &Path, partitions: &BTreeMap<String, Vec<Value>>) -> Result<()> {
    std::fs::create_dir_all(staging)?;
    for (partition, rows) in partitions {
        let file = std::fs::File::create(staging.join(format!("{}.{}", partition, PARTITION_EXT)))?;
        let mut out = std::io::BufWriter::new(file);
        for row in rows {
            serde_json::to_writer(&mut out, row)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
    }
    Ok(())
}

fn swap(tables: &Path, staging: &Path, table: &str, job_id: &str) -> Result<()> {
    let live = tables.join(table);
    let retired = tables.join(format!(".retired-{}", job_id));
    let had_live = live.exists();

    if had_live {
        std::fs::rename(&live, &retired)?;
    }
    if let Err(e) = std::fs::rename(staging, &live) {
        if had_live {
            let _ = std::fs::rename(&retired, &live);
        }
        return Err(e.into());
    }
    if had_live {
        if let Err(e) = std::fs::remove_dir_all(&retired) {
            warn!("Could not remove {}: {}", retired.display(), e);
        }
    }
    Ok(())
}

fn publish(root: &Path, tx: &watch::Sender<JobStatus>, status: &JobStatus) {
    if let Err(e) = persist(root, status) {
        error!(job_id = %status.job_id, "Failed to persist job status: {}", e);
    }
    tx.send_replace(status.clone());
}

fn persist(root: &Path, status: &JobStatus) -> Result<()> {
    let path = journal_path(root, &status.job_id)?;
    write_atomic(&path, &serde_json::to_vec_pretty(status)?)
}

fn journal_path(root: &Path, job_id: &str) -> Result<PathBuf> {
    Uuid::parse_str(job_id).map_err(|_| LoadError::UnknownJob(job_id.to_string()))?;
    Ok(root.join(JOBS_DIR).join(format!("{}.json", job_id)))
}

fn validate_table(table: &str) -> Result<()> {
    let ok = !table.is_empty()
        && !table.starts_with('.')
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(PipelineError::Config(format!("invalid table name: {:?}", table)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{load_batch, AnalysisKind};
    use crate::store::{MemoryResultStore, ResultStore};
    use serde_json::json;
    use tempfile::TempDir;

    fn dynamic(name: &str, created: i64) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "Package": {"Ecosystem": "pypi", "Name": name, "Version": "0.1"},
            "CreatedTimestamp": created,
            "Analysis": null
        }))
        .unwrap()
    }

    async fn target(name: &str, objects: &[(&str, Vec<u8>)], budget: usize) -> LoadTarget {
        let store = Arc::new(MemoryResultStore::new(name));
        for (key, data) in objects {
            store.put(key, data.clone()).await.unwrap();
        }
        LoadTarget::for_kind(AnalysisKind::Dynamic, store, budget).unwrap()
    }

    #[tokio::test]
    async fn test_partitions_by_day() {
        let dir = TempDir::new().unwrap();
        let warehouse = LocalWarehouse::open(dir.path()).unwrap();
        let target = target(
            "wh-partitions",
            &[
                ("pypi/a/0.1.json", dynamic("a", 1709294400)),
                ("pypi/b/0.1.json", dynamic("b", 1709380800)),
                ("pypi/c/0.1.json", dynamic("c", 1709294460)),
            ],
            0,
        )
        .await;

        let status = load_batch(&warehouse, &target).await.unwrap();
        assert_eq!(status.objects, 3);
        assert!(status.source_digest.is_some());
        assert_eq!(
            warehouse.partitions("analysis").unwrap(),
            vec!["20240301".to_string(), "20240302".to_string()]
        );
        assert_eq!(warehouse.table_rows("analysis").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_truncate_and_replace() {
        let dir = TempDir::new().unwrap();
        let warehouse = LocalWarehouse::open(dir.path()).unwrap();

        let first = target(
            "wh-truncate-1",
            &[
                ("pypi/a/0.1.json", dynamic("a", 1709294400)),
                ("pypi/b/0.1.json", dynamic("b", 1709294400)),
            ],
            0,
        )
        .await;
        load_batch(&warehouse, &first).await.unwrap();

        let second = target("wh-truncate-2", &[("pypi/c/0.1.json", dynamic("c", 1709294400))], 0).await;
        load_batch(&warehouse, &second).await.unwrap();

        let rows = warehouse.table_rows("analysis").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Package"]["Name"], "c");
    }

    #[tokio::test]
    async fn test_failed_load_keeps_previous_table() {
        let dir = TempDir::new().unwrap();
        let warehouse = LocalWarehouse::open(dir.path()).unwrap();

        let good = target("wh-keep-good", &[("pypi/a/0.1.json", dynamic("a", 1709294400))], 0).await;
        load_batch(&warehouse, &good).await.unwrap();

        let bad = target(
            "wh-keep-bad",
            &[
                ("pypi/b/0.1.json", dynamic("b", 1709294400)),
                ("pypi/c/0.1.json", b"[]".to_vec()),
            ],
            0,
        )
        .await;
        assert!(load_batch(&warehouse, &bad).await.is_err());

        let rows = warehouse.table_rows("analysis").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Package"]["Name"], "a");
    }

    #[tokio::test]
    async fn test_multiple_records_per_object() {
        let dir = TempDir::new().unwrap();
        let warehouse = LocalWarehouse::open(dir.path()).unwrap();
        let mut data = dynamic("a", 1709294400);
        data.push(b'\n');
        data.extend(dynamic("b", 1709294400));
        data.extend(b"\n{\"Package\": 3}\n");

        let target = target("wh-ndjson", &[("batch.json", data)], 1).await;
        let status = load_batch(&warehouse, &target).await.unwrap();
        assert_eq!(status.rows_loaded, 2);
        assert_eq!(status.errors.len(), 1);
        assert_eq!(status.errors[0].index, 2);
    }

    #[tokio::test]
    async fn test_status_survives_restart() {
        let dir = TempDir::new().unwrap();
        let job_id = {
            let warehouse = LocalWarehouse::open(dir.path()).unwrap();
            let target = target("wh-restart", &[("pypi/a/0.1.json", dynamic("a", 1709294400))], 0).await;
            load_batch(&warehouse, &target).await.unwrap().job_id
        };

        let reopened = LocalWarehouse::open(dir.path()).unwrap();
        let status = reopened.status(&job_id).await.unwrap();
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(status.rows_loaded, 1);
        assert_eq!(reopened.wait(&job_id).await.unwrap().state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_orphaned_and_unknown_jobs() {
        let dir = TempDir::new().unwrap();
        let warehouse = LocalWarehouse::open(dir.path()).unwrap();
        let job_id = Uuid::new_v4().to_string();
        let status = JobStatus {
            job_id: job_id.clone(),
            table: "analysis".into(),
            source: "mem://gone/*.json".into(),
            schema_version: "3".into(),
            state: JobState::Running,
            created_at: Utc::now(),
            finished_at: None,
            objects: 0,
            rows_loaded: 0,
            bad_records: 0,
            errors: Vec::new(),
            failure: None,
            source_digest: None,
        };
        persist(dir.path(), &status).unwrap();

        let err = warehouse.wait(&job_id).await.unwrap_err();
        assert!(matches!(err, PipelineError::Load(LoadError::Orphaned(_))));
        assert_eq!(warehouse.status(&job_id).await.unwrap().state, JobState::Running);

        let err = warehouse.status(&Uuid::new_v4().to_string()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Load(LoadError::UnknownJob(_))));
        let err = warehouse.status("../../etc/passwd").await.unwrap_err();
        assert!(matches!(err, PipelineError::Load(LoadError::UnknownJob(_))));
    }

    #[test]
    fn test_table_names() {
        assert!(validate_table("static_analysis").is_ok());
        assert!(validate_table("").is_err());
        assert!(validate_table(".staging-x").is_err());
        assert!(validate_table("a/b").is_err());
    }
}
