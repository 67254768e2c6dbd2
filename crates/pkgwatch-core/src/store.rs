//! Result store
//!
//! Object storage for analysis results, keyed by package identifier.
//! Writes to an existing key replace it (last write wins), so redelivered
//! jobs overwrite the previous result instead of piling up versions.

use crate::error::{PipelineError, Result};
use crate::types::PackageIdentifier;
use async_trait::async_trait;
use dashmap::DashMap;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Object storage for result documents
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Store `data` under `key`, replacing any previous object
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// Fetch an object
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Keys ending in `suffix`, in lexical order
    async fn list(&self, suffix: &str) -> Result<Vec<String>>;

    /// Human-readable location, for logs
    fn location(&self) -> String;
}

/// A parsed bucket URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketUrl {
    /// `file:///path/to/dir`
    File(PathBuf),
    /// `mem://name`, shared within the process
    Memory(String),
}

impl BucketUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if let Some(path) = url.strip_prefix("file://") {
            if path.is_empty() || !path.starts_with('/') {
                return Err(PipelineError::Config(format!(
                    "Bucket path must be absolute: {}",
                    url
                )));
            }
            return Ok(BucketUrl::File(PathBuf::from(path)));
        }
        if let Some(name) = url.strip_prefix("mem://") {
            let name = name.trim_matches('/');
            if name.is_empty() {
                return Err(PipelineError::Config(format!("No bucket name in {}", url)));
            }
            return Ok(BucketUrl::Memory(name.to_string()));
        }
        Err(PipelineError::Config(format!(
            "Unsupported bucket URL (expected file:// or mem://): {}",
            url
        )))
    }

    /// Open the store this URL points at
    pub fn open(&self) -> Result<Arc<dyn ResultStore>> {
        match self {
            BucketUrl::File(path) => Ok(Arc::new(FsResultStore::new(path.clone())?)),
            BucketUrl::Memory(name) => {
                let store: Arc<MemoryResultStore> = MEMORY_BUCKETS
                    .entry(name.clone())
                    .or_insert_with(|| Arc::new(MemoryResultStore::new(name)))
                    .clone();
                Ok(store)
            }
        }
    }
}

impl std::fmt::Display for BucketUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BucketUrl::File(path) => write!(f, "file://{}", path.display()),
            BucketUrl::Memory(name) => write!(f, "mem://{}", name),
        }
    }
}

lazy_static! {
    static ref MEMORY_BUCKETS: DashMap<String, Arc<MemoryResultStore>> = DashMap::new();
}

/// Object key for an identifier's result: `<ecosystem>/<name>/<version>.json`
pub fn object_key(id: &PackageIdentifier) -> String {
    format!("{}/{}/{}.json", id.ecosystem(), id.name(), id.version())
}

/// Dynamic analysis result as uploaded by the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResultRecord {
    pub package: PackageIdentifier,
    /// Unix seconds; the dynamic table is partitioned on this field
    pub created_timestamp: i64,
    /// Document produced by the sandbox, stored as-is
    pub analysis: serde_json::Value,
}

impl ResultRecord {
    pub fn new(package: PackageIdentifier, analysis: serde_json::Value) -> Self {
        Self {
            package,
            created_timestamp: chrono::Utc::now().timestamp(),
            analysis,
        }
    }
}

/// Serialize `value` as compact JSON and store it under `key`
pub async fn upload<T: Serialize + ?Sized>(store: &dyn ResultStore, key: &str, value: &T) -> Result<()> {
    let data = serde_json::to_vec(value)?;
    store.put(key, data).await?;
    debug!("Uploaded {} to {}", key, store.location());
    Ok(())
}

pub(crate) fn validate_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(PipelineError::Store(format!("Invalid object key: {:?}", key)));
    }
    Ok(())
}

/// Write to a hidden temp file next to `path`, then rename into place
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| PipelineError::Store(format!("No parent directory for {}", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Result store backed by a local directory
pub struct FsResultStore {
    root: PathBuf,
}

impl FsResultStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn collect(&self, dir: &Path, prefix: &str, suffix: &str, out: &mut Vec<String>) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let key = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            if entry.file_type()?.is_dir() {
                self.collect(&entry.path(), &key, suffix, out)?;
            } else if key.ends_with(suffix) {
                out.push(key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ResultStore for FsResultStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        write_atomic(&self.root.join(key), &data)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        match std::fs::read(self.root.join(key)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(PipelineError::NotFound(format!("{}/{}", self.location(), key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, suffix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.collect(&self.root, "", suffix, &mut keys)?;
        keys.sort();
        Ok(keys)
    }

    fn location(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

/// Result store held in memory
pub struct MemoryResultStore {
    name: String,
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryResultStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        self.objects
            .write()
            .map_err(|_| PipelineError::Store("memory bucket lock poisoned".into()))?
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .map_err(|_| PipelineError::Store("memory bucket lock poisoned".into()))?
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("{}/{}", self.location(), key)))
    }

    async fn list(&self, suffix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .map_err(|_| PipelineError::Store("memory bucket lock poisoned".into()))?
            .keys()
            .filter(|k| k.ends_with(suffix))
            .cloned()
            .collect())
    }

    fn location(&self) -> String {
        format!("mem://{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Ecosystem;
    use tempfile::TempDir;

    #[test]
    fn test_object_key() {
        let id = PackageIdentifier::new(Ecosystem::Npm, "@scope/pkg", "1.2.3").unwrap();
        assert_eq!(object_key(&id), "npm/@scope/pkg/1.2.3.json");
    }

    #[test]
    fn test_bucket_url_parsing() {
        assert_eq!(
            BucketUrl::parse("file:///var/results").unwrap(),
            BucketUrl::File(PathBuf::from("/var/results"))
        );
        assert_eq!(
            BucketUrl::parse("mem://results").unwrap(),
            BucketUrl::Memory("results".into())
        );
        assert!(BucketUrl::parse("gs://bucket").is_err());
        assert!(BucketUrl::parse("file://relative").is_err());
        assert!(BucketUrl::parse("").is_err());
    }

    #[tokio::test]
    async fn test_fs_store_overwrites_and_lists() {
        let dir = TempDir::new().unwrap();
        let store = FsResultStore::new(dir.path().to_path_buf()).unwrap();

        store.put("npm/a/1.json", b"one".to_vec()).await.unwrap();
        store.put("npm/a/1.json", b"two".to_vec()).await.unwrap();
        store.put("pypi/b/2.json", b"{}".to_vec()).await.unwrap();
        store.put("notes.txt", b"skip".to_vec()).await.unwrap();

        assert_eq!(store.get("npm/a/1.json").await.unwrap(), b"two");
        assert_eq!(
            store.list(".json").await.unwrap(),
            vec!["npm/a/1.json".to_string(), "pypi/b/2.json".to_string()]
        );
        assert!(matches!(
            store.get("npm/missing.json").await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let store = FsResultStore::new(dir.path().to_path_buf()).unwrap();
        assert!(store.put("../outside.json", Vec::new()).await.is_err());
        assert!(store.put("/abs.json", Vec::new()).await.is_err());
        assert!(store.put("a//b.json", Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_buckets_are_shared_by_name() {
        let url = BucketUrl::parse("mem://store-test-shared").unwrap();
        let a = url.open().unwrap();
        let b = url.open().unwrap();
        a.put("k.json", b"v".to_vec()).await.unwrap();
        assert_eq!(b.get("k.json").await.unwrap(), b"v");
    }

    #[tokio::test]
    async fn test_upload_record_envelope() {
        let store = MemoryResultStore::new("envelope");
        let id = PackageIdentifier::new(Ecosystem::PyPI, "requests", "2.31.0").unwrap();
        let record = ResultRecord::new(id.clone(), serde_json::json!({"Files": []}));
        upload(&store, &object_key(&id), &record).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&store.get("pypi/requests/2.31.0.json").await.unwrap()).unwrap();
        assert_eq!(raw["Package"]["Name"], "requests");
        assert_eq!(raw["Package"]["Ecosystem"], "pypi");
        assert!(raw["CreatedTimestamp"].is_i64());
        assert_eq!(raw["Analysis"], serde_json::json!({"Files": []}));
    }
}
