//! Indicator documents derived from dynamic analysis results
//!
//! Each stored result is reduced to three sets of searchable terms: file
//! path components, command arguments and socket addresses. The terms are
//! split into documents of at most [`MAX_INDEX_ENTRIES`] entries so no
//! single document grows without bound.

use crate::error::{PipelineError, Result};
use crate::query::IndexStore;
use crate::store::{ResultRecord, ResultStore};
use crate::types::PackageIdentifier;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Component, Path};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Entries per index document
pub const MAX_INDEX_ENTRIES: usize = 10_000;

/// A searchable indicator collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Files,
    Commands,
    Ips,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::Files, Collection::Commands, Collection::Ips];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Files => "files",
            Collection::Commands => "commands",
            Collection::Ips => "ips",
        }
    }

    /// Collection searched by a query `type`
    pub fn from_query_type(kind: &str) -> Result<Self> {
        match kind {
            "file" => Ok(Collection::Files),
            "command" => Ok(Collection::Commands),
            "ip" => Ok(Collection::Ips),
            _ => Err(PipelineError::InvalidQuery("invalid search type".into())),
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chunk of a package's terms in one collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Package")]
    pub package: PackageIdentifier,
    #[serde(rename = "Indexes")]
    pub indexes: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct Trace {
    #[serde(default)]
    files: Option<Vec<FileAccess>>,
    #[serde(default)]
    sockets: Option<Vec<SocketUse>>,
    #[serde(default)]
    commands: Option<Vec<CommandRun>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FileAccess {
    path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SocketUse {
    address: String,
    #[serde(default)]
    port: Option<u16>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommandRun {
    #[serde(default)]
    command: Option<Vec<String>>,
}

/// Searchable terms of one analysis
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Indicators {
    pub files: BTreeSet<String>,
    pub commands: BTreeSet<String>,
    pub ips: BTreeSet<String>,
}

impl Indicators {
    /// Extract terms from a sandbox trace. A null trace has none.
    pub fn from_analysis(analysis: &Value) -> Result<Self> {
        if analysis.is_null() {
            return Ok(Self::default());
        }
        let trace: Trace = serde_json::from_value(analysis.clone())?;
        let mut indicators = Self::default();

        for file in trace.files.unwrap_or_default() {
            indicators.files.extend(path_components(&file.path));
        }
        for socket in trace.sockets.unwrap_or_default() {
            if let Some(port) = socket.port {
                indicators.ips.insert(format!("{}-{}", socket.address, port));
            }
            indicators.ips.insert(socket.address);
        }
        for command in trace.commands.unwrap_or_default() {
            indicators
                .commands
                .extend(command.command.unwrap_or_default().into_iter().filter(|a| !a.is_empty()));
        }
        Ok(indicators)
    }

    pub fn get(&self, collection: Collection) -> &BTreeSet<String> {
        match collection {
            Collection::Files => &self.files,
            Collection::Commands => &self.commands,
            Collection::Ips => &self.ips,
        }
    }
}

/// Every named component of `path`
fn path_components(path: &str) -> impl Iterator<Item = String> + '_ {
    Path::new(path).components().filter_map(|c| match c {
        Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
        _ => None,
    })
}

/// Document key for chunk `chunk` of a package
pub fn document_id(package: &PackageIdentifier, chunk: usize) -> String {
    let base = format!("{}-{}-{}", package.ecosystem(), package.name(), package.version());
    format!("{}-{}", base.replace('/', "\\"), chunk)
}

/// Split `terms` into documents of at most [`MAX_INDEX_ENTRIES`]
pub fn chunk_documents(package: &PackageIdentifier, terms: &BTreeSet<String>) -> Vec<IndexDocument> {
    let terms: Vec<String> = terms.iter().cloned().collect();
    terms
        .chunks(MAX_INDEX_ENTRIES)
        .enumerate()
        .map(|(chunk, entries)| IndexDocument {
            id: document_id(package, chunk),
            package: package.clone(),
            indexes: entries.to_vec(),
        })
        .collect()
}

/// All documents for one stored result, per collection
pub fn documents_for(record: &ResultRecord) -> Result<Vec<(Collection, IndexDocument)>> {
    let indicators = Indicators::from_analysis(&record.analysis)?;
    Ok(Collection::ALL
        .iter()
        .flat_map(|&collection| {
            chunk_documents(&record.package, indicators.get(collection))
                .into_iter()
                .map(move |doc| (collection, doc))
        })
        .collect())
}

/// Totals from one index build
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub results: usize,
    pub documents: usize,
    pub skipped: usize,
}

/// Walks a result store and fills an index from every stored result
pub struct IndexBuilder {
    store: Arc<dyn ResultStore>,
    index: Arc<dyn IndexStore>,
}

impl IndexBuilder {
    pub fn new(store: Arc<dyn ResultStore>, index: Arc<dyn IndexStore>) -> Self {
        Self { store, index }
    }

    /// Index every `.json` object. Objects that are not result records are
    /// skipped with a warning; store and index failures abort the build.
    pub async fn build(&self) -> Result<IndexStats> {
        let mut stats = IndexStats::default();
        for key in self.store.list(".json").await? {
            let data = self.store.get(&key).await?;
            let documents = match serde_json::from_slice::<ResultRecord>(&data)
                .map_err(PipelineError::from)
                .and_then(|record| documents_for(&record))
            {
                Ok(documents) => documents,
                Err(e) => {
                    warn!(key = %key, "Skipping unindexable result: {}", e);
                    stats.skipped += 1;
                    continue;
                }
            };

            debug!(key = %key, "Indexing {} documents", documents.len());
            for (collection, document) in documents {
                self.index.put(collection, document).await?;
                stats.documents += 1;
            }
            stats.results += 1;
        }

        info!(
            source = %self.store.location(),
            index = self.index.name(),
            "Index build complete: {} results, {} documents, {} skipped",
            stats.results,
            stats.documents,
            stats.skipped
        );
        Ok(stats)
    }
}
