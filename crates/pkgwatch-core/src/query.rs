//! Paginated search over the indicator index, and its HTTP surface

use crate::error::{PipelineError, Result};
use crate::index::{Collection, IndexDocument};
use crate::store::write_atomic;
use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error};

/// Results per page
pub const PAGE_SIZE: usize = 32;

/// Storage for index documents, ordered by document id
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Insert or replace a document
    async fn put(&self, collection: Collection, document: IndexDocument) -> Result<()>;

    /// Up to `limit` documents containing `term`, in id order, starting at
    /// `start_at` inclusive
    async fn find(
        &self,
        collection: Collection,
        term: &str,
        start_at: Option<&str>,
        limit: usize,
    ) -> Result<Vec<IndexDocument>>;

    fn name(&self) -> &str;
}

/// In-process index, optionally saved as one JSON file per collection
#[derive(Default)]
pub struct MemoryIndex {
    collections: DashMap<Collection, BTreeMap<String, IndexDocument>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load collections saved under `dir`. Missing files are empty collections.
    pub fn open(dir: &Path) -> Result<Self> {
        let index = Self::new();
        for collection in Collection::ALL {
            let path = collection_path(dir, collection);
            let data = match std::fs::read(&path) {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let documents: Vec<IndexDocument> = serde_json::from_slice(&data)?;
            debug!("Loaded {} {} documents", documents.len(), collection);
            index.collections.insert(
                collection,
                documents.into_iter().map(|d| (d.id.clone(), d)).collect(),
            );
        }
        Ok(index)
    }

    /// Write every collection under `dir`
    pub fn save(&self, dir: &Path) -> Result<()> {
        for collection in Collection::ALL {
            let documents: Vec<IndexDocument> = self
                .collections
                .get(&collection)
                .map(|docs| docs.values().cloned().collect())
                .unwrap_or_default();
            write_atomic(&collection_path(dir, collection), &serde_json::to_vec(&documents)?)?;
        }
        Ok(())
    }

    /// Number of documents in a collection
    pub fn len(&self, collection: Collection) -> usize {
        self.collections.get(&collection).map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        Collection::ALL.iter().all(|&c| self.len(c) == 0)
    }
}

fn collection_path(dir: &Path, collection: Collection) -> std::path::PathBuf {
    dir.join(format!("{}.json", collection))
}

#[async_trait]
impl IndexStore for MemoryIndex {
    async fn put(&self, collection: Collection, document: IndexDocument) -> Result<()> {
        self.collections
            .entry(collection)
            .or_default()
            .insert(document.id.clone(), document);
        Ok(())
    }

    async fn find(
        &self,
        collection: Collection,
        term: &str,
        start_at: Option<&str>,
        limit: usize,
    ) -> Result<Vec<IndexDocument>> {
        let Some(documents) = self.collections.get(&collection) else {
            return Ok(Vec::new());
        };
        let matches = documents
            .range::<str, _>((
                start_at.map_or(std::ops::Bound::Unbounded, std::ops::Bound::Included),
                std::ops::Bound::Unbounded,
            ))
            .map(|(_, doc)| doc)
            .filter(|doc| doc.indexes.iter().any(|entry| entry == term))
            .take(limit)
            .cloned()
            .collect();
        Ok(matches)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Body of `POST /query`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub search: String,
    #[serde(default)]
    pub cursor: String,
}

/// One page of results. `next` is empty on the last page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    pub packages: Vec<Value>,
    pub next: String,
}

/// Paginated lookups against an [`IndexStore`]
pub struct QueryService {
    index: Arc<dyn IndexStore>,
    page_size: usize,
}

impl QueryService {
    pub fn new(index: Arc<dyn IndexStore>) -> Self {
        Self {
            index,
            page_size: PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Search one collection for `term`.
    ///
    /// One document beyond the page is fetched; its id becomes `next` and it
    /// is not returned. Passing that id back as `cursor` starts the next page
    /// with that document.
    pub async fn search(&self, kind: &str, term: &str, cursor: &str) -> Result<SearchPage> {
        let collection = Collection::from_query_type(kind)?;
        if term.is_empty() {
            return Err(PipelineError::InvalidQuery(
                "search value should not be empty".into(),
            ));
        }
        let start_at = (!cursor.is_empty()).then_some(cursor);

        let mut documents = self
            .index
            .find(collection, term, start_at, self.page_size + 1)
            .await?;

        let next = if documents.len() > self.page_size {
            documents
                .drain(self.page_size..)
                .next()
                .map(|doc| doc.id)
                .unwrap_or_default()
        } else {
            String::new()
        };

        debug!(
            collection = %collection,
            "Query for {:?} returned {} documents",
            term,
            documents.len()
        );
        Ok(SearchPage {
            packages: documents
                .into_iter()
                .map(|doc| json!({ "Package": doc.package }))
                .collect(),
            next,
        })
    }
}

/// Router serving `POST /query`
pub fn router(service: Arc<QueryService>) -> Router {
    Router::new()
        .route("/query", post(query_handler))
        .with_state(service)
}

async fn query_handler(
    State(service): State<Arc<QueryService>>,
    payload: std::result::Result<Json<QueryRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(request) => request,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    match service
        .search(&request.kind, &request.search, &request.cursor)
        .await
    {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(PipelineError::InvalidQuery(message)) => error_response(StatusCode::BAD_REQUEST, message),
        Err(e) => {
            error!("Query failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
