// Storage API shared by every engine

use std::fmt::Debug;

use serde_json::{Map, Value};

use crate::{error::StoreError, filter::Filter};

/// A JSON object. Document-store records carry their identifier under `_id`.
pub type Document = Map<String, Value>;

pub const ID_FIELD: &str = "_id";

pub fn document_id(document: &Document) -> Option<&str> {
    document.get(ID_FIELD).and_then(Value::as_str)
}

// We need async_trait because the stabilized feature lacks support for object safety
// (i.e. dyn DocumentEngine)
#[async_trait::async_trait]
pub trait DocumentEngine: Debug + Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn list_collections(&self) -> Result<Vec<String>, StoreError>;

    async fn collection_exists(&self, collection: &str) -> Result<bool, StoreError>;

    /// Returns every document in `collection` matching `filter`, ordered by `_id`.
    /// A missing collection yields an empty result.
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError>;

    /// Inserts a new document, assigning an `_id` when absent. Returns the id.
    async fn insert(&self, collection: &str, document: Document) -> Result<String, StoreError>;

    /// Upserts a document keyed by its `_id`.
    async fn replace(&self, collection: &str, document: Document) -> Result<(), StoreError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    /// Fails with `NotFound` when `from` is missing and `AlreadyExists` when `to` exists.
    async fn rename_collection(&self, from: &str, to: &str) -> Result<(), StoreError>;

    async fn drop_collection(&self, collection: &str) -> Result<(), StoreError>;

    /// Copies every document of `from` into a new collection `to`. Returns the copied count.
    async fn copy_collection(&self, from: &str, to: &str) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub index: String,
    pub id: String,
    pub source: Document,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScrollRequest {
    pub index: String,
    /// Ascending sort field; documents without it sort last.
    pub sort_field: Option<String>,
    pub batch_size: usize,
    pub filter: Filter,
}

impl ScrollRequest {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            sort_field: None,
            batch_size: DEFAULT_SCROLL_BATCH,
            filter: Filter::All,
        }
    }

    pub fn sorted_by(mut self, field: impl Into<String>) -> Self {
        self.sort_field = Some(field.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }
}

pub const DEFAULT_SCROLL_BATCH: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct ScrollPage {
    /// `None` once the cursor is exhausted.
    pub scroll_id: Option<String>,
    pub hits: Vec<SearchHit>,
}

#[derive(Debug)]
pub struct BulkItemError {
    pub id: String,
    pub error: StoreError,
}

#[derive(Debug, Default)]
pub struct BulkResponse {
    pub indexed: usize,
    pub failures: Vec<BulkItemError>,
}

impl BulkResponse {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Handle on a copy running inside the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReindexTask(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReindexStatus {
    Running,
    Completed { copied: u64 },
}

#[async_trait::async_trait]
pub trait SearchEngine: Debug + Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn list_indices(&self) -> Result<Vec<String>, StoreError>;

    async fn index_exists(&self, index: &str) -> Result<bool, StoreError>;

    async fn create_index(&self, index: &str) -> Result<(), StoreError>;

    async fn delete_index(&self, index: &str) -> Result<(), StoreError>;

    async fn get(&self, index: &str, id: &str) -> Result<Option<SearchHit>, StoreError>;

    /// Indexes (creates or overwrites) one document. Creates the index when missing.
    async fn index_document(
        &self,
        index: &str,
        id: Option<&str>,
        source: Document,
    ) -> Result<String, StoreError>;

    /// Per-document failures are reported in the response, not as an `Err`.
    async fn bulk_index(
        &self,
        index: &str,
        documents: Vec<(String, Document)>,
    ) -> Result<BulkResponse, StoreError>;

    async fn delete_document(&self, index: &str, id: &str) -> Result<(), StoreError>;

    async fn search(
        &self,
        index: &str,
        filter: &Filter,
        size: usize,
    ) -> Result<Vec<SearchHit>, StoreError>;

    async fn count(&self, index: &str) -> Result<u64, StoreError>;

    async fn open_scroll(&self, request: &ScrollRequest) -> Result<ScrollPage, StoreError>;

    async fn scroll(&self, scroll_id: &str) -> Result<ScrollPage, StoreError>;

    async fn clear_scroll(&self, scroll_id: &str) -> Result<(), StoreError>;

    /// Starts copying every document of `source` into `dest`.
    ///
    /// Submitting twice copies twice, so callers must not resubmit on a
    /// transient error. Progress is read with [`SearchEngine::reindex_status`].
    async fn start_reindex(&self, source: &str, dest: &str) -> Result<ReindexTask, StoreError>;

    async fn reindex_status(&self, task: &ReindexTask) -> Result<ReindexStatus, StoreError>;

    async fn field_limit(&self, index: &str) -> Result<u64, StoreError>;

    async fn set_field_limit(&self, index: &str, limit: u64) -> Result<(), StoreError>;

    async fn refresh(&self, index: &str) -> Result<(), StoreError>;
}
