use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    api::{
        BulkResponse, Document, ReindexStatus, ScrollPage, ScrollRequest, SearchEngine, SearchHit,
    },
    error::StoreError,
    filter::Filter,
    retry::{RetryPolicy, retry_async},
    store_db::{
        search_http::{HttpConfig, HttpStore},
        search_in_memory::Store as InMemorySearch,
    },
};

/// Pause between two reads of a running reindex task.
const REINDEX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Retrying handle over a search engine. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SearchStore {
    engine: Arc<dyn SearchEngine>,
    retry: RetryPolicy,
}

impl Default for SearchStore {
    fn default() -> Self {
        Self {
            engine: Arc::new(InMemorySearch::new()),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchEngineType {
    InMemory,
    Http(String),
}

impl SearchStore {
    pub fn new(engine_type: SearchEngineType) -> Result<Self, StoreError> {
        info!("Starting search engine ({engine_type:?})");
        let store = match engine_type {
            SearchEngineType::InMemory => Self::default(),
            SearchEngineType::Http(url) => {
                Self::with_engine(Arc::new(HttpStore::new(&url, HttpConfig::default())?))
            }
        };
        Ok(store)
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_engine(engine: Arc<dyn SearchEngine>) -> Self {
        Self {
            engine,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        retry_async(&self.retry, "ping", || self.engine.ping()).await
    }

    pub async fn list_indices(&self) -> Result<Vec<String>, StoreError> {
        retry_async(&self.retry, "list_indices", || self.engine.list_indices()).await
    }

    pub async fn index_exists(&self, index: &str) -> Result<bool, StoreError> {
        retry_async(&self.retry, "index_exists", || self.engine.index_exists(index)).await
    }

    pub async fn create_index(&self, index: &str) -> Result<(), StoreError> {
        retry_async(&self.retry, "create_index", || self.engine.create_index(index)).await
    }

    pub async fn delete_index(&self, index: &str) -> Result<(), StoreError> {
        retry_async(&self.retry, "delete_index", || self.engine.delete_index(index)).await
    }

    /// Deletes `index`, treating a missing index as already deleted.
    pub async fn delete_index_if_exists(&self, index: &str) -> Result<bool, StoreError> {
        match self.delete_index(index).await {
            Ok(()) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }

    pub async fn get(&self, index: &str, id: &str) -> Result<Option<SearchHit>, StoreError> {
        retry_async(&self.retry, "get", || self.engine.get(index, id)).await
    }

    pub async fn index_document(
        &self,
        index: &str,
        id: Option<&str>,
        source: Document,
    ) -> Result<String, StoreError> {
        retry_async(&self.retry, "index_document", || {
            self.engine.index_document(index, id, source.clone())
        })
        .await
    }

    pub async fn bulk_index(
        &self,
        index: &str,
        documents: Vec<(String, Document)>,
    ) -> Result<BulkResponse, StoreError> {
        if documents.is_empty() {
            return Ok(BulkResponse::default());
        }
        retry_async(&self.retry, "bulk_index", || {
            self.engine.bulk_index(index, documents.clone())
        })
        .await
    }

    pub async fn delete_document(&self, index: &str, id: &str) -> Result<(), StoreError> {
        retry_async(&self.retry, "delete_document", || {
            self.engine.delete_document(index, id)
        })
        .await
    }

    pub async fn search(
        &self,
        index: &str,
        filter: &Filter,
        size: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        retry_async(&self.retry, "search", || self.engine.search(index, filter, size)).await
    }

    pub async fn count(&self, index: &str) -> Result<u64, StoreError> {
        retry_async(&self.retry, "count", || self.engine.count(index)).await
    }

    /// Copies every document of `source` into `dest` and waits for the copy
    /// to finish, however long it takes. Returns the copied count.
    ///
    /// The copy is submitted exactly once; only the status reads are retried.
    pub async fn reindex(&self, source: &str, dest: &str) -> Result<u64, StoreError> {
        let task = self.engine.start_reindex(source, dest).await?;
        debug!(%source, %dest, task = %task.0, "Reindex started");
        loop {
            let status = retry_async(&self.retry, "reindex_status", || {
                self.engine.reindex_status(&task)
            })
            .await?;
            match status {
                ReindexStatus::Completed { copied } => return Ok(copied),
                ReindexStatus::Running => tokio::time::sleep(REINDEX_POLL_INTERVAL).await,
            }
        }
    }

    pub async fn field_limit(&self, index: &str) -> Result<u64, StoreError> {
        retry_async(&self.retry, "field_limit", || self.engine.field_limit(index)).await
    }

    pub async fn set_field_limit(&self, index: &str, limit: u64) -> Result<(), StoreError> {
        retry_async(&self.retry, "set_field_limit", || {
            self.engine.set_field_limit(index, limit)
        })
        .await
    }

    pub async fn refresh(&self, index: &str) -> Result<(), StoreError> {
        retry_async(&self.retry, "refresh", || self.engine.refresh(index)).await
    }

    /// Opens a batched cursor over `request.index`.
    pub fn scroll(&self, request: ScrollRequest) -> ScrollCursor {
        ScrollCursor {
            store: self.clone(),
            request,
            state: CursorState::Unopened,
        }
    }

    /// Drains a cursor into memory. Only meant for small indices.
    pub async fn scroll_all(&self, request: ScrollRequest) -> Result<Vec<SearchHit>, StoreError> {
        let mut cursor = self.scroll(request);
        let mut hits = Vec::new();
        while let Some(page) = cursor.next_page().await? {
            hits.extend(page);
        }
        Ok(hits)
    }
}

#[derive(Debug)]
enum CursorState {
    Unopened,
    Open(String),
    Done,
}

/// Pages through an index in fixed-size batches.
///
/// The server-side scroll is released when the last page is read. Dropping a
/// cursor mid-way leaves the scroll to expire on its own.
#[derive(Debug)]
pub struct ScrollCursor {
    store: SearchStore,
    request: ScrollRequest,
    state: CursorState,
}

impl ScrollCursor {
    /// Returns the next batch, or `None` once the index is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<SearchHit>>, StoreError> {
        let page = match &self.state {
            CursorState::Done => return Ok(None),
            CursorState::Unopened => {
                let engine = &self.store.engine;
                let request = &self.request;
                retry_async(&self.store.retry, "open_scroll", || {
                    engine.open_scroll(request)
                })
                .await?
            }
            CursorState::Open(scroll_id) => {
                let engine = &self.store.engine;
                retry_async(&self.store.retry, "scroll", || engine.scroll(scroll_id)).await?
            }
        };
        self.advance(page).await
    }

    async fn advance(&mut self, page: ScrollPage) -> Result<Option<Vec<SearchHit>>, StoreError> {
        let ScrollPage { scroll_id, hits } = page;
        if hits.is_empty() {
            if let Some(scroll_id) = scroll_id {
                self.release(&scroll_id).await;
            }
            self.state = CursorState::Done;
            return Ok(None);
        }
        debug!(index = %self.request.index, batch = hits.len(), "read scroll page");
        self.state = match scroll_id {
            Some(scroll_id) => CursorState::Open(scroll_id),
            None => CursorState::Done,
        };
        Ok(Some(hits))
    }

    async fn release(&self, scroll_id: &str) {
        if let Err(error) = self.store.engine.clear_scroll(scroll_id).await {
            warn!(%error, "failed to clear scroll context");
        }
    }
}
