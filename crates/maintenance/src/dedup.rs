//! Duplicate trace removal.
//!
//! Runs in three steps per index: load (scroll ascending by `timestamp`),
//! filter (within a run of equal timestamps, a document whose fields equal
//! an earlier one's is recorded into `.to-delete`) and, when asked, remove.
//! Only exactly equal timestamps are grouped, so duplicates whose timestamps
//! differ slightly are never found.

use analytics_migrations::classify::{TO_DELETE_INDEX, is_system_index};
use analytics_storage::{
    DEFAULT_SCROLL_BATCH, Document, ScrollRequest, SearchHit, SearchStore, StoreError,
};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

const TIMESTAMP_FIELD: &str = "timestamp";

#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("marker {id} is malformed: {reason}")]
    MalformedMarker { id: String, reason: String },
    #[error("{failed} marker(s) could not be written to {TO_DELETE_INDEX}, first error: {first_error}")]
    MarkerWrite { failed: usize, first_error: String },
}

/// An original/duplicate pair recorded in the marker index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateMarker {
    pub index: String,
    pub original: String,
    pub duplicate: String,
}

impl DuplicateMarker {
    fn id(&self) -> String {
        format!("{}_{}", self.index, self.duplicate)
    }

    fn to_document(&self, timestamp: &Value) -> Document {
        let mut document = Document::new();
        document.insert("index".to_owned(), json!(self.index));
        document.insert("original".to_owned(), json!(self.original));
        document.insert("duplicate".to_owned(), json!(self.duplicate));
        document.insert(TIMESTAMP_FIELD.to_owned(), timestamp.clone());
        document
    }

    fn from_hit(hit: &SearchHit) -> Result<Self, DedupError> {
        let field = |name: &str| {
            hit.source
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| DedupError::MalformedMarker {
                    id: hit.id.clone(),
                    reason: format!("missing {name}"),
                })
        };
        Ok(Self {
            index: field("index")?,
            original: field("original")?,
            duplicate: field("duplicate")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexDedupReport {
    pub index: String,
    pub scanned: u64,
    pub duplicates: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemovalReport {
    pub removed: u64,
    /// Markers whose duplicate was already gone.
    pub already_missing: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupReport {
    pub indices: Vec<IndexDedupReport>,
    pub removal: Option<RemovalReport>,
}

impl DedupReport {
    pub fn duplicates(&self) -> u64 {
        self.indices.iter().map(|index| index.duplicates).sum()
    }

    pub fn failed_indices(&self) -> usize {
        self.indices.iter().filter(|index| index.error.is_some()).count()
    }
}

/// Documents sharing the timestamp currently being scanned.
#[derive(Default)]
struct TimestampGroup {
    timestamp: Option<Value>,
    originals: Vec<SearchHit>,
}

impl TimestampGroup {
    /// Returns the id of the earlier equal document when `hit` is a duplicate.
    fn admit(&mut self, hit: SearchHit) -> Option<String> {
        let timestamp = hit.source.get(TIMESTAMP_FIELD).filter(|t| !t.is_null()).cloned();
        let Some(timestamp) = timestamp else {
            // untimed documents are never grouped
            self.timestamp = None;
            self.originals.clear();
            return None;
        };
        if self.timestamp.as_ref() != Some(&timestamp) {
            self.timestamp = Some(timestamp);
            self.originals.clear();
        }
        if let Some(original) = self.originals.iter().find(|o| o.source == hit.source) {
            return Some(original.id.clone());
        }
        self.originals.push(hit);
        None
    }
}

#[derive(Debug, Clone)]
pub struct DuplicateResolver {
    search: SearchStore,
    batch_size: usize,
}

impl DuplicateResolver {
    pub fn new(search: SearchStore) -> Self {
        Self {
            search,
            batch_size: DEFAULT_SCROLL_BATCH,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Trace indices eligible for deduplication.
    pub async fn eligible_indices(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .search
            .list_indices()
            .await?
            .into_iter()
            .filter(|index| !is_system_index(index))
            .collect())
    }

    /// Loads and filters `index`, recording every duplicate in the marker index.
    pub async fn mark_duplicates(&self, index: &str) -> Result<IndexDedupReport, DedupError> {
        let mut report = IndexDedupReport {
            index: index.to_owned(),
            ..Default::default()
        };
        let mut group = TimestampGroup::default();
        let mut cursor = self.search.scroll(
            ScrollRequest::new(index)
                .sorted_by(TIMESTAMP_FIELD)
                .with_batch_size(self.batch_size),
        );
        while let Some(page) = cursor.next_page().await? {
            let mut markers = Vec::new();
            for hit in page {
                report.scanned += 1;
                let duplicate = hit.id.clone();
                let timestamp = hit.source.get(TIMESTAMP_FIELD).cloned().unwrap_or_default();
                if let Some(original) = group.admit(hit) {
                    let marker = DuplicateMarker {
                        index: index.to_owned(),
                        original,
                        duplicate,
                    };
                    markers.push((marker.id(), marker.to_document(&timestamp)));
                }
            }
            report.duplicates += markers.len() as u64;
            let response = self.search.bulk_index(TO_DELETE_INDEX, markers).await?;
            if let Some(first) = response.failures.first() {
                return Err(DedupError::MarkerWrite {
                    failed: response.failures.len(),
                    first_error: first.error.to_string(),
                });
            }
        }
        info!(%index, scanned = report.scanned, duplicates = report.duplicates, "Filtered index");
        Ok(report)
    }

    /// Deletes every recorded duplicate. Delete errors are logged and counted,
    /// never fatal. Markers of removed duplicates are dropped, as is the
    /// marker index once empty.
    pub async fn remove_marked(&self) -> Result<RemovalReport, DedupError> {
        let mut report = RemovalReport::default();
        if !self.search.index_exists(TO_DELETE_INDEX).await? {
            return Ok(report);
        }
        self.search.refresh(TO_DELETE_INDEX).await?;
        // collected first so the cursor never reads an index it is deleting from
        let markers = self
            .search
            .scroll_all(ScrollRequest::new(TO_DELETE_INDEX).with_batch_size(self.batch_size))
            .await?;
        for hit in markers {
            let marker = match DuplicateMarker::from_hit(&hit) {
                Ok(marker) => marker,
                Err(error) => {
                    warn!(%error, "Skipping marker");
                    report.failed += 1;
                    continue;
                }
            };
            match self
                .search
                .delete_document(&marker.index, &marker.duplicate)
                .await
            {
                Ok(()) => report.removed += 1,
                Err(error) if error.is_not_found() => report.already_missing += 1,
                Err(error) => {
                    warn!(
                        index = %marker.index,
                        duplicate = %marker.duplicate,
                        %error,
                        "Failed to delete duplicate"
                    );
                    report.failed += 1;
                    continue;
                }
            }
            if let Err(error) = self.search.delete_document(TO_DELETE_INDEX, &hit.id).await {
                warn!(marker = %hit.id, %error, "Failed to drop marker");
            }
        }
        self.search.refresh(TO_DELETE_INDEX).await?;
        if self.search.count(TO_DELETE_INDEX).await? == 0 {
            self.search.delete_index_if_exists(TO_DELETE_INDEX).await?;
        }
        info!(
            removed = report.removed,
            already_missing = report.already_missing,
            failed = report.failed,
            "Removed duplicates"
        );
        Ok(report)
    }

    /// Marks duplicates in `indices` (every eligible index when empty), then
    /// removes them when `remove` is set. A failing index does not stop the others.
    pub async fn run(&self, indices: &[String], remove: bool) -> Result<DedupReport, DedupError> {
        let targets = if indices.is_empty() {
            self.eligible_indices().await?
        } else {
            indices.to_vec()
        };
        let results = join_all(targets.iter().map(|index| self.mark_duplicates(index))).await;

        let mut report = DedupReport::default();
        for (index, result) in targets.iter().zip(results) {
            report.indices.push(result.unwrap_or_else(|error| {
                warn!(%index, %error, "Deduplication failed for index");
                IndexDedupReport {
                    index: index.clone(),
                    error: Some(error.to_string()),
                    ..Default::default()
                }
            }));
        }
        if remove {
            report.removal = Some(self.remove_marked().await?);
        }
        Ok(report)
    }
}
