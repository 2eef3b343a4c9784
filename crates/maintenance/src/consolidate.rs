//! Merges per-activity trace indices into the root index their traces point
//! to through `glpId`, together with their results and the saved
//! visualizations that query them.

use std::collections::BTreeMap;

use analytics_migrations::classify::{
    GAMES_DASHBOARD_PREFIX, KIBANA_INDEX, is_system_index, opaque_values_name, results_name,
    root_marker_name,
};
use analytics_migrations::transformers::search_v2::visualizations::{
    SAVED_OBJECT_META, SEARCH_SOURCE, saved_object_body_mut,
};
use analytics_storage::{
    DEFAULT_SCROLL_BATCH, Document, ScrollRequest, SearchHit, SearchStore, StoreError,
};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

pub const PARENT_FIELD: &str = "glpId";
pub const ACTIVITY_FIELD: &str = "activityId";

#[derive(Debug, thiserror::Error)]
pub enum ConsolidationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("visualization {id} has an unreadable search source: {source}")]
    Visualization {
        id: String,
        source: serde_json::Error,
    },
}

/// A document that could not be written to its destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentFailure {
    pub index: String,
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexConsolidation {
    pub index: String,
    pub is_root: bool,
    pub root: Option<String>,
    /// Distinct foreign parents seen, with their trace counts.
    pub parents: BTreeMap<String, u64>,
    pub traces_moved: u64,
    /// Traces without a foreign parent, left in place.
    pub traces_kept: u64,
    pub results_copied: u64,
    pub visualizations_rewritten: u64,
    pub failures: Vec<DocumentFailure>,
    pub deleted: Vec<String>,
    pub error: Option<String>,
}

impl IndexConsolidation {
    fn new(index: &str) -> Self {
        Self {
            index: index.to_owned(),
            ..Default::default()
        }
    }

    /// Standalone indices have neither a root marker nor foreign traces.
    pub fn skipped(&self) -> bool {
        self.root.is_none() && self.error.is_none()
    }

    fn fully_moved(&self) -> bool {
        self.failures.is_empty() && self.traces_kept == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationReport {
    pub indices: Vec<IndexConsolidation>,
}

impl ConsolidationReport {
    pub fn merged(&self) -> usize {
        self.indices.iter().filter(|index| index.root.is_some()).count()
    }

    pub fn failed_indices(&self) -> usize {
        self.indices
            .iter()
            .filter(|index| index.error.is_some() || !index.failures.is_empty())
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct IndexConsolidator {
    search: SearchStore,
    batch_size: usize,
}

impl IndexConsolidator {
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

    pub async fn candidate_indices(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .search
            .list_indices()
            .await?
            .into_iter()
            .filter(|index| !is_system_index(index))
            .collect())
    }

    /// Consolidates `indices` (every candidate when empty), one index at a
    /// time so a merge never targets an index that is being deleted.
    /// A failing index is reported and the run moves on.
    pub async fn run(&self, indices: &[String]) -> Result<ConsolidationReport, StoreError> {
        let targets = if indices.is_empty() {
            self.candidate_indices().await?
        } else {
            indices.to_vec()
        };
        let mut report = ConsolidationReport::default();
        for index in &targets {
            let mut outcome = IndexConsolidation::new(index);
            if let Err(error) = self.consolidate_into(&mut outcome).await {
                warn!(%index, %error, "Consolidation failed for index");
                outcome.error = Some(error.to_string());
            }
            report.indices.push(outcome);
        }
        info!(
            indices = report.indices.len(),
            merged = report.merged(),
            failed = report.failed_indices(),
            "Consolidation finished"
        );
        Ok(report)
    }

    pub async fn consolidate(&self, index: &str) -> Result<IndexConsolidation, ConsolidationError> {
        let mut outcome = IndexConsolidation::new(index);
        self.consolidate_into(&mut outcome).await?;
        Ok(outcome)
    }

    async fn consolidate_into(
        &self,
        outcome: &mut IndexConsolidation,
    ) -> Result<(), ConsolidationError> {
        let index = outcome.index.clone();
        outcome.is_root = self.search.index_exists(&root_marker_name(&index)).await?;

        self.move_traces(outcome).await?;
        if outcome.parents.len() > 1 {
            warn!(%index, parents = ?outcome.parents, "Index has traces from more than one parent");
        }
        let Some(root) = outcome
            .parents
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(parent, _)| parent.clone())
        else {
            debug!(%index, is_root = outcome.is_root, "No foreign traces, nothing to merge");
            return Ok(());
        };
        outcome.root = Some(root.clone());

        self.copy_results(outcome, &root).await?;
        outcome.visualizations_rewritten = self.rewrite_visualizations(&index, &root).await?;

        if outcome.is_root {
            info!(%index, %root, "Source is a root index, keeping it");
        } else if !outcome.fully_moved() {
            warn!(
                %index,
                kept = outcome.traces_kept,
                failures = outcome.failures.len(),
                "Source still holds data, keeping it"
            );
        } else {
            for doomed in [index.clone(), opaque_values_name(&index), results_name(&index)] {
                if self.search.delete_index_if_exists(&doomed).await? {
                    outcome.deleted.push(doomed);
                }
            }
        }
        info!(
            %index,
            %root,
            moved = outcome.traces_moved,
            results = outcome.results_copied,
            visualizations = outcome.visualizations_rewritten,
            "Consolidated index"
        );
        Ok(())
    }

    /// Moves every trace whose parent is another index into that index.
    async fn move_traces(&self, outcome: &mut IndexConsolidation) -> Result<(), ConsolidationError> {
        let index = outcome.index.clone();
        let mut moved_ids = Vec::new();
        let mut cursor = self
            .search
            .scroll(ScrollRequest::new(&index).with_batch_size(self.batch_size));
        while let Some(page) = cursor.next_page().await? {
            let mut by_parent: BTreeMap<String, Vec<(String, Document)>> = BTreeMap::new();
            for hit in page {
                match foreign_parent(&hit, &index) {
                    Some(parent) => {
                        *outcome.parents.entry(parent.clone()).or_default() += 1;
                        by_parent.entry(parent).or_default().push((hit.id, hit.source));
                    }
                    None => outcome.traces_kept += 1,
                }
            }
            for (parent, documents) in by_parent {
                let ids: Vec<String> = documents.iter().map(|(id, _)| id.clone()).collect();
                let response = self.search.bulk_index(&parent, documents).await?;
                for failure in &response.failures {
                    outcome.failures.push(DocumentFailure {
                        index: parent.clone(),
                        id: failure.id.clone(),
                        error: failure.error.to_string(),
                    });
                }
                moved_ids.extend(
                    ids.into_iter()
                        .filter(|id| response.failures.iter().all(|f| &f.id != id)),
                );
            }
        }
        // deleted after the scroll so the cursor never reads a shrinking index
        for id in &moved_ids {
            match self.search.delete_document(&index, id).await {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error.into()),
            }
        }
        outcome.traces_moved = moved_ids.len() as u64;
        Ok(())
    }

    /// Copies `results-<index>` into `results-<root>` under `<index>_<id>` keys.
    async fn copy_results(
        &self,
        outcome: &mut IndexConsolidation,
        root: &str,
    ) -> Result<(), ConsolidationError> {
        let source = results_name(&outcome.index);
        let target = results_name(root);
        if !self.search.index_exists(&source).await? {
            return Ok(());
        }
        let mut cursor = self
            .search
            .scroll(ScrollRequest::new(&source).with_batch_size(self.batch_size));
        while let Some(page) = cursor.next_page().await? {
            let mut pending: BTreeMap<String, Document> = page
                .into_iter()
                .map(|hit| (format!("{}_{}", outcome.index, hit.id), hit.source))
                .collect();
            let batch: Vec<(String, Document)> = pending
                .iter()
                .map(|(key, source)| (key.clone(), source.clone()))
                .collect();
            let response = self.search.bulk_index(&target, batch).await?;
            outcome.results_copied += response.indexed as u64;
            for failure in response.failures {
                let Some(document) = pending.remove(&failure.id) else {
                    continue;
                };
                match self
                    .retry_corrected(&target, &failure.id, document, failure.error)
                    .await
                {
                    Ok(()) => outcome.results_copied += 1,
                    Err(error) => {
                        warn!(index = %target, id = %failure.id, %error, "Result could not be copied");
                        outcome.failures.push(DocumentFailure {
                            index: target.clone(),
                            id: failure.id,
                            error: error.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Fixes what the store rejected and writes the document one more time.
    async fn retry_corrected(
        &self,
        index: &str,
        id: &str,
        mut document: Document,
        error: StoreError,
    ) -> Result<(), StoreError> {
        match error {
            StoreError::IllegalFieldName { ref field, .. } => {
                debug!(%index, %id, %field, "Stripping illegal field names");
                document = sanitize_field_names(document);
            }
            StoreError::FieldLimitExceeded { limit, .. } => {
                let current = self.search.field_limit(index).await?.max(limit);
                let raised = current + count_fields(&document);
                info!(%index, from = current, to = raised, "Raising field limit");
                self.search.set_field_limit(index, raised).await?;
            }
            other => return Err(other),
        }
        self.search
            .index_document(index, Some(id), document)
            .await
            .map(|_| ())
    }

    /// Points every saved visualization that queries `index` at `root`,
    /// narrowed to the activity. Returns how many were rewritten.
    async fn rewrite_visualizations(
        &self,
        index: &str,
        root: &str,
    ) -> Result<u64, ConsolidationError> {
        let mut rewritten = 0;
        let holders = self.search.list_indices().await?.into_iter().filter(|name| {
            name == KIBANA_INDEX || name.starts_with(GAMES_DASHBOARD_PREFIX)
        });
        for holder in holders {
            let hits = self
                .search
                .scroll_all(ScrollRequest::new(&holder).with_batch_size(self.batch_size))
                .await?;
            for mut hit in hits {
                let changed = retarget_visualization(&mut hit.source, index, root).map_err(
                    |source| ConsolidationError::Visualization {
                        id: hit.id.clone(),
                        source,
                    },
                )?;
                if changed {
                    self.search
                        .index_document(&holder, Some(&hit.id), hit.source)
                        .await?;
                    rewritten += 1;
                }
            }
        }
        Ok(rewritten)
    }
}

fn foreign_parent(hit: &SearchHit, index: &str) -> Option<String> {
    hit.source
        .get(PARENT_FIELD)
        .and_then(Value::as_str)
        .filter(|parent| !parent.is_empty() && *parent != index)
        .map(str::to_owned)
}

fn is_illegal_in_field_name(c: char) -> bool {
    c == '.' || c.is_whitespace()
}

/// Removes characters the search store rejects from every field name.
pub fn sanitize_field_names(document: Document) -> Document {
    document
        .into_iter()
        .map(|(key, value)| {
            let mut key: String = key.chars().filter(|c| !is_illegal_in_field_name(*c)).collect();
            if key.is_empty() {
                key.push('_');
            }
            (key, sanitize_value(value))
        })
        .collect()
}

fn sanitize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(sanitize_field_names(map)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        other => other,
    }
}

fn count_fields(document: &Document) -> u64 {
    document
        .values()
        .map(|value| match value {
            Value::Object(nested) => 1 + count_fields(nested),
            _ => 1,
        })
        .sum()
}

/// Rewrites a saved visualization whose search source targets `index`.
/// Returns whether it changed.
pub fn retarget_visualization(
    document: &mut Document,
    index: &str,
    root: &str,
) -> Result<bool, serde_json::Error> {
    let Some(meta) = saved_object_body_mut(document)
        .and_then(|body| body.get_mut(SAVED_OBJECT_META))
        .and_then(Value::as_object_mut)
    else {
        return Ok(false);
    };
    let Some(Value::String(serialized)) = meta.get(SEARCH_SOURCE) else {
        return Ok(false);
    };
    let mut search_source: Value = serde_json::from_str(serialized)?;
    if search_source.get("index").and_then(Value::as_str) != Some(index) {
        return Ok(false);
    }
    search_source["index"] = json!(root);
    narrow_to_activity(&mut search_source, index);
    meta.insert(
        SEARCH_SOURCE.to_owned(),
        Value::String(serde_json::to_string(&search_source)?),
    );
    Ok(true)
}

/// Appends `activityId:<activity>` to the query of a search source.
fn narrow_to_activity(search_source: &mut Value, activity: &str) {
    let clause = format!("{ACTIVITY_FIELD}:{activity}");
    let query = match search_source.get_mut("query") {
        Some(Value::Object(query)) => {
            if query.get("query_string").is_some_and(Value::is_object) {
                query
                    .get_mut("query_string")
                    .and_then(|query_string| query_string.get_mut("query"))
            } else {
                query.get_mut("query")
            }
        }
        Some(text) if text.is_string() => Some(text),
        _ => None,
    };
    match query {
        Some(Value::String(text)) => {
            let trimmed = text.trim();
            *text = if trimmed.is_empty() || trimmed == "*" {
                clause
            } else {
                format!("({trimmed}) AND {clause}")
            };
        }
        _ => {
            search_source["query"] =
                json!({ "query_string": { "query": clause, "analyze_wildcard": true } });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    fn visualization(search_source: Value) -> Document {
        doc(json!({
            "title": "Scores",
            "visState": "{}",
            "kibanaSavedObjectMeta": { "searchSourceJSON": search_source.to_string() },
        }))
    }

    fn search_source(document: &Document) -> Value {
        let serialized = document["kibanaSavedObjectMeta"]["searchSourceJSON"]
            .as_str()
            .unwrap_or("");
        serde_json::from_str(serialized).expect("search source json")
    }

    #[test]
    fn visualizations_of_the_activity_are_pointed_at_the_root() {
        let mut document = visualization(json!({
            "index": "idx1",
            "query": { "query_string": { "query": "score:>3" } },
        }));
        assert!(retarget_visualization(&mut document, "idx1", "idx2").expect("json"));
        let source = search_source(&document);
        assert_eq!(source["index"], "idx2");
        assert_eq!(
            source["query"]["query_string"]["query"],
            "(score:>3) AND activityId:idx1"
        );
    }

    #[test]
    fn wildcard_queries_become_the_activity_filter() {
        let mut document = visualization(json!({ "index": "idx1", "query": "*" }));
        assert!(retarget_visualization(&mut document, "idx1", "idx2").expect("json"));
        assert_eq!(search_source(&document)["query"], "activityId:idx1");

        let mut bare = visualization(json!({ "index": "idx1" }));
        assert!(retarget_visualization(&mut bare, "idx1", "idx2").expect("json"));
        assert_eq!(
            search_source(&bare)["query"]["query_string"]["query"],
            "activityId:idx1"
        );
    }

    #[test]
    fn other_visualizations_are_untouched() {
        let mut document = visualization(json!({ "index": "idx3", "query": "*" }));
        let before = document.clone();
        assert!(!retarget_visualization(&mut document, "idx1", "idx2").expect("json"));
        assert_eq!(document, before);
    }

    #[tokio::test]
    async fn rejected_field_names_are_stripped_before_the_retry() {
        let consolidator = IndexConsolidator::new(SearchStore::in_memory());
        let error = StoreError::IllegalFieldName {
            index: "results-root".to_owned(),
            field: "score.max".to_owned(),
        };
        consolidator
            .retry_corrected("results-root", "a_1", doc(json!({ "score.max": 5 })), error)
            .await
            .expect("second attempt succeeds");

        let hit = consolidator
            .search
            .get("results-root", "a_1")
            .await
            .expect("get")
            .expect("indexed");
        assert_eq!(hit.source["scoremax"], json!(5));
    }

    #[tokio::test]
    async fn other_write_errors_are_not_retried() {
        let consolidator = IndexConsolidator::new(SearchStore::in_memory());
        let error = consolidator
            .retry_corrected(
                "results-root",
                "a_1",
                doc(json!({ "score": 5 })),
                StoreError::Custom("mapping conflict".to_owned()),
            )
            .await
            .expect_err("passed through");
        assert!(matches!(error, StoreError::Custom(_)));
        assert!(
            !consolidator
                .search
                .index_exists("results-root")
                .await
                .expect("exists")
        );
    }

    #[test]
    fn illegal_characters_are_stripped_recursively() {
        let sanitized = sanitize_field_names(doc(json!({
            "score.max": 3,
            "nested": { "a b": [ { "c.d": 1 } ] },
            ".": true,
        })));
        assert_eq!(
            Value::Object(sanitized),
            json!({ "scoremax": 3, "nested": { "ab": [ { "cd": 1 } ] }, "_": true })
        );
    }
}
