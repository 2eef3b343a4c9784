use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard},
};

use serde_json::Value;

use crate::{
    api::{
        BulkItemError, BulkResponse, Document, ReindexStatus, ReindexTask, ScrollPage,
        ScrollRequest, SearchEngine, SearchHit,
    },
    error::StoreError,
    filter::{Filter, lookup},
    store_db::in_memory::new_document_id,
};

/// Same default as Elasticsearch's `index.mapping.total_fields.limit`.
pub const DEFAULT_FIELD_LIMIT: u64 = 1000;

#[derive(Default, Clone, Debug)]
pub struct Store(Arc<Mutex<StoreInner>>);

#[derive(Default, Debug)]
struct StoreInner {
    indices: BTreeMap<String, IndexState>,
    /// Open scroll cursors with their remaining hits
    scrolls: HashMap<String, (usize, VecDeque<SearchHit>)>,
    next_scroll: u64,
    /// Copied count of every finished reindex, by task id
    reindex_tasks: HashMap<String, u64>,
    next_task: u64,
}

#[derive(Debug)]
struct IndexState {
    documents: BTreeMap<String, Document>,
    /// Every field path seen so far, like a dynamic mapping
    fields: BTreeSet<String>,
    field_limit: u64,
}

impl Default for IndexState {
    fn default() -> Self {
        Self {
            documents: BTreeMap::new(),
            fields: BTreeSet::new(),
            field_limit: DEFAULT_FIELD_LIMIT,
        }
    }
}

impl IndexState {
    fn put(&mut self, index: &str, id: String, source: Document) -> Result<(), StoreError> {
        let mut paths = BTreeSet::new();
        collect_field_paths(index, "", &source, &mut paths)?;
        let new_fields = paths.difference(&self.fields).count() as u64;
        if self.fields.len() as u64 + new_fields > self.field_limit {
            return Err(StoreError::FieldLimitExceeded {
                index: index.to_owned(),
                limit: self.field_limit,
            });
        }
        self.fields.extend(paths);
        self.documents.insert(id, source);
        Ok(())
    }
}

fn collect_field_paths(
    index: &str,
    prefix: &str,
    object: &Document,
    paths: &mut BTreeSet<String>,
) -> Result<(), StoreError> {
    for (key, value) in object {
        if key.trim().is_empty() || key.contains('.') {
            return Err(StoreError::IllegalFieldName {
                index: index.to_owned(),
                field: format!("{prefix}{key}"),
            });
        }
        let path = format!("{prefix}{key}");
        match value {
            Value::Object(nested) => collect_field_paths(index, &format!("{path}."), nested, paths)?,
            Value::Array(items) => {
                for item in items {
                    if let Value::Object(nested) = item {
                        collect_field_paths(index, &format!("{path}."), nested, paths)?;
                    }
                }
            }
            _ => {}
        }
        paths.insert(path);
    }
    Ok(())
}

fn compare_json(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(a), Some(b)) => a.to_string().cmp(&b.to_string()),
    }
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> Result<MutexGuard<'_, StoreInner>, StoreError> {
        self.0.lock().map_err(|_| StoreError::LockError)
    }
}

impl StoreInner {
    fn index(&self, index: &str) -> Result<&IndexState, StoreError> {
        self.indices
            .get(index)
            .ok_or_else(|| StoreError::not_found("index", index))
    }

    fn index_mut(&mut self, index: &str) -> Result<&mut IndexState, StoreError> {
        self.indices
            .get_mut(index)
            .ok_or_else(|| StoreError::not_found("index", index))
    }

    fn take_page(&mut self, scroll_id: String) -> Result<ScrollPage, StoreError> {
        let (batch_size, remaining) = self
            .scrolls
            .get_mut(&scroll_id)
            .ok_or_else(|| StoreError::not_found("scroll", scroll_id.clone()))?;
        let take = (*batch_size).min(remaining.len());
        let hits: Vec<SearchHit> = remaining.drain(..take).collect();
        if hits.is_empty() {
            self.scrolls.remove(&scroll_id);
            return Ok(ScrollPage {
                scroll_id: None,
                hits,
            });
        }
        Ok(ScrollPage {
            scroll_id: Some(scroll_id),
            hits,
        })
    }
}

#[async_trait::async_trait]
impl SearchEngine for Store {
    async fn ping(&self) -> Result<(), StoreError> {
        self.inner().map(|_| ())
    }

    async fn list_indices(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner()?.indices.keys().cloned().collect())
    }

    async fn index_exists(&self, index: &str) -> Result<bool, StoreError> {
        Ok(self.inner()?.indices.contains_key(index))
    }

    async fn create_index(&self, index: &str) -> Result<(), StoreError> {
        let mut inner = self.inner()?;
        if inner.indices.contains_key(index) {
            return Err(StoreError::AlreadyExists {
                kind: "index",
                name: index.to_owned(),
            });
        }
        inner.indices.insert(index.to_owned(), IndexState::default());
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<(), StoreError> {
        self.inner()?
            .indices
            .remove(index)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("index", index))
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<SearchHit>, StoreError> {
        let inner = self.inner()?;
        Ok(inner.index(index)?.documents.get(id).map(|source| SearchHit {
            index: index.to_owned(),
            id: id.to_owned(),
            source: source.clone(),
        }))
    }

    async fn index_document(
        &self,
        index: &str,
        id: Option<&str>,
        source: Document,
    ) -> Result<String, StoreError> {
        let id = id.map(str::to_owned).unwrap_or_else(new_document_id);
        let mut inner = self.inner()?;
        inner
            .indices
            .entry(index.to_owned())
            .or_default()
            .put(index, id.clone(), source)?;
        Ok(id)
    }

    async fn bulk_index(
        &self,
        index: &str,
        documents: Vec<(String, Document)>,
    ) -> Result<BulkResponse, StoreError> {
        let mut inner = self.inner()?;
        let state = inner.indices.entry(index.to_owned()).or_default();
        let mut response = BulkResponse::default();
        for (id, source) in documents {
            match state.put(index, id.clone(), source) {
                Ok(()) => response.indexed += 1,
                Err(error) => response.failures.push(BulkItemError { id, error }),
            }
        }
        Ok(response)
    }

    async fn delete_document(&self, index: &str, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner()?;
        inner
            .index_mut(index)?
            .documents
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("document", format!("{index}/{id}")))
    }

    async fn search(
        &self,
        index: &str,
        filter: &Filter,
        size: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        let inner = self.inner()?;
        Ok(inner
            .index(index)?
            .documents
            .iter()
            .filter(|(_, source)| filter.matches(source))
            .take(size)
            .map(|(id, source)| SearchHit {
                index: index.to_owned(),
                id: id.clone(),
                source: source.clone(),
            })
            .collect())
    }

    async fn count(&self, index: &str) -> Result<u64, StoreError> {
        Ok(self.inner()?.index(index)?.documents.len() as u64)
    }

    async fn open_scroll(&self, request: &ScrollRequest) -> Result<ScrollPage, StoreError> {
        let mut inner = self.inner()?;
        let mut hits: Vec<SearchHit> = inner
            .index(&request.index)?
            .documents
            .iter()
            .filter(|(_, source)| request.filter.matches(source))
            .map(|(id, source)| SearchHit {
                index: request.index.clone(),
                id: id.clone(),
                source: source.clone(),
            })
            .collect();
        if let Some(field) = &request.sort_field {
            // stable: ties keep id order
            hits.sort_by(|a, b| compare_json(lookup(&a.source, field), lookup(&b.source, field)));
        }

        inner.next_scroll += 1;
        let scroll_id = format!("scroll-{}", inner.next_scroll);
        inner
            .scrolls
            .insert(scroll_id.clone(), (request.batch_size.max(1), hits.into()));
        inner.take_page(scroll_id)
    }

    async fn scroll(&self, scroll_id: &str) -> Result<ScrollPage, StoreError> {
        self.inner()?.take_page(scroll_id.to_owned())
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<(), StoreError> {
        self.inner()?.scrolls.remove(scroll_id);
        Ok(())
    }

    async fn start_reindex(&self, source: &str, dest: &str) -> Result<ReindexTask, StoreError> {
        let mut inner = self.inner()?;
        let documents = inner.index(source)?.documents.clone();
        let target = inner.indices.entry(dest.to_owned()).or_default();
        let mut copied = 0;
        for (id, document) in documents {
            target.put(dest, id, document)?;
            copied += 1;
        }
        // copies run to completion before the task is handed out
        inner.next_task += 1;
        let task = format!("memory:{}", inner.next_task);
        inner.reindex_tasks.insert(task.clone(), copied);
        Ok(ReindexTask(task))
    }

    async fn reindex_status(&self, task: &ReindexTask) -> Result<ReindexStatus, StoreError> {
        self.inner()?
            .reindex_tasks
            .get(&task.0)
            .map(|&copied| ReindexStatus::Completed { copied })
            .ok_or_else(|| StoreError::not_found("task", task.0.clone()))
    }

    async fn field_limit(&self, index: &str) -> Result<u64, StoreError> {
        Ok(self.inner()?.index(index)?.field_limit)
    }

    async fn set_field_limit(&self, index: &str, limit: u64) -> Result<(), StoreError> {
        self.inner()?.index_mut(index)?.field_limit = limit;
        Ok(())
    }

    async fn refresh(&self, index: &str) -> Result<(), StoreError> {
        self.inner()?.index(index).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn scroll_returns_hits_sorted_in_batches() {
        let store = Store::new();
        for (id, ts) in [("a", 3), ("b", 1), ("c", 2)] {
            store
                .index_document("traces", Some(id), doc(json!({ "timestamp": ts })))
                .await
                .expect("index should succeed");
        }

        let request = ScrollRequest::new("traces")
            .sorted_by("timestamp")
            .with_batch_size(2);
        let first = store.open_scroll(&request).await.expect("scroll opens");
        let ids: Vec<_> = first.hits.iter().map(|hit| hit.id.as_str()).collect();
        assert_eq!(ids, ["b", "c"]);

        let scroll_id = first.scroll_id.expect("cursor should stay open");
        let second = store.scroll(&scroll_id).await.expect("scroll continues");
        assert_eq!(second.hits.len(), 1);
        assert_eq!(second.hits[0].id, "a");

        let last = store.scroll(&scroll_id).await.expect("scroll ends");
        assert!(last.hits.is_empty());
        assert!(last.scroll_id.is_none());
    }

    #[tokio::test]
    async fn dotted_field_names_are_rejected() {
        let store = Store::new();
        let error = store
            .index_document("results-a", Some("1"), doc(json!({ "score.max": 3 })))
            .await
            .expect_err("dotted names are illegal");
        assert!(matches!(error, StoreError::IllegalFieldName { .. }));
    }

    #[tokio::test]
    async fn field_limit_is_enforced_and_adjustable() {
        let store = Store::new();
        store.create_index("results-a").await.expect("create");
        store
            .set_field_limit("results-a", 2)
            .await
            .expect("limit should be set");

        let wide = doc(json!({ "a": 1, "b": 2, "c": 3 }));
        let error = store
            .index_document("results-a", Some("1"), wide.clone())
            .await
            .expect_err("three fields exceed the limit");
        assert!(matches!(error, StoreError::FieldLimitExceeded { limit: 2, .. }));

        store
            .set_field_limit("results-a", 10)
            .await
            .expect("limit should be raised");
        store
            .index_document("results-a", Some("1"), wide)
            .await
            .expect("document fits after raising the limit");
    }

    #[tokio::test]
    async fn reindex_copies_every_document() {
        let store = Store::new();
        store
            .index_document("traces", Some("1"), doc(json!({ "x": 1 })))
            .await
            .expect("index should succeed");
        let task = store
            .start_reindex("traces", "backup_traces")
            .await
            .expect("reindex should start");
        assert_eq!(
            store.reindex_status(&task).await.expect("task should be known"),
            ReindexStatus::Completed { copied: 1 }
        );
        assert_eq!(store.count("backup_traces").await.unwrap_or(0), 1);
    }
}
