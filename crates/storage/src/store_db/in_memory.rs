use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard},
};

use serde_json::Value;

use crate::{
    api::{Document, DocumentEngine, ID_FIELD, document_id},
    error::StoreError,
    filter::Filter,
};

#[derive(Default, Clone, Debug)]
pub struct Store(Arc<Mutex<StoreInner>>);

#[derive(Default, Debug)]
struct StoreInner {
    /// Map of collection name to documents keyed by `_id`
    collections: BTreeMap<String, BTreeMap<String, Document>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> Result<MutexGuard<'_, StoreInner>, StoreError> {
        self.0.lock().map_err(|_| StoreError::LockError)
    }
}

pub(crate) fn new_document_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub(crate) fn ensure_id(document: &mut Document) -> Result<String, StoreError> {
    match document.get(ID_FIELD) {
        Some(Value::String(id)) => Ok(id.clone()),
        Some(other) => Err(StoreError::InvalidDocument(format!(
            "`_id` must be a string, got {other}"
        ))),
        None => {
            let id = new_document_id();
            document.insert(ID_FIELD.to_owned(), Value::String(id.clone()));
            Ok(id)
        }
    }
}

#[async_trait::async_trait]
impl DocumentEngine for Store {
    async fn ping(&self) -> Result<(), StoreError> {
        self.inner().map(|_| ())
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner()?.collections.keys().cloned().collect())
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool, StoreError> {
        Ok(self.inner()?.collections.contains_key(collection))
    }

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        let inner = self.inner()?;
        let Some(documents) = inner.collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(documents
            .values()
            .filter(|document| filter.matches(document))
            .cloned()
            .collect())
    }

    async fn insert(&self, collection: &str, mut document: Document) -> Result<String, StoreError> {
        let id = ensure_id(&mut document)?;
        let mut inner = self.inner()?;
        let documents = inner.collections.entry(collection.to_owned()).or_default();
        if documents.contains_key(&id) {
            return Err(StoreError::AlreadyExists {
                kind: "document",
                name: format!("{collection}/{id}"),
            });
        }
        documents.insert(id.clone(), document);
        Ok(id)
    }

    async fn replace(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        let id = document_id(&document)
            .ok_or_else(|| StoreError::InvalidDocument("replace requires an `_id`".to_owned()))?
            .to_owned();
        self.inner()?
            .collections
            .entry(collection.to_owned())
            .or_default()
            .insert(id, document);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner()?;
        inner
            .collections
            .get_mut(collection)
            .and_then(|documents| documents.remove(id))
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("document", format!("{collection}/{id}")))
    }

    async fn rename_collection(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let mut inner = self.inner()?;
        if inner.collections.contains_key(to) {
            return Err(StoreError::AlreadyExists {
                kind: "collection",
                name: to.to_owned(),
            });
        }
        let documents = inner
            .collections
            .remove(from)
            .ok_or_else(|| StoreError::not_found("collection", from))?;
        inner.collections.insert(to.to_owned(), documents);
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), StoreError> {
        self.inner()?
            .collections
            .remove(collection)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("collection", collection))
    }

    async fn copy_collection(&self, from: &str, to: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner()?;
        if inner.collections.contains_key(to) {
            return Err(StoreError::AlreadyExists {
                kind: "collection",
                name: to.to_owned(),
            });
        }
        let documents = inner
            .collections
            .get(from)
            .cloned()
            .ok_or_else(|| StoreError::not_found("collection", from))?;
        let copied = documents.len() as u64;
        inner.collections.insert(to.to_owned(), documents);
        Ok(copied)
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
    async fn insert_assigns_ids() {
        let store = Store::new();
        let id = store
            .insert("classes", doc(json!({ "name": "c" })))
            .await
            .expect("insert should succeed");
        let found = store
            .find("classes", &Filter::eq(ID_FIELD, id.clone()))
            .await
            .expect("find should succeed");
        assert_eq!(found.len(), 1);
        assert_eq!(document_id(&found[0]), Some(id.as_str()));
    }

    #[tokio::test]
    async fn rename_refuses_to_clobber() {
        let store = Store::new();
        store
            .insert("sessions", doc(json!({ "_id": "a" })))
            .await
            .expect("insert should succeed");
        store
            .insert("activities", doc(json!({ "_id": "b" })))
            .await
            .expect("insert should succeed");

        let result = store.rename_collection("sessions", "activities").await;
        assert!(matches!(result, Err(StoreError::AlreadyExists { .. })));
        assert!(store.collection_exists("sessions").await.unwrap_or(false));
    }

    #[tokio::test]
    async fn find_on_missing_collection_is_empty() {
        let store = Store::new();
        let found = store
            .find("nothing", &Filter::All)
            .await
            .expect("find should succeed");
        assert!(found.is_empty());
    }
}
