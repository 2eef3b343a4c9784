use std::{path::Path, sync::Arc};

use tracing::info;

use crate::{
    api::{Document, DocumentEngine},
    error::StoreError,
    filter::Filter,
    retry::{RetryPolicy, retry_async},
    store_db::in_memory::Store as InMemoryStore,
};
#[cfg(feature = "sql")]
use crate::store_db::sql::SQLStore;

/// Retrying handle over a document engine. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    engine: Arc<dyn DocumentEngine>,
    retry: RetryPolicy,
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self {
            engine: Arc::new(InMemoryStore::new()),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineType {
    InMemory,
    #[cfg(feature = "sql")]
    SQL,
}

impl DocumentStore {
    pub async fn new(_path: &Path, engine_type: EngineType) -> Result<Self, StoreError> {
        info!("Starting document storage engine ({engine_type:?})");
        let store = match engine_type {
            EngineType::InMemory => Self::default(),
            #[cfg(feature = "sql")]
            EngineType::SQL => Self::with_engine(Arc::new(SQLStore::open(_path).await?)),
        };
        info!("Started document store engine");
        Ok(store)
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_engine(engine: Arc<dyn DocumentEngine>) -> Self {
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

    pub async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        retry_async(&self.retry, "list_collections", || {
            self.engine.list_collections()
        })
        .await
    }

    pub async fn collection_exists(&self, collection: &str) -> Result<bool, StoreError> {
        retry_async(&self.retry, "collection_exists", || {
            self.engine.collection_exists(collection)
        })
        .await
    }

    pub async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        retry_async(&self.retry, "find", || self.engine.find(collection, filter)).await
    }

    pub async fn find_all(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        self.find(collection, &Filter::All).await
    }

    pub async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError> {
        Ok(self.find(collection, filter).await?.into_iter().next())
    }

    pub async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        Ok(self.find(collection, filter).await?.len() as u64)
    }

    pub async fn insert(&self, collection: &str, document: Document) -> Result<String, StoreError> {
        retry_async(&self.retry, "insert", || {
            self.engine.insert(collection, document.clone())
        })
        .await
    }

    pub async fn replace(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        retry_async(&self.retry, "replace", || {
            self.engine.replace(collection, document.clone())
        })
        .await
    }

    pub async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        retry_async(&self.retry, "delete", || self.engine.delete(collection, id)).await
    }

    pub async fn rename_collection(&self, from: &str, to: &str) -> Result<(), StoreError> {
        retry_async(&self.retry, "rename_collection", || {
            self.engine.rename_collection(from, to)
        })
        .await
    }

    pub async fn drop_collection(&self, collection: &str) -> Result<(), StoreError> {
        retry_async(&self.retry, "drop_collection", || {
            self.engine.drop_collection(collection)
        })
        .await
    }

    pub async fn copy_collection(&self, from: &str, to: &str) -> Result<u64, StoreError> {
        retry_async(&self.retry, "copy_collection", || {
            self.engine.copy_collection(from, to)
        })
        .await
    }
}
