//! Backup and restore of document collections by copy.

use analytics_storage::{DocumentStore, StoreError};
use tracing::{debug, info, warn};

use crate::{
    classify::{BACKUP_PREFIX, backup_name},
    version::SchemaVersion,
};

/// Which of the touched collections existed when the backup was taken.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionSnapshot {
    /// Have a `backup_v<origin>_<name>` copy.
    pub backed_up: Vec<String>,
    /// Copied by this run. The rest of `backed_up` was kept from an earlier run.
    pub created: Vec<String>,
    /// Did not exist; `restore` drops them if `upgrade` created them.
    pub absent: Vec<String>,
}

/// Copies every existing collection in `touched` to `backup_v<origin>_<name>`.
///
/// A copy with the same origin left behind by an earlier failed run is kept
/// as is: it holds the state from before that run, which is the state to
/// restore. When a copy fails, the copies made by this call are dropped again
/// and the earlier ones are left alone.
pub async fn backup_collections(
    store: &DocumentStore,
    origin: SchemaVersion,
    touched: &[String],
) -> Result<CollectionSnapshot, StoreError> {
    let mut snapshot = CollectionSnapshot::default();
    match copy_collections(store, origin, touched, &mut snapshot).await {
        Ok(()) => Ok(snapshot),
        Err(error) => {
            for collection in &snapshot.created {
                let backup = backup_name(origin, collection);
                if let Err(drop_error) = drop_if_exists(store, &backup).await {
                    warn!(%backup, error = %drop_error, "Could not drop partial backup");
                }
            }
            Err(error)
        }
    }
}

async fn copy_collections(
    store: &DocumentStore,
    origin: SchemaVersion,
    touched: &[String],
    snapshot: &mut CollectionSnapshot,
) -> Result<(), StoreError> {
    for collection in touched {
        let backup = backup_name(origin, collection);
        if store.collection_exists(&backup).await? {
            info!(%collection, %backup, "Backup already present, keeping it");
            snapshot.backed_up.push(collection.clone());
            continue;
        }
        if !store.collection_exists(collection).await? {
            debug!(%collection, "Nothing to back up");
            snapshot.absent.push(collection.clone());
            continue;
        }
        // recorded first so a copy that fails half way is dropped too
        snapshot.created.push(collection.clone());
        let copied = store.copy_collection(collection, &backup).await?;
        info!(%collection, %backup, copied, "Backed up collection");
        snapshot.backed_up.push(collection.clone());
    }
    Ok(())
}

/// Puts every backup back in place of its collection and drops collections
/// that did not exist before. Running it twice is harmless.
pub async fn restore_collections(
    store: &DocumentStore,
    origin: SchemaVersion,
    snapshot: &CollectionSnapshot,
) -> Result<(), StoreError> {
    for collection in &snapshot.backed_up {
        let backup = backup_name(origin, collection);
        if !store.collection_exists(&backup).await? {
            debug!(%collection, "No backup to restore");
            continue;
        }
        drop_if_exists(store, collection).await?;
        store.rename_collection(&backup, collection).await?;
        info!(%collection, "Restored collection from backup");
    }
    for collection in &snapshot.absent {
        if drop_if_exists(store, collection).await? {
            info!(%collection, "Dropped collection created by the failed upgrade");
        }
    }
    Ok(())
}

/// Drops the backups listed in `snapshot`.
pub async fn drop_backups(
    store: &DocumentStore,
    origin: SchemaVersion,
    snapshot: &CollectionSnapshot,
) -> Result<(), StoreError> {
    for collection in &snapshot.backed_up {
        drop_if_exists(store, &backup_name(origin, collection)).await?;
    }
    Ok(())
}

/// Collections in the store whose name starts with `prefix`, backups excluded.
pub async fn collections_with_prefix(
    store: &DocumentStore,
    prefix: &str,
) -> Result<Vec<String>, StoreError> {
    Ok(store
        .list_collections()
        .await?
        .into_iter()
        .filter(|name| name.starts_with(prefix) && !name.starts_with(BACKUP_PREFIX))
        .collect())
}

pub async fn drop_if_exists(store: &DocumentStore, collection: &str) -> Result<bool, StoreError> {
    match store.drop_collection(collection).await {
        Ok(()) => Ok(true),
        Err(error) if error.is_not_found() => Ok(false),
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use analytics_storage::{Document, DocumentEngine, Filter, InMemoryDocuments, RetryPolicy};
    use serde_json::json;

    use super::*;

    /// In-memory engine that refuses to copy one collection.
    #[derive(Debug)]
    struct FailingCopy {
        inner: InMemoryDocuments,
        refused: &'static str,
    }

    #[async_trait::async_trait]
    impl DocumentEngine for FailingCopy {
        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }
        async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
            self.inner.list_collections().await
        }
        async fn collection_exists(&self, collection: &str) -> Result<bool, StoreError> {
            self.inner.collection_exists(collection).await
        }
        async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
            self.inner.find(collection, filter).await
        }
        async fn insert(&self, collection: &str, document: Document) -> Result<String, StoreError> {
            self.inner.insert(collection, document).await
        }
        async fn replace(&self, collection: &str, document: Document) -> Result<(), StoreError> {
            self.inner.replace(collection, document).await
        }
        async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
            self.inner.delete(collection, id).await
        }
        async fn rename_collection(&self, from: &str, to: &str) -> Result<(), StoreError> {
            self.inner.rename_collection(from, to).await
        }
        async fn drop_collection(&self, collection: &str) -> Result<(), StoreError> {
            self.inner.drop_collection(collection).await
        }
        async fn copy_collection(&self, from: &str, to: &str) -> Result<u64, StoreError> {
            if from == self.refused {
                // leave a partial copy behind, like an interrupted copy would
                self.inner
                    .insert(to, record(json!({ "_id": "partial" })))
                    .await?;
                return Err(StoreError::Custom(format!("copy of {from} interrupted")));
            }
            self.inner.copy_collection(from, to).await
        }
    }

    const ORIGIN: SchemaVersion = SchemaVersion(1);

    fn record(value: serde_json::Value) -> analytics_storage::Document {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn restore_is_idempotent_and_drops_created_collections() {
        let store = DocumentStore::in_memory();
        store
            .insert("classes", record(json!({ "_id": "c1", "name": "before" })))
            .await
            .expect("seed");

        let touched = vec!["classes".to_owned(), "groups".to_owned()];
        let snapshot = backup_collections(&store, ORIGIN, &touched)
            .await
            .expect("backup");
        assert_eq!(snapshot.backed_up, vec!["classes".to_owned()]);
        assert_eq!(snapshot.absent, vec!["groups".to_owned()]);

        let mutated = record(json!({ "_id": "c1", "name": "after" }));
        store.replace("classes", mutated.clone()).await.expect("mutate");
        store.insert("groups", mutated).await.expect("create");

        restore_collections(&store, ORIGIN, &snapshot)
            .await
            .expect("restore");
        restore_collections(&store, ORIGIN, &snapshot)
            .await
            .expect("second restore");

        let classes = store.find_all("classes").await.expect("read");
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0]["name"], "before");
        assert!(!store.collection_exists("groups").await.expect("exists"));
        assert!(!store.collection_exists("backup_v1_classes").await.expect("exists"));
    }

    #[tokio::test]
    async fn backups_of_an_earlier_step_are_not_reused() {
        let store = DocumentStore::in_memory();
        store
            .insert("classes", record(json!({ "_id": "c1", "name": "v2 state" })))
            .await
            .expect("seed");
        // left behind by a 1 -> 2 step whose clean failed
        store
            .insert("backup_v1_classes", record(json!({ "_id": "c1", "name": "v1 state" })))
            .await
            .expect("stale backup");

        let touched = vec!["classes".to_owned()];
        let snapshot = backup_collections(&store, SchemaVersion(2), &touched)
            .await
            .expect("backup");
        assert_eq!(snapshot.created, touched);

        store
            .replace("classes", record(json!({ "_id": "c1", "name": "v3 state" })))
            .await
            .expect("mutate");
        restore_collections(&store, SchemaVersion(2), &snapshot)
            .await
            .expect("restore");

        let classes = store.find_all("classes").await.expect("read");
        assert_eq!(classes[0]["name"], "v2 state");
        assert!(store.collection_exists("backup_v1_classes").await.expect("exists"));
    }

    #[tokio::test]
    async fn kept_backups_are_not_counted_as_created() {
        let store = DocumentStore::in_memory();
        store
            .insert("classes", record(json!({ "_id": "c1", "name": "after" })))
            .await
            .expect("seed");
        store
            .insert("backup_v1_classes", record(json!({ "_id": "c1", "name": "before" })))
            .await
            .expect("backup from a failed run");

        let touched = vec!["classes".to_owned()];
        let snapshot = backup_collections(&store, ORIGIN, &touched)
            .await
            .expect("backup");
        assert_eq!(snapshot.backed_up, touched);
        assert!(snapshot.created.is_empty());
        let kept = store.find_all("backup_v1_classes").await.expect("read");
        assert_eq!(kept[0]["name"], "before");
    }

    #[tokio::test]
    async fn failed_backup_drops_only_its_own_copies() {
        let store = DocumentStore::with_engine(Arc::new(FailingCopy {
            inner: InMemoryDocuments::default(),
            refused: "sessions",
        }))
        .with_retry_policy(RetryPolicy::no_retry());
        for collection in ["activities", "classes", "sessions"] {
            store
                .insert(collection, record(json!({ "_id": "x", "name": "after" })))
                .await
                .expect("seed");
        }
        // the only copy of the state before an earlier, interrupted run
        store
            .insert("backup_v1_activities", record(json!({ "_id": "x", "name": "before" })))
            .await
            .expect("earlier backup");

        let touched = ["activities", "classes", "sessions"].map(str::to_owned);
        backup_collections(&store, ORIGIN, &touched)
            .await
            .expect_err("sessions copy fails");

        let collections = store.list_collections().await.expect("list");
        assert!(collections.contains(&"backup_v1_activities".to_owned()));
        assert!(!collections.contains(&"backup_v1_classes".to_owned()));
        assert!(!collections.contains(&"backup_v1_sessions".to_owned()));
        let kept = store.find_all("backup_v1_activities").await.expect("read");
        assert_eq!(kept[0]["name"], "before");
    }
}
