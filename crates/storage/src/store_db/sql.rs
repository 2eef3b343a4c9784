use std::{fmt::Debug, path::Path, sync::Arc, time::Duration};
use tokio::sync::Mutex;

use libsql::{Builder, Connection, Row, Value as SqlValue, params::IntoParams};
use serde_json::Value;

use crate::{
    api::{Document, DocumentEngine, document_id},
    error::StoreError,
    filter::Filter,
    store_db::in_memory::ensure_id,
};

/// ### SQLStore
/// - `read_conn`: a connection to the database to be used for read only statements
/// - `write_conn`: a connection to the database to be used for writing, protected by a Mutex to enforce a maximum of 1 writer.
///   If writes are done using the read only connection `SQLite failure: database is locked` problems will arise
pub struct SQLStore {
    read_conn: Connection,
    write_conn: Arc<Mutex<Connection>>,
}

impl Debug for SQLStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SQLStore")
    }
}

const DB_SCHEMA: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS collections (name TEXT PRIMARY KEY)",
    "CREATE TABLE IF NOT EXISTS documents (collection TEXT NOT NULL, id TEXT NOT NULL, body TEXT NOT NULL, PRIMARY KEY (collection, id))",
];

impl SQLStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Builder::new_local(path).build().await?;
        let write_conn = db.connect()?;
        // Newly created connections default to a 5000ms busy timeout, set it explicitly
        write_conn.busy_timeout(Duration::from_millis(5000))?;
        let store = SQLStore {
            read_conn: db.connect()?,
            write_conn: Arc::new(Mutex::new(write_conn)),
        };
        store.init_db().await?;
        Ok(store)
    }

    async fn init_db(&self) -> Result<(), StoreError> {
        // WAL lets readers proceed while the single writer holds the lock
        self.read_conn
            .query("PRAGMA journal_mode=WAL;", ())
            .await?;
        let conn = self.write_conn.lock().await;
        let tx = conn.transaction().await?;
        for statement in DB_SCHEMA {
            tx.execute(statement, ()).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn execute<T: IntoParams>(&self, sql: &str, params: T) -> Result<u64, StoreError> {
        let conn = self.write_conn.lock().await;
        Ok(conn.execute(sql, params).await?)
    }

    async fn read_documents(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let mut rows = self
            .read_conn
            .query(
                "SELECT body FROM documents WHERE collection = ?1 ORDER BY id",
                vec![collection.to_owned()],
            )
            .await?;
        let mut documents = Vec::new();
        while let Some(row) = rows.next().await? {
            let body = read_from_row_text(&row, 0)?;
            match serde_json::from_str::<Value>(&body)? {
                Value::Object(document) => documents.push(document),
                other => {
                    return Err(StoreError::InvalidDocument(format!(
                        "stored body in {collection} is not an object: {other}"
                    )));
                }
            }
        }
        Ok(documents)
    }

    async fn register_collection(&self, collection: &str) -> Result<(), StoreError> {
        self.execute(
            "INSERT INTO collections VALUES (?1) ON CONFLICT(name) DO NOTHING",
            vec![collection.to_owned()],
        )
        .await?;
        Ok(())
    }
}

fn read_from_row_text(row: &Row, index: i32) -> Result<String, StoreError> {
    match row.get_value(index)? {
        SqlValue::Text(s) => Ok(s),
        _ => Err(StoreError::SQLInvalidTypeError),
    }
}

#[async_trait::async_trait]
impl DocumentEngine for SQLStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.read_conn.query("SELECT 1", ()).await?;
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let mut rows = self
            .read_conn
            .query("SELECT name FROM collections ORDER BY name", ())
            .await?;
        let mut names = Vec::new();
        while let Some(row) = rows.next().await? {
            names.push(read_from_row_text(&row, 0)?);
        }
        Ok(names)
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool, StoreError> {
        let mut rows = self
            .read_conn
            .query(
                "SELECT name FROM collections WHERE name = ?1",
                vec![collection.to_owned()],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        let documents = self.read_documents(collection).await?;
        Ok(documents
            .into_iter()
            .filter(|document| filter.matches(document))
            .collect())
    }

    async fn insert(&self, collection: &str, mut document: Document) -> Result<String, StoreError> {
        let id = ensure_id(&mut document)?;
        let body = serde_json::to_string(&document)?;
        self.register_collection(collection).await?;
        let result = self
            .execute(
                "INSERT INTO documents VALUES (?1, ?2, ?3)",
                (collection.to_owned(), id.clone(), body),
            )
            .await;
        match result {
            Ok(_) => Ok(id),
            Err(StoreError::SQL(error)) if error.to_string().contains("UNIQUE") => {
                Err(StoreError::AlreadyExists {
                    kind: "document",
                    name: format!("{collection}/{id}"),
                })
            }
            Err(error) => Err(error),
        }
    }

    async fn replace(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        let id = document_id(&document)
            .ok_or_else(|| StoreError::InvalidDocument("replace requires an `_id`".to_owned()))?
            .to_owned();
        let body = serde_json::to_string(&document)?;
        self.register_collection(collection).await?;
        self.execute(
            "INSERT OR REPLACE INTO documents VALUES (?1, ?2, ?3)",
            (collection.to_owned(), id, body),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let deleted = self
            .execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                (collection.to_owned(), id.to_owned()),
            )
            .await?;
        if deleted == 0 {
            return Err(StoreError::not_found("document", format!("{collection}/{id}")));
        }
        Ok(())
    }

    async fn rename_collection(&self, from: &str, to: &str) -> Result<(), StoreError> {
        if self.collection_exists(to).await? {
            return Err(StoreError::AlreadyExists {
                kind: "collection",
                name: to.to_owned(),
            });
        }
        if !self.collection_exists(from).await? {
            return Err(StoreError::not_found("collection", from));
        }
        let conn = self.write_conn.lock().await;
        let tx = conn.transaction().await?;
        tx.execute(
            "UPDATE documents SET collection = ?1 WHERE collection = ?2",
            (to.to_owned(), from.to_owned()),
        )
        .await?;
        tx.execute(
            "UPDATE collections SET name = ?1 WHERE name = ?2",
            (to.to_owned(), from.to_owned()),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), StoreError> {
        if !self.collection_exists(collection).await? {
            return Err(StoreError::not_found("collection", collection));
        }
        let conn = self.write_conn.lock().await;
        let tx = conn.transaction().await?;
        tx.execute(
            "DELETE FROM documents WHERE collection = ?1",
            vec![collection.to_owned()],
        )
        .await?;
        tx.execute(
            "DELETE FROM collections WHERE name = ?1",
            vec![collection.to_owned()],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn copy_collection(&self, from: &str, to: &str) -> Result<u64, StoreError> {
        if self.collection_exists(to).await? {
            return Err(StoreError::AlreadyExists {
                kind: "collection",
                name: to.to_owned(),
            });
        }
        if !self.collection_exists(from).await? {
            return Err(StoreError::not_found("collection", from));
        }
        let conn = self.write_conn.lock().await;
        let tx = conn.transaction().await?;
        tx.execute("INSERT INTO collections VALUES (?1)", vec![to.to_owned()])
            .await?;
        let copied = tx
            .execute(
                "INSERT INTO documents SELECT ?1, id, body FROM documents WHERE collection = ?2",
                (to.to_owned(), from.to_owned()),
            )
            .await?;
        tx.commit().await?;
        Ok(copied)
    }
}
