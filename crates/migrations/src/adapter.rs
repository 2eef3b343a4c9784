use analytics_storage::{Document, Filter, ID_FIELD, StoreError};
use serde_json::{Value, json};
use tracing::debug;

use crate::{
    classify::VERSION_INDEX,
    config::MigrationConfig,
    version::{INITIAL_VERSION, SchemaVersion, StoreKind},
};

/// Collection holding the document store's version record.
pub const VERSION_COLLECTION: &str = "config";
/// `_id` of the version record in both stores.
pub const VERSION_RECORD_ID: &str = "model_version";
const VERSION_FIELD: &str = "version";

/// Store-specific half of the driver.
#[async_trait::async_trait]
pub trait StoreAdapter: Send + Sync {
    fn kind(&self) -> StoreKind;

    async fn do_connect(&self, config: &MigrationConfig) -> Result<(), StoreError>;

    /// A store without a version record is at [`INITIAL_VERSION`].
    async fn get_model_version(&self, config: &MigrationConfig)
    -> Result<SchemaVersion, StoreError>;

    async fn set_model_version(
        &self,
        config: &MigrationConfig,
        version: SchemaVersion,
    ) -> Result<(), StoreError>;
}

fn version_from_record(record: &Document) -> Result<SchemaVersion, StoreError> {
    let raw = match record.get(VERSION_FIELD) {
        Some(Value::String(raw)) => raw.clone(),
        Some(Value::Number(raw)) => raw.to_string(),
        other => {
            return Err(StoreError::InvalidDocument(format!(
                "version record carries no version: {other:?}"
            )));
        }
    };
    raw.parse()
        .map_err(|e| StoreError::InvalidDocument(format!("{e}")))
}

fn version_record(version: SchemaVersion) -> Document {
    let mut record = Document::new();
    record.insert(VERSION_FIELD.to_owned(), json!(version.to_string()));
    record
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentStoreAdapter;

#[async_trait::async_trait]
impl StoreAdapter for DocumentStoreAdapter {
    fn kind(&self) -> StoreKind {
        StoreKind::Documents
    }

    async fn do_connect(&self, config: &MigrationConfig) -> Result<(), StoreError> {
        config.documents.ping().await
    }

    async fn get_model_version(
        &self,
        config: &MigrationConfig,
    ) -> Result<SchemaVersion, StoreError> {
        let record = config
            .documents
            .find_one(VERSION_COLLECTION, &Filter::eq(ID_FIELD, VERSION_RECORD_ID))
            .await?;
        match record {
            Some(record) => version_from_record(&record),
            None => {
                debug!("Document store has no version record");
                Ok(INITIAL_VERSION)
            }
        }
    }

    async fn set_model_version(
        &self,
        config: &MigrationConfig,
        version: SchemaVersion,
    ) -> Result<(), StoreError> {
        let mut record = version_record(version);
        record.insert(ID_FIELD.to_owned(), json!(VERSION_RECORD_ID));
        config.documents.replace(VERSION_COLLECTION, record).await
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SearchStoreAdapter;

#[async_trait::async_trait]
impl StoreAdapter for SearchStoreAdapter {
    fn kind(&self) -> StoreKind {
        StoreKind::Search
    }

    async fn do_connect(&self, config: &MigrationConfig) -> Result<(), StoreError> {
        config.search.ping().await
    }

    async fn get_model_version(
        &self,
        config: &MigrationConfig,
    ) -> Result<SchemaVersion, StoreError> {
        match config.search.get(VERSION_INDEX, VERSION_RECORD_ID).await {
            Ok(Some(hit)) => version_from_record(&hit.source),
            Ok(None) => Ok(INITIAL_VERSION),
            Err(error) if error.is_not_found() => {
                debug!("Search store has no version index");
                Ok(INITIAL_VERSION)
            }
            Err(error) => Err(error),
        }
    }

    async fn set_model_version(
        &self,
        config: &MigrationConfig,
        version: SchemaVersion,
    ) -> Result<(), StoreError> {
        config
            .search
            .index_document(
                VERSION_INDEX,
                Some(VERSION_RECORD_ID),
                version_record(version),
            )
            .await?;
        config.search.refresh(VERSION_INDEX).await
    }
}

/// Reads the version of any store, used to enforce cross-store requirements.
pub async fn read_model_version(
    store: StoreKind,
    config: &MigrationConfig,
) -> Result<SchemaVersion, StoreError> {
    match store {
        StoreKind::Documents => DocumentStoreAdapter.get_model_version(config).await,
        StoreKind::Search => SearchStoreAdapter.get_model_version(config).await,
    }
}
