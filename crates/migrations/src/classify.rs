//! Search index naming protocol and classification.

use analytics_storage::{DocumentStore, Filter, ID_FIELD, StoreError};
use serde::Serialize;

use crate::version::SchemaVersion;

pub const BACKUP_PREFIX: &str = "backup_";
pub const UPGRADE_PREFIX: &str = "upgrade_";
pub const RESULTS_PREFIX: &str = "results-";
pub const OPAQUE_VALUES_PREFIX: &str = "opaque-values-";
pub const ROOT_PREFIX: &str = "analytics-";
pub const GAMES_DASHBOARD_PREFIX: &str = ".games";
pub const KIBANA_INDEX: &str = ".kibana";
pub const TEMPLATE_PREFIX: &str = ".template";
pub const DEFAULT_INDEX: &str = "default";
pub const TO_DELETE_INDEX: &str = ".to-delete";
/// Holds the search store's own version record.
pub const VERSION_INDEX: &str = ".analytics-config";

/// Prefix of the copies taken by the transformer that starts at `origin`.
///
/// Copies are scoped by origin so a copy left behind by an earlier step is
/// never mistaken for the current step's.
pub fn backup_prefix(origin: SchemaVersion) -> String {
    format!("{BACKUP_PREFIX}v{origin}_")
}

pub fn backup_name(origin: SchemaVersion, name: &str) -> String {
    format!("{}{name}", backup_prefix(origin))
}

pub fn upgrade_name(index: &str) -> String {
    format!("{UPGRADE_PREFIX}{index}")
}

pub fn results_name(index: &str) -> String {
    format!("{RESULTS_PREFIX}{index}")
}

pub fn opaque_values_name(index: &str) -> String {
    format!("{OPAQUE_VALUES_PREFIX}{index}")
}

pub fn root_marker_name(index: &str) -> String {
    format!("{ROOT_PREFIX}{index}")
}

/// Temporary copies made by a migration run.
pub fn is_migration_artifact(index: &str) -> bool {
    index.starts_with(BACKUP_PREFIX) || index.starts_with(UPGRADE_PREFIX)
}

/// Indices that never hold per-activity traces.
pub fn is_system_index(index: &str) -> bool {
    index.starts_with('.')
        || index == DEFAULT_INDEX
        || is_migration_artifact(index)
        || index.starts_with(RESULTS_PREFIX)
        || index.starts_with(OPAQUE_VALUES_PREFIX)
        || index.starts_with(ROOT_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexClass {
    Trace,
    Version,
    Results,
    OpaqueValues,
    Config,
    GamesDashboard,
    Other,
}

impl IndexClass {
    /// Classes whose documents get their extra fields relocated under `ext`.
    pub fn holds_traces(self) -> bool {
        matches!(self, Self::Trace | Self::Version)
    }
}

/// Classification decided purely by name, `None` when the document store must be consulted.
pub fn classify_by_name(index: &str) -> Option<IndexClass> {
    if index.starts_with(RESULTS_PREFIX) {
        return Some(IndexClass::Results);
    }
    if index.starts_with(OPAQUE_VALUES_PREFIX) {
        return Some(IndexClass::OpaqueValues);
    }
    if index.starts_with(GAMES_DASHBOARD_PREFIX) {
        return Some(IndexClass::GamesDashboard);
    }
    if index.starts_with('.') || index == DEFAULT_INDEX || index.starts_with(TEMPLATE_PREFIX) {
        return Some(IndexClass::Config);
    }
    if is_migration_artifact(index) || index.starts_with(ROOT_PREFIX) {
        return Some(IndexClass::Other);
    }
    None
}

/// Activity records live in `sessions` before document version 3 and in `activities` after.
const ACTIVITY_COLLECTIONS: [&str; 2] = ["activities", "sessions"];
const VERSION_COLLECTION: &str = "versions";

pub async fn classify(index: &str, documents: &DocumentStore) -> Result<IndexClass, StoreError> {
    if let Some(class) = classify_by_name(index) {
        return Ok(class);
    }
    let by_id = Filter::eq(ID_FIELD, index);
    for collection in ACTIVITY_COLLECTIONS {
        if documents.find_one(collection, &by_id).await?.is_some() {
            return Ok(IndexClass::Trace);
        }
    }
    if documents
        .find_one(VERSION_COLLECTION, &by_id)
        .await?
        .is_some()
    {
        return Ok(IndexClass::Version);
    }
    Ok(IndexClass::Other)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn system_prefixes_classify_without_probing() {
        assert_eq!(classify_by_name("results-abc"), Some(IndexClass::Results));
        assert_eq!(
            classify_by_name("opaque-values-abc"),
            Some(IndexClass::OpaqueValues)
        );
        assert_eq!(
            classify_by_name(".games42"),
            Some(IndexClass::GamesDashboard)
        );
        assert_eq!(classify_by_name(".kibana"), Some(IndexClass::Config));
        assert_eq!(classify_by_name("default"), Some(IndexClass::Config));
        assert_eq!(classify_by_name("abc"), None);
    }

    #[tokio::test]
    async fn unknown_indices_are_looked_up_in_the_document_store() {
        let documents = DocumentStore::in_memory();
        let record = |id: &str| json!({ "_id": id }).as_object().cloned().unwrap_or_default();
        documents
            .insert("sessions", record("s1"))
            .await
            .expect("insert session");
        documents
            .insert("versions", record("v1"))
            .await
            .expect("insert version");

        assert_eq!(
            classify("s1", &documents).await.expect("classify"),
            IndexClass::Trace
        );
        assert_eq!(
            classify("v1", &documents).await.expect("classify"),
            IndexClass::Version
        );
        assert_eq!(
            classify("stray", &documents).await.expect("classify"),
            IndexClass::Other
        );
    }

    #[test]
    fn consolidation_candidates_exclude_system_indices() {
        assert!(is_system_index(".kibana"));
        assert!(is_system_index("backup_idx1"));
        assert!(is_system_index(&backup_name(SchemaVersion(1), "idx1")));
        assert_eq!(backup_name(SchemaVersion(2), "classes"), "backup_v2_classes");
        assert!(is_system_index("results-idx1"));
        assert!(is_system_index("analytics-idx1"));
        assert!(!is_system_index("idx1"));
    }
}
