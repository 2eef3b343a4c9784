//! Document store 1 -> 2: every session belongs to a class.

use std::collections::BTreeSet;

use analytics_storage::{Document, document_id};
use serde_json::{Value, json};
use tracing::info;

use crate::{
    config::MigrationConfig,
    error::PhaseError,
    transformer::{Transformer, TransformerDescriptor},
    transformers::collections::{backup_collections, drop_backups, restore_collections},
    version::StoreKind,
};

pub const SESSIONS: &str = "sessions";
pub const CLASSES: &str = "classes";
const CLASS_ID: &str = "classId";

#[derive(Debug)]
pub struct SessionClasses {
    descriptor: TransformerDescriptor,
}

impl Default for SessionClasses {
    fn default() -> Self {
        Self {
            descriptor: TransformerDescriptor::new(StoreKind::Documents, 1, 2),
        }
    }
}

fn has_class(session: &Document) -> bool {
    session.get(CLASS_ID).is_some_and(|id| !id.is_null())
}

fn list_or_empty(document: &Document, field: &str) -> Value {
    match document.get(field) {
        Some(Value::Array(values)) => Value::Array(values.clone()),
        _ => json!([]),
    }
}

/// Class synthesized for a session that predates classes.
pub fn automatic_class(session: &Document) -> Document {
    let name = session
        .get("name")
        .and_then(Value::as_str)
        .or_else(|| document_id(session))
        .unwrap_or_default();
    let teachers = list_or_empty(session, "teachers");
    let mut class = Document::new();
    class.insert("name".to_owned(), json!(format!("Automatic Class ({name})")));
    for key in ["gameId", "versionId"] {
        if let Some(value) = session.get(key) {
            class.insert(key.to_owned(), value.clone());
        }
    }
    class.insert("authors".to_owned(), teachers.clone());
    class.insert("teachers".to_owned(), teachers);
    class.insert("students".to_owned(), list_or_empty(session, "students"));
    class.insert(
        "created".to_owned(),
        json!(chrono::Utc::now().to_rfc3339()),
    );
    class
}

#[async_trait::async_trait]
impl Transformer for SessionClasses {
    fn descriptor(&self) -> &TransformerDescriptor {
        &self.descriptor
    }

    async fn backup(&self, config: &mut MigrationConfig) -> Result<(), PhaseError> {
        let touched = [SESSIONS.to_owned(), CLASSES.to_owned()];
        config.state.collections =
            backup_collections(&config.documents, self.descriptor.origin, &touched).await?;
        Ok(())
    }

    async fn upgrade(&self, config: &mut MigrationConfig) -> Result<(), PhaseError> {
        let documents = &config.documents;
        let mut created = 0u64;
        for mut session in documents.find_all(SESSIONS).await? {
            if has_class(&session) {
                continue;
            }
            let class_id = documents.insert(CLASSES, automatic_class(&session)).await?;
            session.insert(CLASS_ID.to_owned(), json!(class_id));
            documents.replace(SESSIONS, session).await?;
            created += 1;
        }
        info!(created, "Synthesized classes for legacy sessions");
        Ok(())
    }

    async fn check(&self, config: &mut MigrationConfig) -> Result<(), PhaseError> {
        let class_ids: BTreeSet<String> = config
            .documents
            .find_all(CLASSES)
            .await?
            .iter()
            .filter_map(|class| document_id(class).map(str::to_owned))
            .collect();
        for session in config.documents.find_all(SESSIONS).await? {
            let id = document_id(&session).unwrap_or_default();
            match session.get(CLASS_ID).and_then(Value::as_str) {
                Some(class_id) if class_ids.contains(class_id) => {}
                Some(class_id) => {
                    return Err(PhaseError::postcondition(format!(
                        "session {id} points to missing class {class_id}"
                    )));
                }
                None => {
                    return Err(PhaseError::postcondition(format!(
                        "session {id} has no class"
                    )));
                }
            }
        }
        Ok(())
    }

    async fn clean(&self, config: &mut MigrationConfig) -> Result<(), PhaseError> {
        drop_backups(
            &config.documents,
            self.descriptor.origin,
            &config.state.collections,
        )
        .await?;
        Ok(())
    }

    async fn restore(&self, config: &mut MigrationConfig) -> Result<(), PhaseError> {
        restore_collections(
            &config.documents,
            self.descriptor.origin,
            &config.state.collections,
        )
        .await?;
        Ok(())
    }
}
