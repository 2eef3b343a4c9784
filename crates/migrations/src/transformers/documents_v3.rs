//! Document store 2 -> 3: sessions become activities.

use std::collections::BTreeMap;

use analytics_storage::{Filter, document_id};
use tracing::info;

use crate::{
    classify::backup_name,
    config::MigrationConfig,
    error::PhaseError,
    transformer::{Transformer, TransformerDescriptor},
    transformers::{
        collections::{backup_collections, drop_backups, restore_collections},
        documents_v2::{CLASSES, SESSIONS},
    },
    version::StoreKind,
};

pub const ACTIVITIES: &str = "activities";
/// Class fields made redundant once classes can span several games.
/// Activities keep theirs: they are the activity's own game and version.
const CLASS_GAME_FIELDS: [&str; 2] = ["gameId", "versionId"];

#[derive(Debug)]
pub struct SessionsToActivities {
    descriptor: TransformerDescriptor,
}

impl Default for SessionsToActivities {
    fn default() -> Self {
        Self {
            descriptor: TransformerDescriptor::new(StoreKind::Documents, 2, 3),
        }
    }
}

#[async_trait::async_trait]
impl Transformer for SessionsToActivities {
    fn descriptor(&self) -> &TransformerDescriptor {
        &self.descriptor
    }

    async fn backup(&self, config: &mut MigrationConfig) -> Result<(), PhaseError> {
        let touched = [
            CLASSES.to_owned(),
            SESSIONS.to_owned(),
            ACTIVITIES.to_owned(),
        ];
        config.state.collections =
            backup_collections(&config.documents, self.descriptor.origin, &touched).await?;
        Ok(())
    }

    async fn upgrade(&self, config: &mut MigrationConfig) -> Result<(), PhaseError> {
        let documents = &config.documents;
        let mut stripped = 0u64;
        for mut class in documents.find_all(CLASSES).await? {
            let before = class.len();
            for field in CLASS_GAME_FIELDS {
                class.remove(field);
            }
            if class.len() != before {
                documents.replace(CLASSES, class).await?;
                stripped += 1;
            }
        }
        info!(stripped, "Removed game references from classes");

        if documents.collection_exists(SESSIONS).await? {
            documents.rename_collection(SESSIONS, ACTIVITIES).await?;
            info!("Renamed {SESSIONS} to {ACTIVITIES}");
        }
        Ok(())
    }

    async fn check(&self, config: &mut MigrationConfig) -> Result<(), PhaseError> {
        let documents = &config.documents;
        for field in CLASS_GAME_FIELDS {
            if let Some(class) = documents.find_one(CLASSES, &Filter::exists(field)).await? {
                return Err(PhaseError::postcondition(format!(
                    "class {} still carries {field}",
                    document_id(&class).unwrap_or_default()
                )));
            }
        }
        if documents.collection_exists(SESSIONS).await? {
            return Err(PhaseError::postcondition(format!(
                "{SESSIONS} still exists after the rename"
            )));
        }
        let had_sessions = config
            .state
            .collections
            .backed_up
            .iter()
            .any(|name| name == SESSIONS);
        if !had_sessions {
            return Ok(());
        }
        if !documents.collection_exists(ACTIVITIES).await? {
            return Err(PhaseError::postcondition(format!(
                "{ACTIVITIES} is missing after the rename"
            )));
        }

        let backed_up = documents
            .find_all(&backup_name(self.descriptor.origin, SESSIONS))
            .await?;
        let sessions: BTreeMap<&str, _> = backed_up
            .iter()
            .filter_map(|session| document_id(session).map(|id| (id, session)))
            .collect();
        let activities = documents.find_all(ACTIVITIES).await?;
        if activities.len() != sessions.len() {
            return Err(PhaseError::postcondition(format!(
                "{} activities for {} sessions",
                activities.len(),
                sessions.len()
            )));
        }
        for activity in &activities {
            let id = document_id(activity).unwrap_or_default();
            let Some(session) = sessions.get(id) else {
                return Err(PhaseError::postcondition(format!(
                    "activity {id} has no matching session"
                )));
            };
            for field in CLASS_GAME_FIELDS {
                if activity.get(field) != session.get(field) {
                    return Err(PhaseError::postcondition(format!(
                        "activity {id} does not keep the {field} of its session"
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

#[cfg(test)]
mod tests {
    use analytics_storage::{Document, DocumentStore, SearchStore};
    use serde_json::{Value, json};

    use super::*;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn seeded() -> MigrationConfig {
        let config = MigrationConfig::new(DocumentStore::in_memory(), SearchStore::in_memory());
        config
            .documents
            .insert(
                CLASSES,
                doc(json!({ "_id": "c1", "name": "A", "gameId": "g", "versionId": "v" })),
            )
            .await
            .expect("seed class");
        config
            .documents
            .insert(
                SESSIONS,
                doc(json!({ "_id": "s1", "classId": "c1", "gameId": "g", "versionId": "v" })),
            )
            .await
            .expect("seed session");
        config
    }

    #[tokio::test]
    async fn classes_lose_game_fields_and_sessions_are_renamed() {
        let mut config = seeded().await;
        let transformer = SessionsToActivities::default();
        transformer.backup(&mut config).await.expect("backup");
        transformer.upgrade(&mut config).await.expect("upgrade");
        transformer.check(&mut config).await.expect("check");

        let class = &config.documents.find_all(CLASSES).await.expect("read")[0];
        assert!(class.get("gameId").is_none());
        assert!(class.get("versionId").is_none());
        let activities = config.documents.find_all(ACTIVITIES).await.expect("read");
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0]["gameId"], "g");
        assert!(!config.documents.collection_exists(SESSIONS).await.expect("exists"));

        transformer.clean(&mut config).await.expect("clean");
        let collections = config.documents.list_collections().await.expect("list");
        assert_eq!(collections, vec![ACTIVITIES.to_owned(), CLASSES.to_owned()]);
    }

    #[tokio::test]
    async fn check_rejects_activities_that_lost_their_game() {
        let mut config = seeded().await;
        let transformer = SessionsToActivities::default();
        transformer.backup(&mut config).await.expect("backup");
        transformer.upgrade(&mut config).await.expect("upgrade");
        config
            .documents
            .replace(ACTIVITIES, doc(json!({ "_id": "s1", "classId": "c1" })))
            .await
            .expect("drop game fields");

        let err = transformer.check(&mut config).await.expect_err("gameId lost");
        assert!(err.to_string().contains("activity s1"));
    }

    #[tokio::test]
    async fn restore_undoes_the_rename() {
        let mut config = seeded().await;
        let transformer = SessionsToActivities::default();
        transformer.backup(&mut config).await.expect("backup");
        transformer.upgrade(&mut config).await.expect("upgrade");
        transformer.restore(&mut config).await.expect("restore");

        assert!(config.documents.collection_exists(SESSIONS).await.expect("exists"));
        assert!(!config.documents.collection_exists(ACTIVITIES).await.expect("exists"));
        let class = &config.documents.find_all(CLASSES).await.expect("read")[0];
        assert_eq!(class["gameId"], "g");
    }
}
