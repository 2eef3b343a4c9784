//! Search store 1 -> 2: every non-canonical trace field moves under `ext`.
//!
//! Nothing here is transactional. Each index is copied to `backup_v1_<name>`
//! before any write, rewritten documents are staged in `upgrade_<name>`,
//! and the staged copy is reindexed over the original at the end.

pub mod fields;
pub mod visualizations;

use std::collections::{BTreeMap, BTreeSet};

use analytics_storage::{DocumentStore, ScrollRequest, SearchStore};
use futures::future::{join_all, try_join_all};
use tracing::{debug, info, warn};

use crate::{
    classify::{
        IndexClass, KIBANA_INDEX, UPGRADE_PREFIX, VERSION_INDEX, backup_name, backup_prefix,
        classify, is_migration_artifact, upgrade_name,
    },
    config::MigrationConfig,
    error::PhaseError,
    transformer::{Transformer, TransformerDescriptor},
    version::{SchemaVersion, StoreKind},
};

use self::{
    fields::{non_canonical_keys, relocate_extensions},
    visualizations::{default_visualizations, rewrite_visualization},
};

#[derive(Debug)]
pub struct ExtensionNamespace {
    descriptor: TransformerDescriptor,
}

impl Default for ExtensionNamespace {
    fn default() -> Self {
        Self {
            // trace indices are classified against the document store's
            // sessions/versions, which exist from document version 2 on
            descriptor: TransformerDescriptor::new(StoreKind::Search, 1, 2)
                .requiring(StoreKind::Documents, 2),
        }
    }
}

#[derive(Debug)]
struct IndexBackup {
    index: String,
    class: IndexClass,
    count: u64,
    /// The copy was made by this run, not kept from an earlier one.
    created: bool,
}

async fn backup_index(
    search: &SearchStore,
    documents: &DocumentStore,
    origin: SchemaVersion,
    index: String,
) -> Result<IndexBackup, PhaseError> {
    let class = classify(&index, documents).await?;
    let count = search.count(&index).await?;
    let backup = backup_name(origin, &index);
    let upgrade = upgrade_name(&index);
    let mut created = false;
    if search.index_exists(&backup).await? || search.index_exists(&upgrade).await? {
        info!(%index, "Copy from an earlier run present, skipping backup");
    } else {
        search.create_index(&backup).await?;
        match search.reindex(&index, &backup).await {
            Ok(copied) => info!(%index, %backup, copied, "Backed up index"),
            Err(error) => {
                discard_copy(search, &backup).await;
                return Err(error.into());
            }
        }
        created = true;
    }
    Ok(IndexBackup {
        index,
        class,
        count,
        created,
    })
}

async fn discard_copy(search: &SearchStore, backup: &str) {
    if let Err(error) = search.delete_index_if_exists(backup).await {
        warn!(%backup, %error, "Could not drop partial backup");
    }
}

/// Stages a relocated copy of `index` into `upgrade_<index>`.
/// Returns the field names moved under `ext`.
async fn relocate_index(search: &SearchStore, index: &str) -> Result<BTreeSet<String>, PhaseError> {
    let upgrade = upgrade_name(index);
    if !search.index_exists(&upgrade).await? {
        search.create_index(&upgrade).await?;
    }
    let mut moved = BTreeSet::new();
    let mut documents = 0usize;
    let mut cursor = search.scroll(ScrollRequest::new(index));
    while let Some(page) = cursor.next_page().await? {
        let mut batch = Vec::with_capacity(page.len());
        for mut hit in page {
            let relocated = relocate_extensions(&mut hit.source).map_err(|conflict| {
                PhaseError::MalformedDocument {
                    collection: index.to_owned(),
                    id: hit.id.clone(),
                    reason: conflict.to_string(),
                }
            })?;
            moved.extend(relocated);
            batch.push((hit.id, hit.source));
        }
        documents += batch.len();
        let response = search.bulk_index(&upgrade, batch).await?;
        if let Some(first) = response.failures.first() {
            return Err(PhaseError::BulkWrite {
                index: upgrade,
                failed: response.failures.len(),
                first_error: format!("{}: {}", first.id, first.error),
            });
        }
    }
    info!(%index, documents, fields = moved.len(), "Relocated extension fields");
    Ok(moved)
}

/// Stages rewritten visualizations of `index` into `upgrade_<index>`.
async fn rewrite_visualizations(
    search: &SearchStore,
    index: &str,
    extensions: &BTreeSet<String>,
) -> Result<usize, PhaseError> {
    let mut rewritten = Vec::new();
    let mut cursor = search.scroll(ScrollRequest::new(index));
    while let Some(page) = cursor.next_page().await? {
        for mut hit in page {
            match rewrite_visualization(&mut hit.source, extensions) {
                Ok(true) => rewritten.push((hit.id, hit.source)),
                Ok(false) => {}
                Err(error) => {
                    warn!(%index, id = %hit.id, %error, "Visualization state is not valid JSON, leaving it as is");
                }
            }
        }
    }
    let count = rewritten.len();
    let upgrade = upgrade_name(index);
    let response = search.bulk_index(&upgrade, rewritten).await?;
    if let Some(first) = response.failures.first() {
        return Err(PhaseError::BulkWrite {
            index: upgrade,
            failed: response.failures.len(),
            first_error: format!("{}: {}", first.id, first.error),
        });
    }
    if count > 0 {
        info!(%index, count, "Rewrote visualizations");
    }
    Ok(count)
}

/// Reindexes `upgrade_<index>` over `index` and drops the staged copy.
async fn promote(search: &SearchStore, index: &str) -> Result<(), PhaseError> {
    let upgrade = upgrade_name(index);
    if !search.index_exists(&upgrade).await? {
        return Ok(());
    }
    let promoted = search.reindex(&upgrade, index).await?;
    search.delete_index(&upgrade).await?;
    search.refresh(index).await?;
    debug!(%index, promoted, "Promoted staged index");
    Ok(())
}

async fn indices_with_prefix(search: &SearchStore, prefix: &str) -> Result<Vec<String>, PhaseError> {
    Ok(search
        .list_indices()
        .await?
        .into_iter()
        .filter(|index| index.starts_with(prefix))
        .collect())
}

/// Compares every trace of `index` with the relocated form of its backup.
async fn verify_relocation(
    search: &SearchStore,
    origin: SchemaVersion,
    index: &str,
) -> Result<(), PhaseError> {
    let backup = backup_name(origin, index);
    if !search.index_exists(&backup).await? {
        return Err(PhaseError::postcondition(format!(
            "{index} has no backup to verify the relocation against"
        )));
    }
    let mut cursor = search.scroll(ScrollRequest::new(backup.as_str()));
    while let Some(page) = cursor.next_page().await? {
        for hit in page {
            let mut expected = hit.source;
            relocate_extensions(&mut expected).map_err(|conflict| {
                PhaseError::postcondition(format!("{index}/{}: {conflict}", hit.id))
            })?;
            let current = search.get(index, &hit.id).await?;
            if current.as_ref().map(|current| &current.source) != Some(&expected) {
                return Err(PhaseError::postcondition(format!(
                    "{index}/{} does not match its backup after relocation",
                    hit.id
                )));
            }
        }
    }
    Ok(())
}

fn indices_of(
    classes: &BTreeMap<String, IndexClass>,
    wanted: impl Fn(IndexClass) -> bool,
) -> Vec<String> {
    classes
        .iter()
        .filter(|(_, class)| wanted(**class))
        .map(|(index, _)| index.clone())
        .collect()
}

#[async_trait::async_trait]
impl Transformer for ExtensionNamespace {
    fn descriptor(&self) -> &TransformerDescriptor {
        &self.descriptor
    }

    async fn backup(&self, config: &mut MigrationConfig) -> Result<(), PhaseError> {
        let origin = self.descriptor.origin;
        let indices: Vec<String> = config
            .search
            .list_indices()
            .await?
            .into_iter()
            .filter(|index| !is_migration_artifact(index) && index != VERSION_INDEX)
            .collect();
        // every copy runs to the end so a failure knows which copies exist
        let results = join_all(
            indices
                .into_iter()
                .map(|index| backup_index(&config.search, &config.documents, origin, index)),
        )
        .await;

        let mut backups = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(backup) => backups.push(backup),
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }
        if let Some(error) = first_error {
            for backup in backups.iter().filter(|backup| backup.created) {
                discard_copy(&config.search, &backup_name(origin, &backup.index)).await;
            }
            return Err(error);
        }

        for IndexBackup {
            index,
            class,
            count,
            ..
        } in backups
        {
            debug!(%index, ?class, count, "Classified index");
            config.state.baseline_counts.insert(index.clone(), count);
            config.state.indices.insert(index, class);
        }
        Ok(())
    }

    async fn upgrade(&self, config: &mut MigrationConfig) -> Result<(), PhaseError> {
        let search = &config.search;
        let dashboards = indices_of(&config.state.indices, |c| c == IndexClass::GamesDashboard);

        for dashboard in &dashboards {
            let mut seeded = 0u64;
            for (id, visualization) in default_visualizations() {
                if search.get(dashboard, &id).await?.is_none() {
                    seeded += 1;
                }
                search
                    .index_document(dashboard, Some(&id), visualization)
                    .await?;
            }
            search.refresh(dashboard).await?;
            config.state.seeded.insert(dashboard.clone(), seeded);
        }

        let traces = indices_of(&config.state.indices, IndexClass::holds_traces);
        let moved = try_join_all(traces.iter().map(|index| relocate_index(search, index))).await?;
        config.state.extensions = moved.into_iter().flatten().collect();
        info!(
            indices = traces.len(),
            fields = config.state.extensions.len(),
            "Staged relocated trace indices"
        );

        let mut saved_objects = dashboards;
        if config.state.indices.contains_key(KIBANA_INDEX) {
            saved_objects.push(KIBANA_INDEX.to_owned());
        }
        let extensions = &config.state.extensions;
        try_join_all(
            saved_objects
                .iter()
                .map(|index| rewrite_visualizations(search, index, extensions)),
        )
        .await?;

        let staged: Vec<String> = config.state.indices.keys().cloned().collect();
        try_join_all(staged.iter().map(|index| promote(search, index))).await?;
        Ok(())
    }

    async fn check(&self, config: &mut MigrationConfig) -> Result<(), PhaseError> {
        let search = &config.search;
        let state = &config.state;

        let leftovers = indices_with_prefix(search, UPGRADE_PREFIX).await?;
        if !leftovers.is_empty() {
            return Err(PhaseError::postcondition(format!(
                "staged indices were not promoted: {leftovers:?}"
            )));
        }

        for (index, baseline) in &state.baseline_counts {
            let expected = baseline + state.seeded.get(index).copied().unwrap_or(0);
            search.refresh(index).await?;
            let actual = search.count(index).await?;
            if actual != expected {
                return Err(PhaseError::postcondition(format!(
                    "{index} holds {actual} document(s), expected {expected}"
                )));
            }
        }

        for index in indices_of(&state.indices, IndexClass::holds_traces) {
            let mut cursor = search.scroll(ScrollRequest::new(index.as_str()));
            while let Some(page) = cursor.next_page().await? {
                for hit in page {
                    if let Some(key) = non_canonical_keys(&hit.source).next() {
                        return Err(PhaseError::postcondition(format!(
                            "{index}/{} keeps non-canonical field {key} at the top level",
                            hit.id
                        )));
                    }
                }
            }
            verify_relocation(search, self.descriptor.origin, &index).await?;
        }
        Ok(())
    }

    async fn clean(&self, config: &mut MigrationConfig) -> Result<(), PhaseError> {
        let search = &config.search;
        let mut removed = 0usize;
        let backups = backup_prefix(self.descriptor.origin);
        for prefix in [backups.as_str(), UPGRADE_PREFIX] {
            for index in indices_with_prefix(search, prefix).await? {
                if search.delete_index_if_exists(&index).await? {
                    removed += 1;
                }
            }
        }
        info!(removed, "Removed migration copies");
        Ok(())
    }

    async fn restore(&self, config: &mut MigrationConfig) -> Result<(), PhaseError> {
        let search = &config.search;
        let prefix = backup_prefix(self.descriptor.origin);
        for backup in indices_with_prefix(search, &prefix).await? {
            let Some(index) = backup.strip_prefix(prefix.as_str()) else {
                continue;
            };
            search.delete_index_if_exists(index).await?;
            search.create_index(index).await?;
            let restored = search.reindex(&backup, index).await?;
            search.delete_index(&backup).await?;
            search.refresh(index).await?;
            info!(%index, restored, "Restored index from backup");
        }
        for upgrade in indices_with_prefix(search, UPGRADE_PREFIX).await? {
            search.delete_index_if_exists(&upgrade).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use analytics_storage::Document;
    use serde_json::{Value, json};

    use super::*;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn seeded() -> MigrationConfig {
        let config = MigrationConfig::new(DocumentStore::in_memory(), SearchStore::in_memory());
        config
            .documents
            .insert("sessions", doc(json!({ "_id": "act1" })))
            .await
            .expect("seed session");
        let search = &config.search;
        search
            .bulk_index(
                "act1",
                vec![
                    (
                        "t1".to_owned(),
                        doc(json!({ "timestamp": 1, "event": "completed", "coins": 3 })),
                    ),
                    (
                        "t2".to_owned(),
                        doc(json!({ "timestamp": 2, "event": "progressed", "level": "l2" })),
                    ),
                ],
            )
            .await
            .expect("seed traces");
        let vis_state = json!({ "aggs": [{ "params": { "field": "coins" } }] });
        search
            .index_document(
                KIBANA_INDEX,
                Some("coins-vis"),
                doc(json!({ "title": "Coins", "visState": vis_state.to_string() })),
            )
            .await
            .expect("seed visualization");
        search.create_index(".games42").await.expect("seed dashboard");
        config
    }

    async fn snapshot(search: &SearchStore) -> BTreeMap<String, Vec<(String, Document)>> {
        let mut state = BTreeMap::new();
        for index in search.list_indices().await.expect("list") {
            let hits = search
                .scroll_all(ScrollRequest::new(index.as_str()))
                .await
                .expect("scroll");
            state.insert(
                index,
                hits.into_iter().map(|hit| (hit.id, hit.source)).collect(),
            );
        }
        state
    }

    #[tokio::test]
    async fn upgrade_relocates_fields_and_rewrites_visualizations() {
        let mut config = seeded().await;
        let transformer = ExtensionNamespace::default();
        transformer.backup(&mut config).await.expect("backup");
        assert!(config.search.index_exists("backup_v1_act1").await.expect("exists"));
        assert_eq!(config.state.indices["act1"], IndexClass::Trace);

        transformer.upgrade(&mut config).await.expect("upgrade");
        transformer.check(&mut config).await.expect("check");

        let t1 = config
            .search
            .get("act1", "t1")
            .await
            .expect("get")
            .expect("t1 kept");
        assert_eq!(t1.source["ext"], json!({ "coins": 3 }));
        assert!(t1.source.get("coins").is_none());
        assert_eq!(
            config.state.extensions,
            BTreeSet::from(["coins".to_owned(), "level".to_owned()])
        );

        let vis = config
            .search
            .get(KIBANA_INDEX, "coins-vis")
            .await
            .expect("get")
            .expect("visualization kept");
        assert!(vis.source["visState"].as_str().unwrap_or("").contains("ext.coins"));
        assert_eq!(config.search.count(".games42").await.expect("count"), 2);

        transformer.clean(&mut config).await.expect("clean");
        let leftovers: Vec<String> = config
            .search
            .list_indices()
            .await
            .expect("list")
            .into_iter()
            .filter(|index| is_migration_artifact(index))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn restore_brings_back_the_pre_backup_state_and_is_idempotent() {
        let mut config = seeded().await;
        let before = snapshot(&config.search).await;

        let transformer = ExtensionNamespace::default();
        transformer.backup(&mut config).await.expect("backup");
        transformer.upgrade(&mut config).await.expect("upgrade");
        transformer.restore(&mut config).await.expect("restore");
        transformer.restore(&mut config).await.expect("second restore");

        assert_eq!(snapshot(&config.search).await, before);
    }

    #[tokio::test]
    async fn check_rejects_count_drift() {
        let mut config = seeded().await;
        let transformer = ExtensionNamespace::default();
        transformer.backup(&mut config).await.expect("backup");
        transformer.upgrade(&mut config).await.expect("upgrade");
        config
            .search
            .delete_document("act1", "t2")
            .await
            .expect("lose a document");

        let err = transformer.check(&mut config).await.expect_err("drift");
        assert!(err.to_string().contains("act1 holds 1"));
    }

    #[tokio::test]
    async fn backup_skips_indices_copied_by_an_earlier_run() {
        let mut config = seeded().await;
        config
            .search
            .bulk_index(
                "backup_v1_act1",
                vec![("t1".to_owned(), doc(json!({ "timestamp": 1 })))],
            )
            .await
            .expect("stale backup");

        ExtensionNamespace::default()
            .backup(&mut config)
            .await
            .expect("backup");
        assert_eq!(config.search.count("backup_v1_act1").await.expect("count"), 1);
    }

    #[tokio::test]
    async fn conflicting_ext_field_fails_the_upgrade_and_restore_keeps_it() {
        let mut config = seeded().await;
        config
            .search
            .index_document(
                "act1",
                Some("t3"),
                doc(json!({ "timestamp": 3, "ext": { "coins": 1 }, "coins": 3 })),
            )
            .await
            .expect("seed conflicting trace");
        let before = snapshot(&config.search).await;

        let transformer = ExtensionNamespace::default();
        transformer.backup(&mut config).await.expect("backup");
        let err = transformer
            .upgrade(&mut config)
            .await
            .expect_err("coins is set twice");
        assert!(matches!(err, PhaseError::MalformedDocument { ref id, .. } if id == "t3"));

        transformer.restore(&mut config).await.expect("restore");
        assert_eq!(snapshot(&config.search).await, before);
    }

    #[tokio::test]
    async fn check_compares_traces_with_their_backup() {
        let mut config = seeded().await;
        let transformer = ExtensionNamespace::default();
        transformer.backup(&mut config).await.expect("backup");
        transformer.upgrade(&mut config).await.expect("upgrade");
        config
            .search
            .index_document(
                "act1",
                Some("t1"),
                doc(json!({ "timestamp": 1, "event": "completed", "ext": { "coins": 4 } })),
            )
            .await
            .expect("corrupt a relocated value");

        let err = transformer.check(&mut config).await.expect_err("value drift");
        assert!(err.to_string().contains("act1/t1"));
    }

    #[tokio::test]
    async fn clean_and_restore_leave_other_steps_backups_alone() {
        let mut config = seeded().await;
        config
            .search
            .bulk_index(
                "backup_v0_act1",
                vec![("t1".to_owned(), doc(json!({ "timestamp": 1 })))],
            )
            .await
            .expect("foreign backup");

        let transformer = ExtensionNamespace::default();
        transformer.backup(&mut config).await.expect("backup");
        transformer.upgrade(&mut config).await.expect("upgrade");
        transformer.restore(&mut config).await.expect("restore");
        assert_eq!(config.search.count("act1").await.expect("count"), 2);
        assert!(config.search.index_exists("backup_v0_act1").await.expect("exists"));

        transformer.backup(&mut config).await.expect("backup");
        transformer.upgrade(&mut config).await.expect("upgrade");
        transformer.check(&mut config).await.expect("check");
        transformer.clean(&mut config).await.expect("clean");
        assert!(!config.search.index_exists("backup_v1_act1").await.expect("exists"));
        assert!(config.search.index_exists("backup_v0_act1").await.expect("exists"));
    }
}
