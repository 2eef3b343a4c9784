use std::collections::{BTreeMap, BTreeSet};

use analytics_storage::{DocumentStore, SearchStore};
use uuid::Uuid;

use crate::{classify::IndexClass, transformers::collections::CollectionSnapshot};

/// Open store handles plus the state one transformer threads through its phases.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub documents: DocumentStore,
    pub search: SearchStore,
    /// Identifies one driver invocation in logs and reports.
    pub run_id: Uuid,
    pub state: TransformState,
}

impl MigrationConfig {
    pub fn new(documents: DocumentStore, search: SearchStore) -> Self {
        Self {
            documents,
            search,
            run_id: Uuid::new_v4(),
            state: TransformState::default(),
        }
    }
}

/// Written by `backup`/`upgrade`, read by `check`/`clean`/`restore`.
/// Reset by the driver before every transform.
#[derive(Debug, Clone, Default)]
pub struct TransformState {
    pub collections: CollectionSnapshot,
    /// Classification of every search index seen at backup time.
    pub indices: BTreeMap<String, IndexClass>,
    /// Document count of each index when it was backed up.
    pub baseline_counts: BTreeMap<String, u64>,
    /// Default visualizations added per dashboard index.
    pub seeded: BTreeMap<String, u64>,
    /// Every field name relocated under `ext` during this run.
    pub extensions: BTreeSet<String>,
}
