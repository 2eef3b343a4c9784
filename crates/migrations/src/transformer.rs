use std::{collections::BTreeMap, fmt::Debug};

use serde::Serialize;

use crate::{
    config::MigrationConfig,
    error::PhaseError,
    version::{SchemaVersion, StoreKind},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransformerDescriptor {
    pub store: StoreKind,
    pub origin: SchemaVersion,
    pub destination: SchemaVersion,
    /// Minimum version other stores must already have reached.
    pub requires: BTreeMap<StoreKind, SchemaVersion>,
}

impl TransformerDescriptor {
    pub fn new(store: StoreKind, origin: u32, destination: u32) -> Self {
        Self {
            store,
            origin: SchemaVersion(origin),
            destination: SchemaVersion(destination),
            requires: BTreeMap::new(),
        }
    }

    pub fn requiring(mut self, store: StoreKind, version: u32) -> Self {
        self.requires.insert(store, SchemaVersion(version));
        self
    }
}

/// One schema step for one store.
///
/// The driver runs `backup -> upgrade -> check`, then `clean` on success or
/// `restore` when `upgrade` or `check` fail. State produced by one phase for
/// the next travels in [`MigrationConfig::state`].
// We need async_trait because the stabilized feature lacks support for object safety
// (i.e. dyn Transformer)
#[async_trait::async_trait]
pub trait Transformer: Debug + Send + Sync {
    fn descriptor(&self) -> &TransformerDescriptor;

    /// Snapshots everything `upgrade` is about to touch. Must not mutate live data.
    ///
    /// On failure it drops the copies it made, keeping any copy an earlier
    /// failed run left behind.
    async fn backup(&self, config: &mut MigrationConfig) -> Result<(), PhaseError>;

    async fn upgrade(&self, config: &mut MigrationConfig) -> Result<(), PhaseError>;

    /// Verifies postconditions of `upgrade`.
    async fn check(&self, config: &mut MigrationConfig) -> Result<(), PhaseError>;

    /// Removes backups and temporary artifacts.
    async fn clean(&self, config: &mut MigrationConfig) -> Result<(), PhaseError>;

    /// Brings the store back to its pre-backup state. Must be idempotent.
    async fn restore(&self, config: &mut MigrationConfig) -> Result<(), PhaseError>;
}
