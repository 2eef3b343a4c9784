use std::{collections::BTreeMap, sync::Arc, time::Instant};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    adapter::{StoreAdapter, read_model_version},
    chain::TransformerChain,
    config::{MigrationConfig, TransformState},
    error::{MigrationError, Phase, PhaseError},
    transformer::Transformer,
    version::{SchemaVersion, StoreKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Store is at the target version.
    Ok,
    /// A transformer is selected and ready to run.
    Pending,
    /// No transformer starts at the current version.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshOutcome {
    pub store: StoreKind,
    pub status: RunStatus,
    pub current: SchemaVersion,
    pub target: SchemaVersion,
    pub next_version: Option<SchemaVersion>,
    pub required_versions: BTreeMap<StoreKind, SchemaVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransformOutcome {
    pub store: StoreKind,
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    /// Set when `clean` failed; temporary artifacts may remain.
    pub clean_error: Option<String>,
    pub elapsed_ms: u64,
}

/// Drives one store through `connect -> refresh -> transform`.
pub struct MigrationDriver<A: StoreAdapter> {
    adapter: A,
    chain: TransformerChain,
    target: SchemaVersion,
    config: Option<MigrationConfig>,
    pending: Option<Arc<dyn Transformer>>,
    status: Option<RunStatus>,
}

impl<A: StoreAdapter> MigrationDriver<A> {
    pub fn new(adapter: A, chain: TransformerChain, target: SchemaVersion) -> Self {
        Self {
            adapter,
            chain,
            target,
            config: None,
            pending: None,
            status: None,
        }
    }

    pub fn store(&self) -> StoreKind {
        self.adapter.kind()
    }

    pub fn target(&self) -> SchemaVersion {
        self.target
    }

    /// Status of the last refresh, `None` before the first one.
    pub fn status(&self) -> Option<RunStatus> {
        self.status
    }

    pub fn config(&self) -> Option<&MigrationConfig> {
        self.config.as_ref()
    }

    pub fn into_config(self) -> Option<MigrationConfig> {
        self.config
    }

    pub async fn connect(&mut self, config: MigrationConfig) -> Result<(), MigrationError> {
        self.adapter
            .do_connect(&config)
            .await
            .map_err(|source| MigrationError::Connection {
                store: self.store(),
                source,
            })?;
        info!(store = %self.store(), run_id = %config.run_id, "Connected");
        self.config = Some(config);
        self.pending = None;
        self.status = None;
        Ok(())
    }

    pub async fn current_version(&self) -> Result<SchemaVersion, MigrationError> {
        let config = self.config.as_ref().ok_or(MigrationError::NotConnected)?;
        self.adapter
            .get_model_version(config)
            .await
            .map_err(|source| MigrationError::ReadVersion {
                store: self.store(),
                source,
            })
    }

    pub async fn refresh(&mut self) -> Result<RefreshOutcome, MigrationError> {
        let current = self.current_version().await?;
        let store = self.store();
        let mut outcome = RefreshOutcome {
            store,
            status: RunStatus::Ok,
            current,
            target: self.target,
            next_version: None,
            required_versions: BTreeMap::new(),
        };
        self.pending = None;

        if current == self.target {
            info!(%store, version = %current, "Store is up to date");
        } else if let Some(transformer) = self.chain.find(current) {
            let descriptor = transformer.descriptor();
            outcome.status = RunStatus::Pending;
            outcome.next_version = Some(descriptor.destination);
            outcome.required_versions = descriptor.requires.clone();
            info!(
                %store,
                from = %current,
                to = %descriptor.destination,
                target = %self.target,
                "Transformer pending"
            );
            self.pending = Some(transformer);
        } else {
            outcome.status = RunStatus::Error;
            error!(
                %store,
                version = %current,
                target = %self.target,
                "No transformer starts at the current version, operator intervention required"
            );
        }

        self.status = Some(outcome.status);
        Ok(outcome)
    }

    /// Runs the pending transformer selected by the last [`refresh`](Self::refresh).
    pub async fn transform(&mut self) -> Result<TransformOutcome, MigrationError> {
        let store = self.store();
        let started_at = Instant::now();
        let transformer = match (self.status, self.pending.clone()) {
            (Some(RunStatus::Pending), Some(transformer)) => transformer,
            (Some(RunStatus::Error), _) => {
                return Err(MigrationError::BrokenChain {
                    store,
                    version: self.current_version().await?,
                });
            }
            _ => return Err(MigrationError::NothingPending { store }),
        };
        let descriptor = transformer.descriptor().clone();
        let config = self.config.as_mut().ok_or(MigrationError::NotConnected)?;

        for (&required_store, &required) in &descriptor.requires {
            let found = read_model_version(required_store, config)
                .await
                .map_err(|source| MigrationError::ReadVersion {
                    store: required_store,
                    source,
                })?;
            if found < required {
                return Err(MigrationError::RequirementNotMet {
                    store,
                    origin: descriptor.origin,
                    destination: descriptor.destination,
                    required_store,
                    required,
                    found,
                });
            }
        }

        config.state = TransformState::default();
        info!(%store, from = %descriptor.origin, to = %descriptor.destination, "Backing up");
        // a failed backup drops the copies it made itself; nothing live was touched
        if let Err(source) = transformer.backup(config).await {
            error!(%store, error = %source, "Backup failed, store left as it was");
            return Err(MigrationError::Backup { store, source });
        }

        info!(%store, "Upgrading");
        if let Err(source) = transformer.upgrade(config).await {
            return Err(roll_back(&*transformer, config, store, Phase::Upgrade, source).await);
        }

        info!(%store, "Checking");
        if let Err(source) = transformer.check(config).await {
            return Err(roll_back(&*transformer, config, store, Phase::Check, source).await);
        }

        let clean_error = match transformer.clean(config).await {
            Ok(()) => None,
            Err(error) => {
                warn!(%store, %error, "Clean failed, temporary artifacts may remain");
                Some(error.to_string())
            }
        };

        self.adapter
            .set_model_version(config, descriptor.destination)
            .await
            .map_err(|source| MigrationError::SetVersion {
                store,
                version: descriptor.destination,
                source,
            })?;
        self.pending = None;
        self.status = None;

        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        info!(
            %store,
            from = %descriptor.origin,
            to = %descriptor.destination,
            elapsed_ms,
            "Transform complete"
        );
        Ok(TransformOutcome {
            store,
            from: descriptor.origin,
            to: descriptor.destination,
            clean_error,
            elapsed_ms,
        })
    }
}

async fn roll_back(
    transformer: &dyn Transformer,
    config: &mut MigrationConfig,
    store: StoreKind,
    failed_phase: Phase,
    cause: PhaseError,
) -> MigrationError {
    error!(%store, phase = %failed_phase, error = %cause, "Phase failed, restoring");
    match transformer.restore(config).await {
        Ok(()) => {
            warn!(%store, "Restore complete, store is back at its previous version");
            match failed_phase {
                Phase::Check => MigrationError::Check {
                    store,
                    source: cause,
                },
                _ => MigrationError::Upgrade {
                    store,
                    source: cause,
                },
            }
        }
        Err(source) => {
            error!(
                %store,
                error = %source,
                "RESTORE FAILED, the store may be inconsistent and needs manual repair"
            );
            MigrationError::Restore {
                store,
                failed_phase,
                cause: Box::new(cause),
                source,
            }
        }
    }
}
