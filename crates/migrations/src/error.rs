use analytics_storage::StoreError;

use crate::version::{SchemaVersion, StoreKind};

/// Failure inside a single transformer phase.
#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("postcondition violated: {0}")]
    Postcondition(String),
    #[error("bulk write into {index} rejected {failed} document(s), first error: {first_error}")]
    BulkWrite {
        index: String,
        failed: usize,
        first_error: String,
    },
    #[error("malformed document {id} in {collection}: {reason}")]
    MalformedDocument {
        collection: String,
        id: String,
        reason: String,
    },
}

impl PhaseError {
    pub fn postcondition(message: impl Into<String>) -> Self {
        Self::Postcondition(message.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Backup,
    Upgrade,
    Check,
    Clean,
    Restore,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Backup => "backup",
            Self::Upgrade => "upgrade",
            Self::Check => "check",
            Self::Clean => "clean",
            Self::Restore => "restore",
        };
        f.write_str(name)
    }
}

/// Rejected transformer registration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("a {store} transformer for origin {origin} is already registered")]
    DuplicateOrigin {
        store: StoreKind,
        origin: SchemaVersion,
    },
    #[error("transformer {origin}->{destination} does not move the version forward")]
    NonIncreasing {
        origin: SchemaVersion,
        destination: SchemaVersion,
    },
    #[error("{found} transformer registered into the {expected} chain")]
    WrongStore {
        expected: StoreKind,
        found: StoreKind,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("driver is not connected")]
    NotConnected,
    #[error("cannot connect to {store} store: {source}")]
    Connection {
        store: StoreKind,
        #[source]
        source: StoreError,
    },
    #[error("cannot read {store} model version: {source}")]
    ReadVersion {
        store: StoreKind,
        #[source]
        source: StoreError,
    },
    #[error("no {store} transformer starts at version {version}; the chain is broken")]
    BrokenChain {
        store: StoreKind,
        version: SchemaVersion,
    },
    #[error("{store} store has no pending transformer (call refresh first)")]
    NothingPending { store: StoreKind },
    #[error(
        "{store} transformer {origin}->{destination} requires the {required_store} store at version {required}, found {found}"
    )]
    RequirementNotMet {
        store: StoreKind,
        origin: SchemaVersion,
        destination: SchemaVersion,
        required_store: StoreKind,
        required: SchemaVersion,
        found: SchemaVersion,
    },
    #[error("{store} backup failed: {source}")]
    Backup {
        store: StoreKind,
        #[source]
        source: PhaseError,
    },
    #[error("{store} upgrade failed and was rolled back: {source}")]
    Upgrade {
        store: StoreKind,
        #[source]
        source: PhaseError,
    },
    #[error("{store} check failed and the upgrade was rolled back: {source}")]
    Check {
        store: StoreKind,
        #[source]
        source: PhaseError,
    },
    #[error(
        "{store} restore failed after {failed_phase} error ({cause}): {source}; data may be inconsistent"
    )]
    Restore {
        store: StoreKind,
        failed_phase: Phase,
        cause: Box<PhaseError>,
        #[source]
        source: PhaseError,
    },
    #[error("cannot persist {store} model version {version}: {source}")]
    SetVersion {
        store: StoreKind,
        version: SchemaVersion,
        #[source]
        source: StoreError,
    },
}

impl MigrationError {
    /// Phase the error originated from, when it came from a transformer.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Backup { .. } => Some(Phase::Backup),
            Self::Upgrade { .. } => Some(Phase::Upgrade),
            Self::Check { .. } => Some(Phase::Check),
            Self::Restore { .. } => Some(Phase::Restore),
            _ => None,
        }
    }

    /// True when the store may have been left in a state neither old nor new.
    pub fn is_inconsistent(&self) -> bool {
        matches!(self, Self::Restore { .. })
    }

    /// Only connection-level failures are worth retrying from the outside.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { source, .. } | Self::ReadVersion { source, .. } => {
                source.is_retryable() || matches!(source, StoreError::RetryExhausted { .. })
            }
            _ => false,
        }
    }
}
