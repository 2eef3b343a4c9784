pub mod adapter;
pub mod chain;
pub mod classify;
pub mod config;
pub mod driver;
pub mod error;
pub mod transformer;
pub mod transformers;
pub mod version;

pub use adapter::{DocumentStoreAdapter, SearchStoreAdapter, StoreAdapter, read_model_version};
pub use chain::TransformerChain;
pub use config::{MigrationConfig, TransformState};
pub use driver::{MigrationDriver, RefreshOutcome, RunStatus, TransformOutcome};
pub use error::{ChainError, MigrationError, Phase, PhaseError};
pub use transformer::{Transformer, TransformerDescriptor};
pub use transformers::{chain_for, documents_chain, search_chain};
pub use version::{
    DOCUMENTS_TARGET_VERSION, INITIAL_VERSION, SEARCH_TARGET_VERSION, SchemaVersion, StoreKind,
};
