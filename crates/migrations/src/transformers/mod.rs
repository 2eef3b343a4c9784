pub mod collections;
pub mod documents_v2;
pub mod documents_v3;
pub mod documents_v4;
pub mod search_v2;

use std::sync::Arc;

use crate::{chain::TransformerChain, error::ChainError, version::StoreKind};

pub use documents_v2::SessionClasses;
pub use documents_v3::SessionsToActivities;
pub use documents_v4::ParticipantsAndAttempts;
pub use search_v2::ExtensionNamespace;

/// Every document store transformer, 1 -> 2 -> 3 -> 4.
pub fn documents_chain() -> Result<TransformerChain, ChainError> {
    let mut chain = TransformerChain::new(StoreKind::Documents);
    chain.register(Arc::new(SessionClasses::default()))?;
    chain.register(Arc::new(SessionsToActivities::default()))?;
    chain.register(Arc::new(ParticipantsAndAttempts::default()))?;
    Ok(chain)
}

/// Every search store transformer, 1 -> 2.
pub fn search_chain() -> Result<TransformerChain, ChainError> {
    let mut chain = TransformerChain::new(StoreKind::Search);
    chain.register(Arc::new(ExtensionNamespace::default()))?;
    Ok(chain)
}

pub fn chain_for(store: StoreKind) -> Result<TransformerChain, ChainError> {
    match store {
        StoreKind::Documents => documents_chain(),
        StoreKind::Search => search_chain(),
    }
}
