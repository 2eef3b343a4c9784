use std::{collections::BTreeMap, sync::Arc};

use tracing::error;

use crate::{
    error::ChainError,
    transformer::Transformer,
    version::{SchemaVersion, StoreKind},
};

/// Transformers of one store, keyed by origin version.
#[derive(Debug, Clone)]
pub struct TransformerChain {
    store: StoreKind,
    transformers: BTreeMap<SchemaVersion, Arc<dyn Transformer>>,
}

impl TransformerChain {
    pub fn new(store: StoreKind) -> Self {
        Self {
            store,
            transformers: BTreeMap::new(),
        }
    }

    pub fn store(&self) -> StoreKind {
        self.store
    }

    /// Adds `transformer`. A second transformer for an origin already present
    /// is rejected and the first registration stays in place.
    pub fn register(&mut self, transformer: Arc<dyn Transformer>) -> Result<(), ChainError> {
        let descriptor = transformer.descriptor();
        if descriptor.store != self.store {
            return Err(ChainError::WrongStore {
                expected: self.store,
                found: descriptor.store,
            });
        }
        if descriptor.destination <= descriptor.origin {
            return Err(ChainError::NonIncreasing {
                origin: descriptor.origin,
                destination: descriptor.destination,
            });
        }
        if self.transformers.contains_key(&descriptor.origin) {
            let err = ChainError::DuplicateOrigin {
                store: self.store,
                origin: descriptor.origin,
            };
            error!(%err, "Rejected transformer registration");
            return Err(err);
        }
        self.transformers.insert(descriptor.origin, transformer);
        Ok(())
    }

    pub fn find(&self, origin: SchemaVersion) -> Option<Arc<dyn Transformer>> {
        self.transformers.get(&origin).cloned()
    }

    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }

    /// `(origin, destination)` pairs in origin order.
    pub fn steps(&self) -> Vec<(SchemaVersion, SchemaVersion)> {
        self.transformers
            .values()
            .map(|t| (t.descriptor().origin, t.descriptor().destination))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::MigrationConfig, error::PhaseError, transformer::TransformerDescriptor,
    };

    #[derive(Debug)]
    struct Named {
        descriptor: TransformerDescriptor,
        name: &'static str,
    }

    #[async_trait::async_trait]
    impl Transformer for Named {
        fn descriptor(&self) -> &TransformerDescriptor {
            &self.descriptor
        }
        async fn backup(&self, _: &mut MigrationConfig) -> Result<(), PhaseError> {
            Ok(())
        }
        async fn upgrade(&self, _: &mut MigrationConfig) -> Result<(), PhaseError> {
            Ok(())
        }
        async fn check(&self, _: &mut MigrationConfig) -> Result<(), PhaseError> {
            Ok(())
        }
        async fn clean(&self, _: &mut MigrationConfig) -> Result<(), PhaseError> {
            Ok(())
        }
        async fn restore(&self, _: &mut MigrationConfig) -> Result<(), PhaseError> {
            Ok(())
        }
    }

    fn named(name: &'static str, origin: u32, destination: u32) -> Arc<dyn Transformer> {
        Arc::new(Named {
            descriptor: TransformerDescriptor::new(StoreKind::Documents, origin, destination),
            name,
        })
    }

    #[test]
    fn duplicate_origin_is_rejected_and_first_registration_wins() {
        let mut chain = TransformerChain::new(StoreKind::Documents);
        chain.register(named("first", 1, 2)).expect("first registration");

        let err = chain
            .register(named("second", 1, 3))
            .expect_err("duplicate origin");
        assert_eq!(
            err,
            ChainError::DuplicateOrigin {
                store: StoreKind::Documents,
                origin: SchemaVersion(1)
            }
        );

        let kept = chain.find(SchemaVersion(1)).expect("origin 1 registered");
        assert_eq!(kept.descriptor().destination, SchemaVersion(2));
        assert!(format!("{kept:?}").contains("first"));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn non_increasing_steps_are_rejected() {
        let mut chain = TransformerChain::new(StoreKind::Documents);
        assert_eq!(
            chain.register(named("loop", 2, 2)),
            Err(ChainError::NonIncreasing {
                origin: SchemaVersion(2),
                destination: SchemaVersion(2)
            })
        );
        assert!(chain.is_empty());
    }

    #[test]
    fn foreign_store_transformers_are_rejected() {
        let mut chain = TransformerChain::new(StoreKind::Search);
        assert!(matches!(
            chain.register(named("doc", 1, 2)),
            Err(ChainError::WrongStore { .. })
        ));
    }

    #[test]
    fn steps_are_listed_in_origin_order() {
        let mut chain = TransformerChain::new(StoreKind::Documents);
        chain.register(named("b", 2, 3)).expect("register");
        chain.register(named("a", 1, 2)).expect("register");
        assert_eq!(
            chain.steps(),
            vec![
                (SchemaVersion(1), SchemaVersion(2)),
                (SchemaVersion(2), SchemaVersion(3))
            ]
        );
    }
}
