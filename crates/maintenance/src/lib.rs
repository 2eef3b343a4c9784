//! Repair tools for the search store: duplicate trace removal and
//! consolidation of per-activity indices into their root index.

pub mod consolidate;
pub mod dedup;

pub use consolidate::{
    ConsolidationError, ConsolidationReport, DocumentFailure, IndexConsolidation,
    IndexConsolidator,
};
pub use dedup::{DedupError, DedupReport, DuplicateMarker, DuplicateResolver, RemovalReport};
