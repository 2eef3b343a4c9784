pub mod api;
pub mod document;
pub mod error;
pub mod filter;
pub mod retry;
pub mod search;
mod store_db;

pub use api::{
    BulkItemError, BulkResponse, DEFAULT_SCROLL_BATCH, Document, DocumentEngine, ID_FIELD,
    ReindexStatus, ReindexTask, ScrollPage, ScrollRequest, SearchEngine, SearchHit, document_id,
};
pub use document::{DocumentStore, EngineType};
pub use error::StoreError;
pub use filter::Filter;
pub use retry::{RetryPolicy, retry_async};
pub use search::{ScrollCursor, SearchEngineType, SearchStore};
pub use store_db::{
    in_memory::Store as InMemoryDocuments,
    search_http::{HttpConfig, HttpStore},
    search_in_memory::{DEFAULT_FIELD_LIMIT, Store as InMemorySearch},
};
#[cfg(feature = "sql")]
pub use store_db::sql::SQLStore;
