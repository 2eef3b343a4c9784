pub mod in_memory;
pub mod search_http;
pub mod search_in_memory;
#[cfg(feature = "sql")]
pub mod sql;
