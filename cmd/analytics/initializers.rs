use std::{path::Path, time::Duration};

use analytics_storage::{
    DocumentStore, EngineType, RetryPolicy, SearchEngineType, SearchStore, StoreError,
};
use eyre::{Result, WrapErr};
use tracing::{Level, info};
use tracing_subscriber::{
    EnvFilter, filter::Directive, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::cli::Options;

/// Store location that selects the in-memory engines.
pub const MEMORY_STORE: &str = "memory";

pub fn is_memory_store(location: &str) -> bool {
    location == MEMORY_STORE
}

pub fn init_tracing(opts: &Options) {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();

    let include_target = matches!(opts.log_level, Level::DEBUG | Level::TRACE);

    // stdout carries the reports
    let fmt_layer = fmt::layer()
        .with_target(include_target)
        .with_writer(std::io::stderr);

    // a subscriber may already be installed when running inside tests
    let _ = tracing_subscriber::registry()
        .with(log_filter)
        .with(fmt_layer)
        .try_init();
}

pub fn retry_policy(opts: &Options) -> RetryPolicy {
    RetryPolicy::new(
        opts.retry_attempts,
        Duration::from_millis(opts.retry_base_delay_ms),
    )
}

/// Opens the document store at `location`: `memory` or a SQL database file.
pub async fn open_document_store(
    location: &str,
    retry: RetryPolicy,
) -> Result<DocumentStore, StoreError> {
    if is_memory_store(location) {
        let store = DocumentStore::new(Path::new(location), EngineType::InMemory).await?;
        return Ok(store.with_retry_policy(retry));
    }
    #[cfg(feature = "sql")]
    {
        let store = DocumentStore::new(Path::new(location), EngineType::SQL).await?;
        Ok(store.with_retry_policy(retry))
    }
    #[cfg(not(feature = "sql"))]
    {
        Err(StoreError::Custom(format!(
            "cannot open {location}: built without the sql feature"
        )))
    }
}

/// Opens the search store at `location`: `memory` or an HTTP URL.
pub fn open_search_store(location: &str, retry: RetryPolicy) -> Result<SearchStore, StoreError> {
    let engine_type = if is_memory_store(location) {
        SearchEngineType::InMemory
    } else {
        SearchEngineType::Http(location.to_owned())
    };
    Ok(SearchStore::new(engine_type)?.with_retry_policy(retry))
}

/// Opens both stores and waits until they answer. Pings go through the retry
/// policy, so an unreachable store is retried with backoff before giving up.
pub async fn init_stores(opts: &Options) -> Result<(DocumentStore, SearchStore)> {
    let retry = retry_policy(opts);
    let documents = open_document_store(&opts.documents_path, retry)
        .await
        .wrap_err_with(|| format!("Cannot open document store {}", opts.documents_path))?;
    let search = open_search_store(&opts.search_url, retry)
        .wrap_err_with(|| format!("Cannot open search store {}", opts.search_url))?;

    documents
        .ping()
        .await
        .wrap_err("Document store is unreachable")?;
    search.ping().await.wrap_err("Search store is unreachable")?;
    info!(
        documents = %opts.documents_path,
        search = %opts.search_url,
        "Connected to stores"
    );
    Ok((documents, search))
}

/// The search store alone, for the maintenance tools.
pub async fn init_search_store(opts: &Options) -> Result<SearchStore> {
    let search = open_search_store(&opts.search_url, retry_policy(opts))
        .wrap_err_with(|| format!("Cannot open search store {}", opts.search_url))?;
    search.ping().await.wrap_err("Search store is unreachable")?;
    info!(search = %opts.search_url, "Connected to search store");
    Ok(search)
}
