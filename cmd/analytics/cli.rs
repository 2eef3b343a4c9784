use std::{
    collections::BTreeMap,
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    time::Instant,
};

use analytics_maintenance::{
    ConsolidationReport, DedupReport, DuplicateResolver, IndexConsolidator,
};
use analytics_migrations::{
    DOCUMENTS_TARGET_VERSION, DocumentStoreAdapter, MigrationConfig, MigrationDriver,
    MigrationError, RunStatus, SEARCH_TARGET_VERSION, SchemaVersion, SearchStoreAdapter,
    StoreAdapter, StoreKind, TransformOutcome, chain_for,
};
use analytics_storage::{DEFAULT_SCROLL_BATCH, StoreError};
use clap::{Parser as ClapParser, Subcommand as ClapSubcommand, ValueEnum};
use eyre::{Result, WrapErr};
use serde::Serialize;
use tracing::{Level, info};

use crate::initializers::{MEMORY_STORE, init_search_store, init_stores};

pub const MAX_RETRY_ATTEMPTS: u32 = 3;
const REPORT_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const MAX_RETRY_BASE_DELAY_MS: u64 = 60_000;

#[allow(clippy::upper_case_acronyms)]
#[derive(ClapParser)]
#[command(
    name = "analytics",
    about = "Schema migrations and search index maintenance for the analytics stores"
)]
pub struct CLI {
    #[command(flatten)]
    pub opts: Options,
    #[command(subcommand)]
    pub command: Subcommand,
}

#[derive(ClapParser, Debug, Clone)]
pub struct Options {
    #[arg(
        long = "documents.path",
        default_value = MEMORY_STORE,
        value_name = "PATH",
        env = "ANALYTICS_DOCUMENTS_PATH",
        global = true,
        help = "Document store location.",
        long_help = "Either `memory` or the path of a SQL database file.",
        help_heading = "Store options"
    )]
    pub documents_path: String,
    #[arg(
        long = "search.url",
        default_value = MEMORY_STORE,
        value_name = "URL",
        env = "ANALYTICS_SEARCH_URL",
        global = true,
        help = "Search store location.",
        long_help = "Either `memory` or the base URL of an Elasticsearch node.",
        help_heading = "Store options"
    )]
    pub search_url: String,
    #[arg(
        long = "retry-attempts",
        default_value_t = MAX_RETRY_ATTEMPTS,
        value_parser = clap::value_parser!(u32).range(1..=10),
        env = "ANALYTICS_RETRY_ATTEMPTS",
        global = true,
        help = "Retry budget for transient store failures (1-10, inclusive).",
        help_heading = "Store options"
    )]
    pub retry_attempts: u32,
    #[arg(
        long = "retry-base-delay-ms",
        default_value_t = DEFAULT_RETRY_BASE_DELAY_MS,
        value_parser = clap::value_parser!(u64).range(0..=MAX_RETRY_BASE_DELAY_MS),
        env = "ANALYTICS_RETRY_BASE_DELAY_MS",
        global = true,
        help = "Initial retry backoff delay in milliseconds (0-60000).",
        help_heading = "Store options"
    )]
    pub retry_base_delay_ms: u64,
    #[arg(
        long = "target.documents",
        default_value_t = DOCUMENTS_TARGET_VERSION.0,
        value_parser = clap::value_parser!(u32).range(1..),
        value_name = "VERSION",
        env = "ANALYTICS_TARGET_DOCUMENTS",
        global = true,
        help = "Schema version the document store is migrated to.",
        help_heading = "Migration options"
    )]
    pub target_documents: u32,
    #[arg(
        long = "target.search",
        default_value_t = SEARCH_TARGET_VERSION.0,
        value_parser = clap::value_parser!(u32).range(1..),
        value_name = "VERSION",
        env = "ANALYTICS_TARGET_SEARCH",
        global = true,
        help = "Schema version the search store is migrated to.",
        help_heading = "Migration options"
    )]
    pub target_search: u32,
    #[arg(
        long = "log.level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        env = "ANALYTICS_LOG_LEVEL",
        global = true,
        help = "The verbosity level used for logs.",
        long_help = "Possible values: info, debug, trace, warn, error",
        help_heading = "Output options"
    )]
    pub log_level: Level,
    #[arg(
        long = "json",
        default_value_t = false,
        global = true,
        help = "Emit machine-readable JSON output.",
        help_heading = "Output options"
    )]
    pub json: bool,
    #[arg(
        long = "report-file",
        value_name = "PATH",
        env = "ANALYTICS_REPORT_FILE",
        global = true,
        help = "Optional path to append emitted reports (JSON lines in --json mode).",
        help_heading = "Output options"
    )]
    pub report_file: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            documents_path: MEMORY_STORE.to_owned(),
            search_url: MEMORY_STORE.to_owned(),
            retry_attempts: MAX_RETRY_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            target_documents: DOCUMENTS_TARGET_VERSION.0,
            target_search: SEARCH_TARGET_VERSION.0,
            log_level: Level::INFO,
            json: false,
            report_file: None,
        }
    }
}

impl Options {
    pub fn target(&self, store: StoreKind) -> SchemaVersion {
        match store {
            StoreKind::Documents => SchemaVersion(self.target_documents),
            StoreKind::Search => SchemaVersion(self.target_search),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreSelection {
    Documents,
    Search,
    All,
}

impl StoreSelection {
    /// Stores to migrate, documents first since search transformers may require them.
    pub fn stores(self) -> Vec<StoreKind> {
        match self {
            Self::Documents => vec![StoreKind::Documents],
            Self::Search => vec![StoreKind::Search],
            Self::All => vec![StoreKind::Documents, StoreKind::Search],
        }
    }
}

#[derive(ClapSubcommand)]
pub enum Subcommand {
    #[command(
        name = "migrate",
        about = "Bring store schemas up to their target versions"
    )]
    Migrate {
        #[arg(long = "store", value_enum, default_value_t = StoreSelection::All)]
        /// Which store to migrate
        store: StoreSelection,
        #[arg(long = "until-current", default_value_t = false)]
        /// Keep transforming until the target version is reached, instead of a single step
        until_current: bool,
        #[arg(long = "dry-run", default_value_t = false)]
        /// Connect and report the pending transformers without running them
        dry_run: bool,
    },
    #[command(
        name = "dedup",
        visible_alias = "dd",
        about = "Find duplicate traces and optionally delete them"
    )]
    Dedup {
        #[arg(long = "index", value_name = "INDEX")]
        /// Index to scan, repeatable. Every trace index when omitted
        indices: Vec<String>,
        #[arg(long = "remove", default_value_t = false)]
        /// Delete the duplicates found instead of only recording them
        remove: bool,
        #[arg(long = "batch-size", default_value_t = DEFAULT_SCROLL_BATCH)]
        /// Documents fetched per scroll page
        batch_size: usize,
    },
    #[command(
        name = "consolidate",
        about = "Merge per-activity indices into their root index"
    )]
    Consolidate {
        #[arg(long = "index", value_name = "INDEX")]
        /// Index to consolidate, repeatable. Every trace index when omitted
        indices: Vec<String>,
        #[arg(long = "batch-size", default_value_t = DEFAULT_SCROLL_BATCH)]
        /// Documents fetched per scroll page
        batch_size: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorKind {
    Transient,
    Fatal,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }

    fn retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

fn classify_error_from_message(message: &str) -> (ErrorKind, &'static str) {
    let msg = message.to_ascii_lowercase();
    let transient_markers = ["connection refused", "timed out", "temporar", "unavailable"];
    if transient_markers.iter().any(|marker| msg.contains(marker)) {
        return (ErrorKind::Transient, "message_marker");
    }

    (ErrorKind::Fatal, "default_fatal")
}

fn classify_io_error_kind(kind: std::io::ErrorKind) -> ErrorKind {
    use std::io::ErrorKind as IoErrorKind;

    match kind {
        IoErrorKind::WouldBlock
        | IoErrorKind::TimedOut
        | IoErrorKind::Interrupted
        | IoErrorKind::ConnectionRefused
        | IoErrorKind::ConnectionReset
        | IoErrorKind::ConnectionAborted
        | IoErrorKind::NotConnected
        | IoErrorKind::BrokenPipe => ErrorKind::Transient,
        _ => ErrorKind::Fatal,
    }
}

fn store_errors(error: &eyre::Report) -> impl Iterator<Item = &StoreError> {
    error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<StoreError>())
}

fn classify_error_from_report(error: &eyre::Report) -> (ErrorKind, &'static str) {
    let migration_error = error.downcast_ref::<MigrationError>();
    if migration_error.is_some_and(MigrationError::is_inconsistent) {
        return (ErrorKind::Fatal, "inconsistent_store");
    }

    if let Some(store_error) = store_errors(error).next() {
        let kind = if store_error.is_retryable()
            || matches!(store_error, StoreError::RetryExhausted { .. })
        {
            ErrorKind::Transient
        } else {
            ErrorKind::Fatal
        };
        return (kind, "store_error");
    }

    if migration_error.is_some() {
        return (ErrorKind::Fatal, "migration_error");
    }

    if let Some(io_error) = error.downcast_ref::<std::io::Error>() {
        return (classify_io_error_kind(io_error.kind()), "io_kind");
    }

    classify_error_from_message(&format!("{error:#}"))
}

fn retry_attempts_used(error: &eyre::Report) -> Option<u32> {
    store_errors(error).find_map(|store_error| match store_error {
        StoreError::RetryExhausted { attempts, .. } => Some(*attempts),
        _ => None,
    })
}

#[derive(Serialize)]
struct FailureReport {
    schema_version: u32,
    status: &'static str,
    phase: &'static str,
    failed_phase: Option<String>,
    error_type: &'static str,
    error_classification: &'static str,
    retryable: bool,
    inconsistent: bool,
    retry_attempts: u32,
    retry_attempts_used: Option<u32>,
    error: String,
    elapsed_ms: u64,
}

fn elapsed_ms(started_at: Instant) -> u64 {
    started_at.elapsed().as_millis() as u64
}

fn build_failure_report(
    error: &eyre::Report,
    started_at: Instant,
    retry_attempts: u32,
) -> FailureReport {
    let migration_error = error.downcast_ref::<MigrationError>();
    let (error_kind, error_classification) = classify_error_from_report(error);

    FailureReport {
        schema_version: REPORT_SCHEMA_VERSION,
        status: "failed",
        phase: "execution",
        failed_phase: migration_error
            .and_then(MigrationError::phase)
            .map(|phase| phase.to_string()),
        error_type: error_kind.as_str(),
        error_classification,
        retryable: error_kind.retryable(),
        inconsistent: migration_error.is_some_and(MigrationError::is_inconsistent),
        retry_attempts,
        retry_attempts_used: retry_attempts_used(error),
        error: format!("{error:#}"),
        elapsed_ms: elapsed_ms(started_at),
    }
}

pub fn emit_error_report(
    json: bool,
    retry_attempts: u32,
    started_at: Instant,
    error: &eyre::Report,
    report_file: Option<&Path>,
) {
    if json {
        let report = build_failure_report(error, started_at, retry_attempts);

        match serde_json::to_string(&report) {
            Ok(encoded) => {
                println!("{encoded}");
                if let Err(write_error) = append_report_line(report_file, &encoded) {
                    eprintln!("Run failed: {error:#}\nCannot write report file: {write_error:#}");
                }
            }
            Err(ser_error) => {
                eprintln!("Run failed: {error:#}\nReport encoding failed: {ser_error}")
            }
        }
        return;
    }

    let inconsistent = error
        .downcast_ref::<MigrationError>()
        .is_some_and(MigrationError::is_inconsistent);
    let line = if inconsistent {
        format!(
            "Run failed after {}ms and the store may be INCONSISTENT, manual repair required: {error:#}",
            elapsed_ms(started_at)
        )
    } else {
        format!("Run failed after {}ms: {error:#}", elapsed_ms(started_at))
    };
    eprintln!("{line}");
    if let Err(write_error) = append_report_line(report_file, &line) {
        eprintln!("Cannot write report file: {write_error:#}");
    }
}

fn append_report_line(report_file: Option<&Path>, line: &str) -> Result<()> {
    let Some(path) = report_file else {
        return Ok(());
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("Cannot create report directory {parent:?}"))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .wrap_err_with(|| format!("Cannot open report file {path:?}"))?;
    writeln!(file, "{line}").wrap_err_with(|| format!("Cannot write report file {path:?}"))?;
    Ok(())
}

/// A run result printable as one JSON line or as human-readable lines.
trait Report: Serialize {
    fn summary_lines(&self) -> Vec<String>;
}

fn emit_report(report: &impl Report, json: bool, report_file: Option<&Path>) -> Result<()> {
    if json {
        let encoded = serde_json::to_string(report).wrap_err("Cannot serialize report")?;
        println!("{encoded}");
        append_report_line(report_file, &encoded)?;
        return Ok(());
    }

    for line in report.summary_lines() {
        println!("{line}");
        append_report_line(report_file, &line)?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct StoreMigrationReport {
    store: StoreKind,
    status: RunStatus,
    from: SchemaVersion,
    current: SchemaVersion,
    target: SchemaVersion,
    next_version: Option<SchemaVersion>,
    required_versions: BTreeMap<StoreKind, SchemaVersion>,
    transforms: Vec<TransformOutcome>,
}

impl StoreMigrationReport {
    fn summary_line(&self, dry_run: bool) -> String {
        let store = self.store;
        match (self.status, self.next_version) {
            (RunStatus::Ok, _) if self.transforms.is_empty() => format!(
                "{store} store is already up to date (version {})",
                self.current
            ),
            (RunStatus::Ok, _) => format!(
                "{store} store migrated from version {} to {} in {} step(s)",
                self.from,
                self.current,
                self.transforms.len()
            ),
            (_, Some(next)) if dry_run => format!(
                "{store} store plan: version {} -> {next} (target {}){}",
                self.current,
                self.target,
                requirements_suffix(&self.required_versions)
            ),
            (_, next) => format!(
                "{store} store at version {} after {} step(s), next {} (target {}). Run again to continue.",
                self.current,
                self.transforms.len(),
                next.map(|version| version.to_string()).unwrap_or_else(|| "none".to_owned()),
                self.target
            ),
        }
    }
}

fn requirements_suffix(required: &BTreeMap<StoreKind, SchemaVersion>) -> String {
    if required.is_empty() {
        return String::new();
    }
    let list: Vec<String> = required
        .iter()
        .map(|(store, version)| format!("{store} >= {version}"))
        .collect();
    format!(", requires {}", list.join(", "))
}

#[derive(Debug, Serialize)]
struct MigrationReport {
    schema_version: u32,
    status: &'static str,
    phase: &'static str,
    dry_run: bool,
    stores: Vec<StoreMigrationReport>,
    elapsed_ms: u64,
    retry_attempts: u32,
}

impl MigrationReport {
    fn new(
        stores: Vec<StoreMigrationReport>,
        dry_run: bool,
        started_at: Instant,
        retry_attempts: u32,
    ) -> Self {
        let all_current = stores.iter().all(|store| store.status == RunStatus::Ok);
        let transformed = stores.iter().any(|store| !store.transforms.is_empty());
        let (status, phase) = match (dry_run, all_current, transformed) {
            (_, true, false) => ("up_to_date", "planning"),
            (true, _, _) => ("planned", "planning"),
            (false, true, true) => ("completed", "execution"),
            (false, false, _) => ("pending", "execution"),
        };
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            status,
            phase,
            dry_run,
            stores,
            elapsed_ms: elapsed_ms(started_at),
            retry_attempts,
        }
    }
}

impl Report for MigrationReport {
    fn summary_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .stores
            .iter()
            .map(|store| store.summary_line(self.dry_run))
            .collect();
        for store in &self.stores {
            for outcome in &store.transforms {
                if let Some(clean_error) = &outcome.clean_error {
                    lines.push(format!(
                        "Warning: cleanup after {} {} -> {} failed, temporary copies may remain: {clean_error}",
                        outcome.store, outcome.from, outcome.to
                    ));
                }
            }
        }
        if self.dry_run {
            lines.push("Dry-run complete: no data was written.".to_owned());
        }
        lines
    }
}

#[derive(Debug, Serialize)]
struct ToolReport<T> {
    schema_version: u32,
    status: &'static str,
    phase: &'static str,
    tool: &'static str,
    #[serde(flatten)]
    result: T,
    elapsed_ms: u64,
    retry_attempts: u32,
}

impl<T> ToolReport<T> {
    fn new(
        tool: &'static str,
        result: T,
        failed: usize,
        started_at: Instant,
        retry_attempts: u32,
    ) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            status: if failed == 0 {
                "completed"
            } else {
                "completed_with_errors"
            },
            phase: "execution",
            tool,
            result,
            elapsed_ms: elapsed_ms(started_at),
            retry_attempts,
        }
    }
}

impl Report for ToolReport<DedupReport> {
    fn summary_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .result
            .indices
            .iter()
            .map(|index| match &index.error {
                Some(error) => format!("{}: failed: {error}", index.index),
                None => format!(
                    "{}: scanned {} trace(s), {} duplicate(s)",
                    index.index, index.scanned, index.duplicates
                ),
            })
            .collect();
        match &self.result.removal {
            Some(removal) => lines.push(format!(
                "Removed {} duplicate(s), {} already gone, {} failed.",
                removal.removed, removal.already_missing, removal.failed
            )),
            None => lines.push(format!(
                "Found {} duplicate(s). Run again with --remove to delete them.",
                self.result.duplicates()
            )),
        }
        lines
    }
}

impl Report for ToolReport<ConsolidationReport> {
    fn summary_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .result
            .indices
            .iter()
            .map(|index| match (&index.error, &index.root) {
                (Some(error), _) => format!("{}: failed: {error}", index.index),
                (None, None) => format!("{}: no foreign traces, skipped", index.index),
                (None, Some(root)) => format!(
                    "{} -> {root}: moved {} trace(s), copied {} result(s), rewrote {} visualization(s), {} failure(s), deleted [{}]",
                    index.index,
                    index.traces_moved,
                    index.results_copied,
                    index.visualizations_rewritten,
                    index.failures.len(),
                    index.deleted.join(", ")
                ),
            })
            .collect();
        lines.push(format!(
            "Consolidated {} of {} index(es).",
            self.result.merged(),
            self.result.indices.len()
        ));
        lines
    }
}

impl Subcommand {
    pub async fn run(&self, opts: &Options) -> Result<()> {
        let started_at = Instant::now();
        match self {
            Self::Migrate {
                store,
                until_current,
                dry_run,
            } => {
                let report = migrate(opts, *store, *until_current, *dry_run, started_at).await?;
                emit_report(&report, opts.json, opts.report_file.as_deref())
            }
            Self::Dedup {
                indices,
                remove,
                batch_size,
            } => {
                let search = init_search_store(opts).await?;
                let result = DuplicateResolver::new(search)
                    .with_batch_size(*batch_size)
                    .run(indices, *remove)
                    .await
                    .wrap_err("Deduplication failed")?;
                let failed = result.failed_indices();
                let report =
                    ToolReport::new("dedup", result, failed, started_at, opts.retry_attempts);
                emit_report(&report, opts.json, opts.report_file.as_deref())
            }
            Self::Consolidate {
                indices,
                batch_size,
            } => {
                let search = init_search_store(opts).await?;
                let result = IndexConsolidator::new(search)
                    .with_batch_size(*batch_size)
                    .run(indices)
                    .await
                    .wrap_err("Consolidation failed")?;
                let failed = result.failed_indices();
                let report = ToolReport::new(
                    "consolidate",
                    result,
                    failed,
                    started_at,
                    opts.retry_attempts,
                );
                emit_report(&report, opts.json, opts.report_file.as_deref())
            }
        }
    }
}

async fn migrate(
    opts: &Options,
    selection: StoreSelection,
    until_current: bool,
    dry_run: bool,
    started_at: Instant,
) -> Result<MigrationReport> {
    let (documents, search) = init_stores(opts).await?;
    let config = MigrationConfig::new(documents, search);
    info!(run_id = %config.run_id, ?selection, until_current, dry_run, "Starting migration");

    let mut stores = Vec::new();
    for store in selection.stores() {
        let report = match store {
            StoreKind::Documents => {
                migrate_store(DocumentStoreAdapter, opts, &config, until_current, dry_run).await?
            }
            StoreKind::Search => {
                migrate_store(SearchStoreAdapter, opts, &config, until_current, dry_run).await?
            }
        };
        stores.push(report);
    }
    Ok(MigrationReport::new(
        stores,
        dry_run,
        started_at,
        opts.retry_attempts,
    ))
}

/// Refreshes one store and runs its pending transformers: none on a dry run,
/// one step by default, every step with `until_current`.
async fn migrate_store<A: StoreAdapter>(
    adapter: A,
    opts: &Options,
    config: &MigrationConfig,
    until_current: bool,
    dry_run: bool,
) -> Result<StoreMigrationReport> {
    let store = adapter.kind();
    let chain = chain_for(store).wrap_err_with(|| format!("Invalid {store} transformer chain"))?;
    let mut driver = MigrationDriver::new(adapter, chain, opts.target(store));
    driver.connect(config.clone()).await?;

    let mut refresh = driver.refresh().await?;
    let from = refresh.current;
    let mut transforms = Vec::new();
    loop {
        if refresh.status == RunStatus::Error {
            return Err(MigrationError::BrokenChain {
                store,
                version: refresh.current,
            }
            .into());
        }
        let stepped = !transforms.is_empty();
        if dry_run || refresh.status == RunStatus::Ok || (stepped && !until_current) {
            break;
        }
        let outcome = driver.transform().await?;
        transforms.push(outcome);
        refresh = driver.refresh().await?;
    }

    Ok(StoreMigrationReport {
        store,
        status: refresh.status,
        from,
        current: refresh.current,
        target: refresh.target,
        next_version: refresh.next_version,
        required_versions: refresh.required_versions,
        transforms,
    })
}
