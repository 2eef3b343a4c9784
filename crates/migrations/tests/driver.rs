use std::sync::{Arc, Mutex};

use analytics_migrations::{
    DOCUMENTS_TARGET_VERSION, DocumentStoreAdapter, MigrationConfig, MigrationDriver,
    MigrationError, Phase, PhaseError, RunStatus, SEARCH_TARGET_VERSION, SchemaVersion,
    SearchStoreAdapter, StoreAdapter, StoreKind, Transformer, TransformerChain,
    TransformerDescriptor, documents_chain, search_chain,
    transformers::{SessionClasses, SessionsToActivities},
};
use analytics_storage::{Document, DocumentStore, SearchStore};
use serde_json::{Value, json};

fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap_or_default()
}

fn config() -> MigrationConfig {
    MigrationConfig::new(DocumentStore::in_memory(), SearchStore::in_memory())
}

#[derive(Debug)]
struct Scripted {
    descriptor: TransformerDescriptor,
    fail: Vec<Phase>,
    calls: Arc<Mutex<Vec<Phase>>>,
}

impl Scripted {
    fn new(fail: &[Phase]) -> (Arc<Self>, Arc<Mutex<Vec<Phase>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let transformer = Arc::new(Self {
            descriptor: TransformerDescriptor::new(StoreKind::Documents, 1, 2),
            fail: fail.to_vec(),
            calls: calls.clone(),
        });
        (transformer, calls)
    }

    fn run(&self, phase: Phase) -> Result<(), PhaseError> {
        self.calls.lock().expect("calls lock").push(phase);
        if self.fail.contains(&phase) {
            return Err(PhaseError::postcondition(format!("{phase} scripted to fail")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transformer for Scripted {
    fn descriptor(&self) -> &TransformerDescriptor {
        &self.descriptor
    }
    async fn backup(&self, _: &mut MigrationConfig) -> Result<(), PhaseError> {
        self.run(Phase::Backup)
    }
    async fn upgrade(&self, _: &mut MigrationConfig) -> Result<(), PhaseError> {
        self.run(Phase::Upgrade)
    }
    async fn check(&self, _: &mut MigrationConfig) -> Result<(), PhaseError> {
        self.run(Phase::Check)
    }
    async fn clean(&self, _: &mut MigrationConfig) -> Result<(), PhaseError> {
        self.run(Phase::Clean)
    }
    async fn restore(&self, _: &mut MigrationConfig) -> Result<(), PhaseError> {
        self.run(Phase::Restore)
    }
}

async fn scripted_driver(
    fail: &[Phase],
) -> (MigrationDriver<DocumentStoreAdapter>, Arc<Mutex<Vec<Phase>>>) {
    let (transformer, calls) = Scripted::new(fail);
    let mut chain = TransformerChain::new(StoreKind::Documents);
    chain.register(transformer).expect("register");
    let mut driver = MigrationDriver::new(DocumentStoreAdapter, chain, SchemaVersion(2));
    driver.connect(config()).await.expect("connect");
    let refresh = driver.refresh().await.expect("refresh");
    assert_eq!(refresh.status, RunStatus::Pending);
    assert_eq!(refresh.next_version, Some(SchemaVersion(2)));
    (driver, calls)
}

fn recorded(calls: &Arc<Mutex<Vec<Phase>>>) -> Vec<Phase> {
    calls.lock().expect("calls lock").clone()
}

#[tokio::test]
async fn successful_transform_runs_phases_in_order_and_persists_destination() {
    let (mut driver, calls) = scripted_driver(&[]).await;
    let outcome = driver.transform().await.expect("transform");

    assert_eq!(
        recorded(&calls),
        vec![Phase::Backup, Phase::Upgrade, Phase::Check, Phase::Clean]
    );
    assert_eq!((outcome.from, outcome.to), (SchemaVersion(1), SchemaVersion(2)));
    assert!(outcome.clean_error.is_none());
    assert_eq!(
        driver.current_version().await.expect("version"),
        SchemaVersion(2)
    );
    assert_eq!(
        driver.refresh().await.expect("refresh").status,
        RunStatus::Ok
    );
}

#[tokio::test]
async fn failed_upgrade_restores_and_keeps_the_version() {
    let (mut driver, calls) = scripted_driver(&[Phase::Upgrade]).await;
    let err = driver.transform().await.expect_err("upgrade fails");

    assert!(matches!(err, MigrationError::Upgrade { .. }));
    assert_eq!(
        recorded(&calls),
        vec![Phase::Backup, Phase::Upgrade, Phase::Restore]
    );
    assert_eq!(
        driver.current_version().await.expect("version"),
        SchemaVersion(1)
    );
}

#[tokio::test]
async fn failed_check_restores() {
    let (mut driver, calls) = scripted_driver(&[Phase::Check]).await;
    let err = driver.transform().await.expect_err("check fails");

    assert!(matches!(err, MigrationError::Check { .. }));
    assert_eq!(recorded(&calls).last(), Some(&Phase::Restore));
}

#[tokio::test]
async fn failed_restore_escalates() {
    let (mut driver, _) = scripted_driver(&[Phase::Upgrade, Phase::Restore]).await;
    let err = driver.transform().await.expect_err("restore fails");

    assert!(err.is_inconsistent());
    assert_eq!(err.phase(), Some(Phase::Restore));
    assert!(matches!(
        err,
        MigrationError::Restore {
            failed_phase: Phase::Upgrade,
            ..
        }
    ));
}

#[tokio::test]
async fn failed_clean_is_not_fatal() {
    let (mut driver, _) = scripted_driver(&[Phase::Clean]).await;
    let outcome = driver.transform().await.expect("transform");

    assert!(outcome.clean_error.is_some());
    assert_eq!(
        driver.current_version().await.expect("version"),
        SchemaVersion(2)
    );
}

#[tokio::test]
async fn failed_backup_neither_cleans_nor_restores() {
    let (mut driver, calls) = scripted_driver(&[Phase::Backup]).await;
    let err = driver.transform().await.expect_err("backup fails");

    assert!(matches!(err, MigrationError::Backup { .. }));
    assert_eq!(recorded(&calls), vec![Phase::Backup]);
    assert_eq!(
        driver.current_version().await.expect("version"),
        SchemaVersion(1)
    );
}

#[tokio::test]
async fn restore_never_uses_a_backup_left_by_the_previous_step() {
    let mut config = config();
    config
        .documents
        .insert("sessions", doc(json!({ "_id": "s1", "name": "s1" })))
        .await
        .expect("seed session");

    // 1 -> 2 succeeds but its clean never runs, leaving its copies behind
    let first = SessionClasses::default();
    first.backup(&mut config).await.expect("backup");
    first.upgrade(&mut config).await.expect("upgrade");
    first.check(&mut config).await.expect("check");
    DocumentStoreAdapter
        .set_model_version(&config, SchemaVersion(2))
        .await
        .expect("version 2");

    // 2 -> 3 fails after its upgrade and is rolled back
    config.state = Default::default();
    let second = SessionsToActivities::default();
    second.backup(&mut config).await.expect("backup");
    second.upgrade(&mut config).await.expect("upgrade");
    second.restore(&mut config).await.expect("restore");

    let sessions = config.documents.find_all("sessions").await.expect("read");
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0]["classId"].is_string());
    assert!(!config.documents.collection_exists("activities").await.expect("exists"));
    let collections = config.documents.list_collections().await.expect("list");
    assert!(collections.contains(&"backup_v1_sessions".to_owned()));
}

#[tokio::test]
async fn unknown_version_reports_a_broken_chain() {
    let config = config();
    DocumentStoreAdapter
        .set_model_version(&config, SchemaVersion(7))
        .await
        .expect("seed version");
    let mut driver = MigrationDriver::new(
        DocumentStoreAdapter,
        documents_chain().expect("chain"),
        DOCUMENTS_TARGET_VERSION,
    );
    driver.connect(config).await.expect("connect");

    let refresh = driver.refresh().await.expect("refresh");
    assert_eq!(refresh.status, RunStatus::Error);
    assert!(matches!(
        driver.transform().await,
        Err(MigrationError::BrokenChain { .. })
    ));
}

#[tokio::test]
async fn transform_without_refresh_is_rejected() {
    let mut driver = MigrationDriver::new(
        DocumentStoreAdapter,
        documents_chain().expect("chain"),
        DOCUMENTS_TARGET_VERSION,
    );
    assert!(matches!(
        driver.refresh().await,
        Err(MigrationError::NotConnected)
    ));
    driver.connect(config()).await.expect("connect");
    assert!(matches!(
        driver.transform().await,
        Err(MigrationError::NothingPending { .. })
    ));
}

#[tokio::test]
async fn document_store_walks_the_whole_chain_one_step_at_a_time() {
    let config = config();
    config
        .documents
        .insert(
            "sessions",
            doc(json!({ "_id": "s1", "name": "s1", "gameId": "g", "versionId": "v" })),
        )
        .await
        .expect("seed session");
    let mut driver = MigrationDriver::new(
        DocumentStoreAdapter,
        documents_chain().expect("chain"),
        DOCUMENTS_TARGET_VERSION,
    );
    driver.connect(config).await.expect("connect");

    let mut steps = Vec::new();
    loop {
        let refresh = driver.refresh().await.expect("refresh");
        if refresh.status == RunStatus::Ok {
            break;
        }
        let outcome = driver.transform().await.expect("transform");
        assert!(outcome.to > outcome.from);
        assert_eq!(
            driver.current_version().await.expect("version"),
            outcome.to
        );
        steps.push(outcome.to);
    }
    assert_eq!(
        steps,
        vec![SchemaVersion(2), SchemaVersion(3), SchemaVersion(4)]
    );

    let documents = &driver.config().expect("connected").documents;
    let activity = &documents.find_all("activities").await.expect("read")[0];
    assert_eq!(activity["open"], json!(true));
    assert!(activity["classId"].is_string());
    let collections = documents.list_collections().await.expect("list");
    assert!(collections.iter().all(|name| !name.starts_with("backup_")));
}

#[tokio::test]
async fn search_transform_waits_for_the_document_store() {
    let config = config();
    config
        .search
        .bulk_index(
            "act1",
            vec![("t1".to_owned(), doc(json!({ "timestamp": 1, "coins": 2 })))],
        )
        .await
        .expect("seed traces");
    let mut driver = MigrationDriver::new(
        SearchStoreAdapter,
        search_chain().expect("chain"),
        SEARCH_TARGET_VERSION,
    );
    driver.connect(config.clone()).await.expect("connect");

    let refresh = driver.refresh().await.expect("refresh");
    assert_eq!(
        refresh.required_versions.get(&StoreKind::Documents),
        Some(&SchemaVersion(2))
    );
    let err = driver.transform().await.expect_err("documents still at 1");
    assert!(matches!(
        err,
        MigrationError::RequirementNotMet {
            found: SchemaVersion(1),
            ..
        }
    ));
    let indices = config.search.list_indices().await.expect("list");
    assert_eq!(indices, vec!["act1".to_owned()]);

    DocumentStoreAdapter
        .set_model_version(&config, SchemaVersion(2))
        .await
        .expect("bump documents");
    driver.refresh().await.expect("refresh");
    driver.transform().await.expect("transform");
    assert_eq!(
        driver.current_version().await.expect("version"),
        SEARCH_TARGET_VERSION
    );
}
