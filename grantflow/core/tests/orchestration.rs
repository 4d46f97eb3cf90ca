//! End-to-end orchestration tests against the in-memory backend with
//! scripted sources.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use grantflow_core::catalog::{CatalogSource, CatalogSyncEngine, CatalogValidator};
use grantflow_core::extract::{
    EntitySpec, FetchError, PageFetcher, PageRequest, Prerequisite, RetryPolicy, SourceRegistry,
};
use grantflow_core::orchestrate::{OrchestrateError, Orchestrator, RunRequest};
use grantflow_core::tracker::ExecutionTracker;
use grantflow_schemas::{
    CatalogEntry, CatalogTable, Execution, ExecutionEventKind, ExecutionStatus, ExecutionType,
    RunOptions, SourcePage, CATALOG_ENTITY,
};
use grantflow_storage::{MemoryStore, Store};
use serde_json::json;
use tokio::sync::{mpsc, Mutex, Semaphore};
use url::Url;

fn record(id: u64, date: &str) -> serde_json::Value {
    json!({
        "id": id,
        "grantDate": date,
        "beneficiary": "ACME SL",
        "amount": 100.0
    })
}

fn page(records: Vec<serde_json::Value>, total: u64) -> SourcePage {
    SourcePage {
        content: records,
        total_elements: total,
    }
}

/// Fetcher scripted per endpoint path; unscripted sources serve no records
struct ScriptedSources {
    pages: Mutex<HashMap<&'static str, Vec<Result<SourcePage, FetchError>>>>,
}

impl ScriptedSources {
    fn new(pages: HashMap<&'static str, Vec<Result<SourcePage, FetchError>>>) -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(pages),
        })
    }

    fn empty() -> Arc<Self> {
        Self::new(HashMap::new())
    }
}

#[async_trait]
impl PageFetcher for ScriptedSources {
    async fn fetch_page(&self, request: &PageRequest) -> Result<SourcePage, FetchError> {
        let mut pages = self.pages.lock().await;
        for (path, responses) in pages.iter_mut() {
            if request.endpoint.path().contains(path) {
                if responses.is_empty() {
                    return Ok(SourcePage::default());
                }
                return responses.remove(0);
            }
        }
        Ok(SourcePage::default())
    }
}

/// Catalog source serving one entry per table
struct StubCatalogs;

#[async_trait]
impl CatalogSource for StubCatalogs {
    async fn fetch_table(&self, table: CatalogTable) -> Result<Vec<CatalogEntry>, FetchError> {
        Ok(vec![CatalogEntry::new(
            format!("{}-0", table.as_str()),
            "entry",
        )])
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    }
}

fn build_orchestrator(
    store: Arc<MemoryStore>,
    fetcher: Arc<dyn PageFetcher>,
    registry: SourceRegistry,
) -> (Arc<Orchestrator>, Arc<ExecutionTracker>) {
    let tracker = Arc::new(ExecutionTracker::new(store.clone()));
    let catalog_source: Arc<dyn CatalogSource> = Arc::new(StubCatalogs);
    let engine = CatalogSyncEngine::new(store.clone(), tracker.clone(), catalog_source);
    let validator = CatalogValidator::new(store.clone());
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        tracker.clone(),
        registry,
        fetcher,
        engine,
        validator,
        Url::parse("https://api.example.gov/v2/").unwrap(),
        fast_retry(),
    ));
    (orchestrator, tracker)
}

async fn seed_fresh_catalogs(store: &MemoryStore) {
    let mut sync = Execution::new(ExecutionType::SyncCatalogs, CATALOG_ENTITY, None);
    sync.status = ExecutionStatus::Completed;
    sync.finished_at = Some(Utc::now());
    store.insert_execution(&sync).await.unwrap();
}

fn seeding_request(sources: &[&str]) -> RunRequest {
    let mut request = RunRequest::seeding("concessions", 2024, RunOptions::default());
    request.sources = sources.iter().map(|s| s.to_string()).collect();
    request
}

#[tokio::test]
async fn successful_run_loads_and_completes() {
    let store = Arc::new(MemoryStore::new());
    seed_fresh_catalogs(&store).await;

    let fetcher = ScriptedSources::new(HashMap::from([(
        "concessions",
        vec![Ok(page(
            vec![record(1, "2024-02-01"), record(2, "2024-03-01")],
            2,
        ))],
    )]));

    let (orchestrator, _) = build_orchestrator(store.clone(), fetcher, SourceRegistry::standard());
    let execution = orchestrator
        .run(seeding_request(&["ordinary"]))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.progress_percentage, 100);
    assert_eq!(execution.counts.processed, 2);
    assert_eq!(execution.counts.inserted, 2);
    assert_eq!(store.concession_count().await.unwrap(), 2);
}

#[tokio::test]
async fn rerunning_the_same_year_inserts_nothing_new() {
    let store = Arc::new(MemoryStore::new());
    seed_fresh_catalogs(&store).await;

    let script = || {
        HashMap::from([(
            "concessions",
            vec![Ok(page(vec![record(1, "2024-02-01")], 1))],
        )])
    };

    let (orchestrator, _) = build_orchestrator(
        store.clone(),
        ScriptedSources::new(script()),
        SourceRegistry::standard(),
    );
    orchestrator
        .run(seeding_request(&["ordinary"]))
        .await
        .unwrap();

    let (orchestrator, _) = build_orchestrator(
        store.clone(),
        ScriptedSources::new(script()),
        SourceRegistry::standard(),
    );
    let second = orchestrator
        .run(seeding_request(&["ordinary"]))
        .await
        .unwrap();

    assert_eq!(second.status, ExecutionStatus::Completed);
    assert_eq!(second.counts.inserted, 0);
    assert_eq!(store.concession_count().await.unwrap(), 1);
}

#[tokio::test]
async fn same_grant_from_two_sources_is_kept_once_per_regime() {
    let store = Arc::new(MemoryStore::new());
    seed_fresh_catalogs(&store).await;

    // the identical grant reported by the ordinary and minimis endpoints
    let fetcher = ScriptedSources::new(HashMap::from([
        (
            "concessions",
            vec![Ok(page(vec![record(123, "2024-05-15")], 1))],
        ),
        (
            "minimis",
            vec![Ok(page(vec![record(123, "2024-05-15")], 1))],
        ),
    ]));

    let (orchestrator, _) = build_orchestrator(store.clone(), fetcher, SourceRegistry::standard());
    let execution = orchestrator
        .run(seeding_request(&["ordinary", "minimis"]))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(store.concession_count().await.unwrap(), 2);
}

#[tokio::test]
async fn duplicate_active_run_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    seed_fresh_catalogs(&store).await;

    let mut active = Execution::new(ExecutionType::Seeding, "concessions", Some(2024));
    active.status = ExecutionStatus::Running;
    store.insert_execution(&active).await.unwrap();

    let (orchestrator, _) = build_orchestrator(
        store.clone(),
        ScriptedSources::empty(),
        SourceRegistry::standard(),
    );
    let error = orchestrator
        .run(seeding_request(&["ordinary"]))
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        OrchestrateError::DuplicateActiveRun { execution_id, .. } if execution_id == active.id
    ));

    // a different year is not blocked
    let mut other_year = seeding_request(&["ordinary"]);
    other_year.year = 2023;
    let execution = orchestrator.run(other_year).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn catalog_gate_failure_writes_no_records() {
    let store = Arc::new(MemoryStore::new());
    // no successful catalog sync on record -> catalogs obsolete

    struct BrokenCatalogs;
    #[async_trait]
    impl CatalogSource for BrokenCatalogs {
        async fn fetch_table(&self, _: CatalogTable) -> Result<Vec<CatalogEntry>, FetchError> {
            Err(FetchError::Permanent("catalog endpoint gone".into()))
        }
    }

    let tracker = Arc::new(ExecutionTracker::new(store.clone()));
    let engine = CatalogSyncEngine::new(store.clone(), tracker.clone(), Arc::new(BrokenCatalogs));
    let validator = CatalogValidator::new(store.clone());
    let fetcher = ScriptedSources::new(HashMap::from([(
        "concessions",
        vec![Ok(page(vec![record(1, "2024-02-01")], 1))],
    )]));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        tracker,
        SourceRegistry::standard(),
        fetcher,
        engine,
        validator,
        Url::parse("https://api.example.gov/v2/").unwrap(),
        fast_retry(),
    ));

    let error = orchestrator
        .run(seeding_request(&["ordinary"]))
        .await
        .unwrap_err();
    assert!(matches!(error, OrchestrateError::Catalog(_)));

    // fail-fast: zero canonical records written for the run
    assert_eq!(store.concession_count().await.unwrap(), 0);

    let failed = store
        .list_executions(&grantflow_storage::ExecutionFilter {
            status: Some(ExecutionStatus::Failed),
            execution_type: Some(ExecutionType::Seeding),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("catalog"));
}

#[tokio::test]
async fn stale_catalogs_are_synced_before_the_load() {
    let store = Arc::new(MemoryStore::new());
    // never synced -> the run must trigger a catalog sync first

    let fetcher = ScriptedSources::new(HashMap::from([(
        "concessions",
        vec![Ok(page(vec![record(1, "2024-02-01")], 1))],
    )]));
    let (orchestrator, _) = build_orchestrator(store.clone(), fetcher, SourceRegistry::standard());

    let execution = orchestrator
        .run(seeding_request(&["ordinary"]))
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);

    // the catalogs were populated and the sync recorded on its own execution
    assert!(store.catalog_count(CatalogTable::Instruments).await.unwrap() > 0);
    let syncs = store
        .list_executions(&grantflow_storage::ExecutionFilter {
            execution_type: Some(ExecutionType::SyncCatalogs),
            status: Some(ExecutionStatus::Completed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(syncs.len(), 1);
}

#[tokio::test]
async fn single_source_failure_keeps_other_sources_data() {
    let store = Arc::new(MemoryStore::new());
    seed_fresh_catalogs(&store).await;

    let fetcher = ScriptedSources::new(HashMap::from([
        (
            "concessions",
            vec![Ok(page(vec![record(1, "2024-02-01")], 1))],
        ),
        (
            "minimis",
            vec![Err(FetchError::Permanent("410 Gone".into()))],
        ),
    ]));

    let (orchestrator, tracker) =
        build_orchestrator(store.clone(), fetcher, SourceRegistry::standard());
    let error = orchestrator
        .run(seeding_request(&["ordinary", "minimis"]))
        .await
        .unwrap_err();

    let execution_id = match error {
        OrchestrateError::SourceFailed { ref source, .. } => {
            assert_eq!(source, "minimis");
            let failed = store
                .list_executions(&grantflow_storage::ExecutionFilter {
                    status: Some(ExecutionStatus::Failed),
                    ..Default::default()
                })
                .await
                .unwrap();
            failed[0].id
        }
        other => panic!("expected SourceFailed, got {other}"),
    };

    // partial success: the ordinary source's batch stays committed
    assert_eq!(store.concession_count().await.unwrap(), 1);
    let execution = tracker.get(execution_id).await.unwrap();
    assert!(execution.error_message.as_deref().unwrap().contains("minimis"));
    assert_eq!(execution.counts.inserted, 1);
}

#[tokio::test]
async fn parallel_run_accumulates_counts_from_all_workers() {
    let store = Arc::new(MemoryStore::new());
    seed_fresh_catalogs(&store).await;

    let fetcher = ScriptedSources::new(HashMap::from([
        (
            "concessions",
            vec![Ok(page(vec![record(1, "2024-02-01"), record(2, "2024-02-02")], 2))],
        ),
        (
            "minimis",
            vec![Ok(page(vec![record(3, "2024-03-01")], 1))],
        ),
        (
            "stateaid",
            vec![Ok(page(vec![record(4, "2024-04-01")], 1))],
        ),
    ]));

    let (orchestrator, _) = build_orchestrator(store.clone(), fetcher, SourceRegistry::standard());
    let mut request = seeding_request(&["ordinary", "minimis", "state_aid"]);
    request.options.parallel = true;
    request.options.workers = 2;

    let execution = orchestrator.run(request).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.counts.processed, 4);
    assert_eq!(execution.counts.inserted, 4);
    assert_eq!(store.concession_count().await.unwrap(), 4);
}

#[tokio::test]
async fn progress_never_decreases_during_a_run() {
    let store = Arc::new(MemoryStore::new());
    seed_fresh_catalogs(&store).await;

    let fetcher = ScriptedSources::new(HashMap::from([(
        "concessions",
        vec![
            Ok(page(vec![record(1, "2024-01-10"), record(2, "2024-01-11")], 6)),
            Ok(page(vec![record(3, "2024-02-10"), record(4, "2024-02-11")], 6)),
            Ok(page(vec![record(5, "2024-03-10"), record(6, "2024-03-11")], 6)),
        ],
    )]));

    let (orchestrator, tracker) =
        build_orchestrator(store.clone(), fetcher, SourceRegistry::standard());
    let mut events = tracker.subscribe();

    let mut request = seeding_request(&["ordinary"]);
    request.options.batch_size = 2;
    let execution = orchestrator.run(request).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let mut last_progress = 0u8;
    while let Ok(event) = events.try_recv() {
        assert!(
            event.snapshot.progress >= last_progress,
            "progress went backwards: {} -> {}",
            last_progress,
            event.snapshot.progress
        );
        last_progress = event.snapshot.progress;
    }
    assert_eq!(last_progress, 100);
}

/// Serves page 0 normally, then signals the test and blocks page 1 until
/// the gate opens. Models an in-flight request finishing after a
/// cancellation arrives.
struct GatedFetcher {
    page_one_reached: mpsc::Sender<()>,
    gate: Semaphore,
}

#[async_trait]
impl PageFetcher for GatedFetcher {
    async fn fetch_page(&self, request: &PageRequest) -> Result<SourcePage, FetchError> {
        if request.page == 0 {
            let records = (0..request.page_size as u64)
                .map(|i| record(i, "2024-02-01"))
                .collect();
            return Ok(page(records, (request.page_size * 3) as u64));
        }

        let _ = self.page_one_reached.send(()).await;
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| FetchError::Permanent("gate closed".into()))?;
        permit.forget();
        Ok(page(
            vec![record(9000 + request.page, "2024-06-01")],
            (request.page_size * 3) as u64,
        ))
    }
}

#[tokio::test]
async fn cancellation_stops_at_the_next_checkpoint_and_keeps_committed_batches() {
    let store = Arc::new(MemoryStore::new());
    seed_fresh_catalogs(&store).await;

    let (page_one_reached, mut page_one_signal) = mpsc::channel(1);
    let fetcher = Arc::new(GatedFetcher {
        page_one_reached,
        gate: Semaphore::new(0),
    });

    let (orchestrator, tracker) =
        build_orchestrator(store.clone(), fetcher.clone(), SourceRegistry::standard());

    let mut request = seeding_request(&["ordinary"]);
    request.options.batch_size = 2;
    let pending = orchestrator.start(request).await.unwrap();

    // page 0 is committed once the extractor asks for page 1
    page_one_signal.recv().await.unwrap();
    assert!(orchestrator.cancel(pending.id).await);
    // let the in-flight page-1 request finish; its batch must NOT be loaded
    fetcher.gate.add_permits(1);

    // wait for the cooperative stop to land
    let mut status = ExecutionStatus::Running;
    for _ in 0..100 {
        status = tracker.get(pending.id).await.unwrap().status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(status, ExecutionStatus::Cancelled);
    // only the first page's batch remains queryable
    assert_eq!(store.concession_count().await.unwrap(), 2);
}

#[tokio::test]
async fn retry_creates_a_successor_and_replaces_history() {
    let store = Arc::new(MemoryStore::new());
    seed_fresh_catalogs(&store).await;

    // first run fails on its only source
    let fetcher = ScriptedSources::new(HashMap::from([(
        "concessions",
        vec![Err(FetchError::Permanent("boom".into()))],
    )]));
    let (orchestrator, tracker) =
        build_orchestrator(store.clone(), fetcher, SourceRegistry::standard());
    let error = orchestrator
        .run(seeding_request(&["ordinary"]))
        .await
        .unwrap_err();
    assert!(matches!(error, OrchestrateError::SourceFailed { .. }));

    let failed = store
        .list_executions(&grantflow_storage::ExecutionFilter {
            status: Some(ExecutionStatus::Failed),
            ..Default::default()
        })
        .await
        .unwrap();
    let failed_id = failed[0].id;

    // retry spawns a fresh execution referencing the failed one
    let successor = orchestrator
        .start_retry(failed_id, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(successor.predecessor, Some(failed_id));

    let mut old_status = ExecutionStatus::Failed;
    for _ in 0..100 {
        old_status = tracker.get(failed_id).await.unwrap().status;
        let new = tracker.get(successor.id).await.unwrap();
        if new.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(old_status, ExecutionStatus::Replaced);
}

#[tokio::test]
async fn prerequisite_gate_blocks_until_satisfied() {
    let store = Arc::new(MemoryStore::new());
    seed_fresh_catalogs(&store).await;

    let mut registry = SourceRegistry::standard();
    let mut spec = registry.get("concessions").unwrap().clone();
    spec.prerequisite = Some(Prerequisite {
        entity: "calls".to_string(),
        execution_type: ExecutionType::Seeding,
    });
    registry.register(spec.clone());
    registry.register(EntitySpec {
        entity: "calls".to_string(),
        sources: vec![],
        prerequisite: None,
    });

    let fetcher = ScriptedSources::new(HashMap::from([(
        "concessions",
        vec![Ok(page(vec![record(1, "2024-02-01")], 1))],
    )]));
    let (orchestrator, _) = build_orchestrator(store.clone(), fetcher, registry);

    let error = orchestrator
        .run(seeding_request(&["ordinary"]))
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        OrchestrateError::PrerequisiteMissing { ref prerequisite, year: 2024 } if prerequisite == "calls"
    ));

    // seed the prerequisite and the run goes through
    let mut calls = Execution::new(ExecutionType::Seeding, "calls", Some(2024));
    calls.status = ExecutionStatus::Completed;
    calls.finished_at = Some(Utc::now());
    store.insert_execution(&calls).await.unwrap();

    let execution = orchestrator
        .run(seeding_request(&["ordinary"]))
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn unknown_entity_and_source_are_rejected() {
    let store = Arc::new(MemoryStore::new());
    let (orchestrator, _) = build_orchestrator(
        store,
        ScriptedSources::empty(),
        SourceRegistry::standard(),
    );

    let mut unknown_entity = RunRequest::seeding("unicorns", 2024, RunOptions::default());
    unknown_entity.sources = vec![];
    assert!(matches!(
        orchestrator.run(unknown_entity).await.unwrap_err(),
        OrchestrateError::UnknownEntity(_)
    ));

    let unknown_source = seeding_request(&["lottery"]);
    assert!(matches!(
        orchestrator.run(unknown_source).await.unwrap_err(),
        OrchestrateError::UnknownSource { .. }
    ));
}

#[tokio::test]
async fn events_report_the_full_lifecycle() {
    let store = Arc::new(MemoryStore::new());
    seed_fresh_catalogs(&store).await;

    let fetcher = ScriptedSources::new(HashMap::from([(
        "concessions",
        vec![Ok(page(vec![record(1, "2024-02-01")], 1))],
    )]));
    let (orchestrator, tracker) =
        build_orchestrator(store.clone(), fetcher, SourceRegistry::standard());
    let mut events = tracker.subscribe();

    orchestrator
        .run(seeding_request(&["ordinary"]))
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    assert_eq!(kinds.first(), Some(&ExecutionEventKind::ProcessStarted));
    assert!(kinds.contains(&ExecutionEventKind::ProcessUpdate));
    assert!(kinds.contains(&ExecutionEventKind::ProcessCompleted));
    assert_eq!(kinds.last(), Some(&ExecutionEventKind::StatsUpdate));
}
