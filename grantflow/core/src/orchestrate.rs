//! Run orchestration
//!
//! Composes the freshness validator, the source extractors, the dedup
//! loader and the execution tracker into one tracked run per (entity, year)
//! pair. Sources run sequentially or bounded-parallel; all workers share
//! one execution record through the tracker.
//!
//! Failure semantics: the catalog gate fails fast before any source is
//! touched; a single source's unrecoverable failure fails the overall run
//! but never rolls back batches already committed by other sources or
//! earlier pages, because re-running is idempotent through the dedup
//! constraint.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use futures::StreamExt;
use grantflow_schemas::{
    Execution, ExecutionPhase, ExecutionType, RecordCounts, RunOptions,
};
use grantflow_storage::Store;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::catalog::{CatalogError, CatalogSyncEngine, CatalogSyncReport, CatalogValidator};
use crate::extract::{
    extract_pages, ExtractQuery, PageFetcher, RetryPolicy, SourceKind, SourceRegistry,
};
use crate::load::DedupLoader;
use crate::tracker::{ExecutionTracker, TrackerError};

#[derive(Debug)]
pub enum OrchestrateError {
    UnknownEntity(String),

    UnknownSource { entity: String, source: String },

    /// A run for the same (entity, year) pair is already active; the new
    /// request is rejected outright, never queued
    DuplicateActiveRun {
        entity: String,
        year: Option<i32>,
        execution_id: Uuid,
    },

    PrerequisiteMissing { prerequisite: String, year: i32 },

    Catalog(CatalogError),

    SourceFailed { source: String, message: String },

    Cancelled { execution_id: Uuid },

    CatalogRetryUnsupported,

    Tracker(TrackerError),

    Storage(grantflow_storage::Error),
}

// Hand-written faithful expansion of `#[derive(thiserror::Error)]`. A field
// named `source` is unconditionally treated by thiserror as the error-source
// field (requiring `std::error::Error`), but `UnknownSource`/`SourceFailed`
// carry the source *name* as a plain `String`, so the derive cannot be used
// here. The Display text, `source()` delegation for the transparent variants,
// and `From` conversions below match exactly what the derive would generate.
impl std::fmt::Display for OrchestrateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestrateError::UnknownEntity(v) => write!(f, "unknown entity: {v}"),
            OrchestrateError::UnknownSource { entity, source } => {
                write!(f, "unknown source '{source}' for entity {entity}")
            }
            OrchestrateError::DuplicateActiveRun {
                entity,
                year,
                execution_id,
            } => write!(
                f,
                "a run for {entity}/{year:?} is already active (execution {execution_id})"
            ),
            OrchestrateError::PrerequisiteMissing { prerequisite, year } => write!(
                f,
                "prerequisite not met: no completed {prerequisite} execution for year {year}"
            ),
            OrchestrateError::Catalog(e) => std::fmt::Display::fmt(e, f),
            OrchestrateError::SourceFailed { source, message } => {
                write!(f, "source {source} failed: {message}")
            }
            OrchestrateError::Cancelled { execution_id } => {
                write!(f, "execution {execution_id} cancelled")
            }
            OrchestrateError::CatalogRetryUnsupported => {
                write!(f, "catalog sync executions are retried by starting a new sync")
            }
            OrchestrateError::Tracker(e) => std::fmt::Display::fmt(e, f),
            OrchestrateError::Storage(e) => std::fmt::Display::fmt(e, f),
        }
    }
}

impl std::error::Error for OrchestrateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OrchestrateError::Catalog(e) => std::error::Error::source(e),
            OrchestrateError::Tracker(e) => std::error::Error::source(e),
            OrchestrateError::Storage(e) => std::error::Error::source(e),
            _ => None,
        }
    }
}

impl From<CatalogError> for OrchestrateError {
    fn from(e: CatalogError) -> Self {
        OrchestrateError::Catalog(e)
    }
}

impl From<TrackerError> for OrchestrateError {
    fn from(e: TrackerError) -> Self {
        OrchestrateError::Tracker(e)
    }
}

impl From<grantflow_storage::Error> for OrchestrateError {
    fn from(e: grantflow_storage::Error) -> Self {
        OrchestrateError::Storage(e)
    }
}

/// One orchestrated run request
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub execution_type: ExecutionType,
    pub entity: String,
    pub year: i32,
    /// Source names to extract; empty selects every registered source
    pub sources: Vec<String>,
    pub options: RunOptions,
    /// Explicit date window; defaults to the full year for seeding
    pub date_window: Option<(NaiveDate, NaiveDate)>,
}

impl RunRequest {
    /// Initial bulk load of one year
    pub fn seeding(entity: impl Into<String>, year: i32, options: RunOptions) -> Self {
        Self {
            execution_type: ExecutionType::Seeding,
            entity: entity.into(),
            year,
            sources: Vec::new(),
            options,
            date_window: None,
        }
    }

    /// Incremental update over the trailing `days_back` days
    pub fn sync(entity: impl Into<String>, days_back: i64, options: RunOptions) -> Self {
        let today = Utc::now().date_naive();
        let from = today - ChronoDuration::days(days_back.max(0));
        Self {
            execution_type: ExecutionType::Sync,
            entity: entity.into(),
            year: today.year(),
            sources: Vec::new(),
            options,
            date_window: Some((from, today)),
        }
    }

    fn window(&self) -> (NaiveDate, NaiveDate) {
        self.date_window.unwrap_or_else(|| {
            // full-year window; the 31st of December always exists
            (
                NaiveDate::from_ymd_opt(self.year, 1, 1).unwrap_or_default(),
                NaiveDate::from_ymd_opt(self.year, 12, 31).unwrap_or_default(),
            )
        })
    }
}

enum SourceOutcome {
    Completed,
    Cancelled,
    Failed { message: String },
}

/// Shared page accounting across the workers of one run
#[derive(Default)]
struct ProgressAccounting {
    pages_done: u64,
    expected: HashMap<SourceKind, u64>,
}

impl ProgressAccounting {
    fn page_done(&mut self, source: SourceKind, expected_pages: u64) {
        self.pages_done += 1;
        self.expected.insert(source, expected_pages.max(1));
    }

    /// Overall percentage; sources that have not reported yet count one
    /// expected page each, and the result stays below 100 until terminal
    fn percent(&self, total_sources: usize) -> u8 {
        let known: u64 = self.expected.values().sum();
        let pending = total_sources.saturating_sub(self.expected.len()) as u64;
        let total = (known + pending).max(1);
        ((self.pages_done * 100) / total).min(99) as u8
    }
}

/// Drives tracked runs over the registered sources
#[derive(derive_new::new)]
pub struct Orchestrator {
    store: Arc<dyn Store>,
    tracker: Arc<ExecutionTracker>,
    registry: SourceRegistry,
    fetcher: Arc<dyn PageFetcher>,
    catalog_engine: CatalogSyncEngine,
    validator: CatalogValidator,
    base_url: Url,
    retry: RetryPolicy,
    #[new(default)]
    cancellations: Mutex<HashMap<Uuid, CancellationToken>>,
    // serializes the duplicate-run check against execution creation
    #[new(default)]
    admission_lock: Mutex<()>,
}

impl Orchestrator {
    /// Validate a request and create its pending execution
    async fn prepare(
        &self,
        request: &RunRequest,
    ) -> Result<(Execution, Vec<SourceKind>), OrchestrateError> {
        let spec = self
            .registry
            .get(&request.entity)
            .ok_or_else(|| OrchestrateError::UnknownEntity(request.entity.clone()))?;

        let sources = match self
            .registry
            .select_sources(&request.entity, &request.sources)
        {
            Some(Ok(sources)) => sources,
            Some(Err(source)) => {
                return Err(OrchestrateError::UnknownSource {
                    entity: request.entity.clone(),
                    source,
                })
            }
            None => return Err(OrchestrateError::UnknownEntity(request.entity.clone())),
        };

        if let Some(prerequisite) = &spec.prerequisite {
            let satisfied = self
                .store
                .has_completed_execution(
                    prerequisite.execution_type,
                    &prerequisite.entity,
                    request.year,
                )
                .await?;
            if !satisfied {
                return Err(OrchestrateError::PrerequisiteMissing {
                    prerequisite: prerequisite.entity.clone(),
                    year: request.year,
                });
            }
        }

        let _guard = self.admission_lock.lock().await;
        if let Some(active) = self
            .store
            .find_active_execution(&request.entity, Some(request.year))
            .await?
        {
            return Err(OrchestrateError::DuplicateActiveRun {
                entity: request.entity.clone(),
                year: Some(request.year),
                execution_id: active.id,
            });
        }

        if request.options.cleanup_before {
            let pruned = self
                .store
                .prune_terminal_executions(&request.entity, Some(request.year))
                .await?;
            info!(pruned, entity = %request.entity, "Pruned terminal execution history");
        }

        let mut entrypoint = format!(
            "{}/{}",
            request.execution_type.as_str(),
            request.entity
        );
        if request.options.create_backup {
            entrypoint.push_str("+backup");
        }

        let execution = self
            .tracker
            .create(
                request.execution_type,
                &request.entity,
                Some(request.year),
                &entrypoint,
            )
            .await?;

        Ok((execution, sources))
    }

    /// Validate, create and fully drive a run to its terminal state
    #[instrument(skip(self, request), fields(entity = %request.entity, year = request.year))]
    pub async fn run(&self, request: RunRequest) -> Result<Execution, OrchestrateError> {
        let (execution, sources) = self.prepare(&request).await?;
        self.drive(execution, sources, request).await
    }

    /// Validate and create a run, then drive it on a background task.
    /// Returns the pending execution immediately.
    pub async fn start(
        self: &Arc<Self>,
        request: RunRequest,
    ) -> Result<Execution, OrchestrateError> {
        let (execution, sources) = self.prepare(&request).await?;
        let pending = execution.clone();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = this.drive(execution, sources, request).await {
                warn!(%error, "Run finished with error");
            }
        });

        Ok(pending)
    }

    /// Retry/resume a terminal execution: the predecessor is relabeled
    /// replaced and a fresh run re-extracts the full range, converging
    /// through the dedup constraint.
    pub async fn start_retry(
        self: &Arc<Self>,
        predecessor_id: Uuid,
        options: RunOptions,
    ) -> Result<Execution, OrchestrateError> {
        let old = self.tracker.get(predecessor_id).await?;
        if old.execution_type == ExecutionType::SyncCatalogs {
            return Err(OrchestrateError::CatalogRetryUnsupported);
        }

        let sources = match self.registry.select_sources(&old.entity, &[]) {
            Some(Ok(sources)) => sources,
            _ => return Err(OrchestrateError::UnknownEntity(old.entity.clone())),
        };

        {
            let _guard = self.admission_lock.lock().await;
            if let Some(active) = self
                .store
                .find_active_execution(&old.entity, old.year)
                .await?
            {
                return Err(OrchestrateError::DuplicateActiveRun {
                    entity: old.entity.clone(),
                    year: old.year,
                    execution_id: active.id,
                });
            }
        }

        let successor = self.tracker.begin_retry(predecessor_id).await?;
        let request = RunRequest {
            execution_type: old.execution_type,
            entity: old.entity.clone(),
            year: old.year.unwrap_or_else(|| Utc::now().year()),
            sources: Vec::new(),
            options,
            date_window: None,
        };

        let pending = successor.clone();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = this.drive(successor, sources, request).await {
                warn!(%error, "Retry finished with error");
            }
        });

        Ok(pending)
    }

    /// Request cooperative cancellation of a run. The flag is observed
    /// between pages and between batches; in-flight page requests finish
    /// first, so cancellation latency is bounded by one page of work.
    pub async fn cancel(&self, execution_id: Uuid) -> bool {
        match self.cancellations.lock().await.get(&execution_id) {
            Some(token) => {
                token.cancel();
                info!(%execution_id, "Cancellation requested");
                true
            }
            None => {
                warn!(%execution_id, "Cancellation requested for unknown execution");
                false
            }
        }
    }

    /// Run a catalog synchronization on its own
    pub async fn sync_catalogs(&self) -> Result<CatalogSyncReport, CatalogError> {
        self.catalog_engine.sync_all().await
    }

    async fn drive(
        &self,
        execution: Execution,
        sources: Vec<SourceKind>,
        request: RunRequest,
    ) -> Result<Execution, OrchestrateError> {
        let token = CancellationToken::new();
        self.cancellations
            .lock()
            .await
            .insert(execution.id, token.clone());

        let result = self
            .drive_inner(&execution, &sources, &request, &token)
            .await;

        self.cancellations.lock().await.remove(&execution.id);
        result
    }

    async fn drive_inner(
        &self,
        execution: &Execution,
        sources: &[SourceKind],
        request: &RunRequest,
        token: &CancellationToken,
    ) -> Result<Execution, OrchestrateError> {
        let execution = self.tracker.begin(execution.id).await?;
        let execution_id = execution.id;

        // catalog gate: no source is touched when this fails
        self.tracker
            .set_phase(
                execution_id,
                ExecutionPhase::Validating,
                Some("validating catalog freshness"),
            )
            .await?;
        if let Err(error) = self.validator.ensure_fresh(request.year, &self.catalog_engine).await {
            self.tracker.fail(execution_id, &error.to_string()).await?;
            return Err(error.into());
        }

        self.tracker
            .set_phase(execution_id, ExecutionPhase::Extracting, None)
            .await?;

        let (date_from, date_to) = request.window();
        let progress = Arc::new(Mutex::new(ProgressAccounting::default()));
        let mut failures: Vec<(SourceKind, String)> = Vec::new();

        if request.options.parallel {
            let mut outcomes = futures::stream::iter(sources.iter().copied().map(|source| {
                let progress = progress.clone();
                async move {
                    let outcome = self
                        .run_source(
                            execution_id,
                            source,
                            date_from,
                            date_to,
                            request.options.batch_size,
                            sources.len(),
                            token,
                            progress,
                        )
                        .await;
                    (source, outcome)
                }
            }))
            .buffer_unordered(request.options.effective_workers());

            while let Some((source, outcome)) = outcomes.next().await {
                if let SourceOutcome::Failed { message } = outcome {
                    failures.push((source, message));
                }
            }
        } else {
            for source in sources {
                if token.is_cancelled() {
                    break;
                }
                let outcome = self
                    .run_source(
                        execution_id,
                        *source,
                        date_from,
                        date_to,
                        request.options.batch_size,
                        sources.len(),
                        token,
                        progress.clone(),
                    )
                    .await;
                if let SourceOutcome::Failed { message } = outcome {
                    failures.push((*source, message));
                }
            }
        }

        if token.is_cancelled() {
            let cancelled = self.tracker.cancel(execution_id).await?;
            return Err(OrchestrateError::Cancelled {
                execution_id: cancelled.id,
            });
        }

        if let Some((source, message)) = failures.first() {
            let combined = failures
                .iter()
                .map(|(source, message)| format!("{source}: {message}"))
                .collect::<Vec<_>>()
                .join("; ");
            self.tracker.fail(execution_id, &combined).await?;
            return Err(OrchestrateError::SourceFailed {
                source: source.name().to_string(),
                message: message.clone(),
            });
        }

        let completed = self.tracker.complete(execution_id).await?;
        Ok(completed)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_source(
        &self,
        execution_id: Uuid,
        source: SourceKind,
        date_from: NaiveDate,
        date_to: NaiveDate,
        batch_size: usize,
        total_sources: usize,
        token: &CancellationToken,
        progress: Arc<Mutex<ProgressAccounting>>,
    ) -> SourceOutcome {
        let endpoint = match source.endpoint(&self.base_url) {
            Ok(endpoint) => endpoint,
            Err(error) => {
                return SourceOutcome::Failed {
                    message: format!("bad endpoint: {error}"),
                }
            }
        };

        let loader = DedupLoader::new(self.store.clone());
        let query = ExtractQuery {
            endpoint,
            date_from,
            date_to,
            page_size: batch_size,
        };

        let stream = extract_pages(self.fetcher.clone(), query, self.retry.clone());
        futures::pin_mut!(stream);

        while let Some(item) = stream.next().await {
            // cooperative checkpoint between pages; the in-flight request
            // above already finished
            if token.is_cancelled() {
                info!(%source, "Source extraction stopped at cancellation checkpoint");
                return SourceOutcome::Cancelled;
            }

            let page = match item {
                Ok(page) => page,
                Err(error) => {
                    warn!(%source, %error, "Source extraction failed");
                    return SourceOutcome::Failed {
                        message: error.to_string(),
                    };
                }
            };

            let outcome = match loader.load_batch(&page.records, source.regime()).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    return SourceOutcome::Failed {
                        message: error.to_string(),
                    }
                }
            };

            let percent = {
                let mut accounting = progress.lock().await;
                accounting.page_done(source, page.expected_pages);
                accounting.percent(total_sources)
            };

            let operation = format!(
                "{source}: page {} of ~{}",
                page.page_index + 1,
                page.expected_pages
            );
            let delta = RecordCounts {
                processed: outcome.processed(),
                inserted: outcome.inserted,
                updated: 0,
                failed: outcome.failed,
            };
            if let Err(error) = self
                .tracker
                .record_progress(execution_id, delta, Some(percent), Some(&operation))
                .await
            {
                return SourceOutcome::Failed {
                    message: error.to_string(),
                };
            }
        }

        SourceOutcome::Completed
    }
}
