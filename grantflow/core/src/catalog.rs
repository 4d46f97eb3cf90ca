//! Catalog synchronization and freshness validation
//!
//! Reference ("catalog") tables back the foreign keys of the transactional
//! concession rows, so a load for year Y must not start unless the catalogs
//! were successfully synchronized during year Y or later. The validator
//! decides obsolescence from execution history; the sync engine refreshes
//! the fixed list of tables with insert-only upserts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use grantflow_schemas::{
    CatalogEntry, CatalogTable, ExecutionPhase, ExecutionType, RecordCounts, CATALOG_ENTITY,
};
use grantflow_storage::Store;
use tracing::{info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::extract::FetchError;
use crate::tracker::{ExecutionTracker, TrackerError};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// A second catalog sync was requested while one is active
    #[error("a catalog sync is already active (execution {execution_id})")]
    SyncInProgress { execution_id: Uuid },

    /// A table fetch failed; the whole sync is aborted as failed
    #[error("catalog sync failed on table {table}: {message}")]
    SyncFailed {
        table: CatalogTable,
        message: String,
    },

    /// The sync reported success but the catalogs still predate the target
    #[error("catalogs still obsolete for year {target_year} after sync")]
    StillObsolete { target_year: i32 },

    #[error(transparent)]
    Storage(#[from] grantflow_storage::Error),

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

/// Seam to the upstream catalog endpoints
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetch the full current entry set of one reference table
    async fn fetch_table(&self, table: CatalogTable) -> Result<Vec<CatalogEntry>, FetchError>;
}

/// HTTP implementation of [`CatalogSource`] backed by reqwest
pub struct HttpCatalogSource {
    client: reqwest::Client,
    base: Url,
}

impl HttpCatalogSource {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Permanent(format!("failed to build http client: {e}")))?;
        Ok(Self { client, base })
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    #[instrument(skip(self), fields(table = %table))]
    async fn fetch_table(&self, table: CatalogTable) -> Result<Vec<CatalogEntry>, FetchError> {
        let endpoint = self
            .base
            .join(&format!("catalogs/{}", table.as_str()))
            .map_err(|e| FetchError::Permanent(format!("bad catalog endpoint: {e}")))?;

        let response = self.client.get(endpoint).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                FetchError::Transient(e.to_string())
            } else {
                FetchError::Permanent(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(FetchError::Transient(format!("source answered {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Permanent(format!("source answered {status}")));
        }

        response
            .json::<Vec<CatalogEntry>>()
            .await
            .map_err(|e| FetchError::Permanent(format!("malformed catalog body: {e}")))
    }
}

/// Result of one full catalog synchronization
#[derive(Debug, Clone)]
pub struct CatalogSyncReport {
    /// New-code count per table, in sync order
    pub per_table: Vec<(CatalogTable, u64)>,
    pub total_new: u64,
    pub duration: Duration,
    pub execution_id: Uuid,
}

/// Refreshes every reference table with insert-only upserts
///
/// Idempotent by construction: re-running against unchanged upstream data
/// yields zero new rows. Single-writer: a sync is rejected while another is
/// active.
pub struct CatalogSyncEngine {
    store: Arc<dyn Store>,
    tracker: Arc<ExecutionTracker>,
    source: Arc<dyn CatalogSource>,
}

impl CatalogSyncEngine {
    pub fn new(
        store: Arc<dyn Store>,
        tracker: Arc<ExecutionTracker>,
        source: Arc<dyn CatalogSource>,
    ) -> Self {
        Self {
            store,
            tracker,
            source,
        }
    }

    /// Synchronize all reference tables, recording one execution of type
    /// `sync_catalogs`.
    ///
    /// A single table's fetch failure aborts the whole sync as failed.
    /// Tables already synced keep their new rows, but the execution is
    /// marked failed so callers do not treat the catalogs as fresh.
    #[instrument(skip(self))]
    pub async fn sync_all(&self) -> Result<CatalogSyncReport, CatalogError> {
        if let Some(active) = self.store.find_active_execution(CATALOG_ENTITY, None).await? {
            return Err(CatalogError::SyncInProgress {
                execution_id: active.id,
            });
        }

        let execution = self
            .tracker
            .create(ExecutionType::SyncCatalogs, CATALOG_ENTITY, None, "sync/catalogs")
            .await?;
        let execution = self.tracker.begin(execution.id).await?;

        let start = Instant::now();
        let mut per_table = Vec::with_capacity(CatalogTable::ALL.len());
        let mut total_new = 0;

        for (position, table) in CatalogTable::ALL.iter().enumerate() {
            self.tracker
                .set_phase(
                    execution.id,
                    ExecutionPhase::Loading,
                    Some(&format!("synchronizing catalog {table}")),
                )
                .await?;

            let entries = match self.source.fetch_table(*table).await {
                Ok(entries) => entries,
                Err(error) => {
                    let message = format!("catalog {table} fetch failed: {error}");
                    warn!(%table, %error, "Aborting catalog sync");
                    self.tracker.fail(execution.id, &message).await?;
                    return Err(CatalogError::SyncFailed {
                        table: *table,
                        message,
                    });
                }
            };

            let new_codes = self.store.upsert_catalog_entries(*table, &entries).await?;
            total_new += new_codes;
            per_table.push((*table, new_codes));

            let progress = ((position + 1) * 100 / CatalogTable::ALL.len()) as u8;
            self.tracker
                .record_progress(
                    execution.id,
                    RecordCounts {
                        processed: entries.len() as u64,
                        inserted: new_codes,
                        ..Default::default()
                    },
                    Some(progress),
                    None,
                )
                .await?;

            info!(%table, entries = entries.len(), new_codes, "Catalog table synchronized");
        }

        self.tracker.complete(execution.id).await?;

        let report = CatalogSyncReport {
            per_table,
            total_new,
            duration: start.elapsed(),
            execution_id: execution.id,
        };
        info!(
            total_new = report.total_new,
            duration_ms = report.duration.as_millis() as u64,
            "Catalog sync completed"
        );
        Ok(report)
    }
}

/// Decides whether catalogs are fresh enough for a target year
pub struct CatalogValidator {
    store: Arc<dyn Store>,
}

impl CatalogValidator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Completion time of the most recent successful catalog sync
    pub async fn last_successful_sync(&self) -> Result<Option<DateTime<Utc>>, CatalogError> {
        let last = self
            .store
            .last_successful_execution(ExecutionType::SyncCatalogs, None)
            .await?;
        Ok(last.and_then(|e| e.finished_at))
    }

    /// Catalogs are obsolete when they were never synced, or the last
    /// successful sync finished in a year strictly before the target year.
    pub async fn is_obsolete(&self, target_year: i32) -> Result<bool, CatalogError> {
        match self.last_successful_sync().await? {
            None => {
                warn!("No successful catalog sync on record, initial sync required");
                Ok(true)
            }
            Some(finished_at) => {
                let obsolete = finished_at.year() < target_year;
                if obsolete {
                    warn!(
                        last_sync = %finished_at.date_naive(),
                        target_year,
                        "Catalogs obsolete"
                    );
                }
                Ok(obsolete)
            }
        }
    }

    /// Synchronize the catalogs when obsolete; fail fast when that sync
    /// does not leave them fresh. Callers must not load transactional data
    /// for `target_year` when this returns an error.
    #[instrument(skip(self, engine))]
    pub async fn ensure_fresh(
        &self,
        target_year: i32,
        engine: &CatalogSyncEngine,
    ) -> Result<(), CatalogError> {
        if !self.is_obsolete(target_year).await? {
            return Ok(());
        }

        info!(target_year, "Catalogs obsolete, synchronizing before load");
        engine.sync_all().await?;

        if self.is_obsolete(target_year).await? {
            return Err(CatalogError::StillObsolete { target_year });
        }
        Ok(())
    }
}
