//! PostgreSQL storage backend
//!
//! Relies on the database for the invariants the engine needs: a unique
//! constraint on the concession dedup key with `ON CONFLICT DO NOTHING`
//! inserts, and a composite-keyed catalog table upserted without deletes.
//! The canonical table is partitioned by year/regime externally; nothing in
//! this module depends on the partitioning scheme.

use async_trait::async_trait;
use chrono::Utc;
use grantflow_schemas::{
    CanonicalRecord, CatalogEntry, CatalogTable, Execution, ExecutionPhase, ExecutionStatus,
    ExecutionType, RecordCounts,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{Error, ExecutionFilter, Result, Statistics, Store};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS execution (
    id UUID PRIMARY KEY,
    execution_type TEXT NOT NULL,
    entity TEXT NOT NULL,
    year INTEGER,
    status TEXT NOT NULL,
    current_phase TEXT,
    progress_percentage SMALLINT NOT NULL DEFAULT 0,
    records_processed BIGINT NOT NULL DEFAULT 0,
    records_inserted BIGINT NOT NULL DEFAULT 0,
    records_updated BIGINT NOT NULL DEFAULT 0,
    records_failed BIGINT NOT NULL DEFAULT 0,
    started_at TIMESTAMPTZ NOT NULL,
    finished_at TIMESTAMPTZ,
    entrypoint TEXT NOT NULL DEFAULT '',
    current_operation TEXT,
    error_message TEXT,
    predecessor UUID
);

CREATE TABLE IF NOT EXISTS concession (
    source_id TEXT NOT NULL,
    grant_date DATE NOT NULL,
    regime TEXT NOT NULL,
    beneficiary TEXT NOT NULL,
    call_reference TEXT,
    amount DOUBLE PRECISION NOT NULL,
    instrument TEXT,
    PRIMARY KEY (source_id, grant_date, regime)
);

CREATE TABLE IF NOT EXISTS catalog_entry (
    catalog TEXT NOT NULL,
    code TEXT NOT NULL,
    description TEXT NOT NULL,
    parent TEXT,
    PRIMARY KEY (catalog, code)
);
"#;

/// PostgreSQL [`Store`] implementation
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to the database and make sure the tables exist
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Storage schema verified");
        Ok(())
    }
}

fn parse_type(raw: &str) -> Result<ExecutionType> {
    match raw {
        "seeding" => Ok(ExecutionType::Seeding),
        "sync" => Ok(ExecutionType::Sync),
        "sync_catalogs" => Ok(ExecutionType::SyncCatalogs),
        other => Err(Error::Backend(format!("unknown execution type: {other}"))),
    }
}

fn parse_status(raw: &str) -> Result<ExecutionStatus> {
    match raw {
        "pending" => Ok(ExecutionStatus::Pending),
        "running" => Ok(ExecutionStatus::Running),
        "completed" => Ok(ExecutionStatus::Completed),
        "failed" => Ok(ExecutionStatus::Failed),
        "cancelled" => Ok(ExecutionStatus::Cancelled),
        "interrupted" => Ok(ExecutionStatus::Interrupted),
        "replaced" => Ok(ExecutionStatus::Replaced),
        other => Err(Error::Backend(format!("unknown execution status: {other}"))),
    }
}

fn parse_phase(raw: &str) -> Result<ExecutionPhase> {
    match raw {
        "extracting" => Ok(ExecutionPhase::Extracting),
        "transforming" => Ok(ExecutionPhase::Transforming),
        "loading" => Ok(ExecutionPhase::Loading),
        "validating" => Ok(ExecutionPhase::Validating),
        other => Err(Error::Backend(format!("unknown execution phase: {other}"))),
    }
}

fn row_to_execution(row: &PgRow) -> Result<Execution> {
    let execution_type: String = row.try_get("execution_type")?;
    let status: String = row.try_get("status")?;
    let phase: Option<String> = row.try_get("current_phase")?;

    Ok(Execution {
        id: row.try_get("id")?,
        execution_type: parse_type(&execution_type)?,
        entity: row.try_get("entity")?,
        year: row.try_get("year")?,
        status: parse_status(&status)?,
        current_phase: phase.as_deref().map(parse_phase).transpose()?,
        progress_percentage: row.try_get::<i16, _>("progress_percentage")? as u8,
        counts: RecordCounts {
            processed: row.try_get::<i64, _>("records_processed")? as u64,
            inserted: row.try_get::<i64, _>("records_inserted")? as u64,
            updated: row.try_get::<i64, _>("records_updated")? as u64,
            failed: row.try_get::<i64, _>("records_failed")? as u64,
        },
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        entrypoint: row.try_get("entrypoint")?,
        current_operation: row.try_get("current_operation")?,
        error_message: row.try_get("error_message")?,
        predecessor: row.try_get("predecessor")?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn insert_execution(&self, execution: &Execution) -> Result<()> {
        sqlx::query(
            "INSERT INTO execution (id, execution_type, entity, year, status, current_phase, \
             progress_percentage, records_processed, records_inserted, records_updated, \
             records_failed, started_at, finished_at, entrypoint, current_operation, \
             error_message, predecessor) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        )
        .bind(execution.id)
        .bind(execution.execution_type.as_str())
        .bind(&execution.entity)
        .bind(execution.year)
        .bind(execution.status.as_str())
        .bind(execution.current_phase.map(|p| p.as_str()))
        .bind(execution.progress_percentage as i16)
        .bind(execution.counts.processed as i64)
        .bind(execution.counts.inserted as i64)
        .bind(execution.counts.updated as i64)
        .bind(execution.counts.failed as i64)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(&execution.entrypoint)
        .bind(&execution.current_operation)
        .bind(&execution.error_message)
        .bind(execution.predecessor)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<()> {
        let result = sqlx::query(
            "UPDATE execution SET status = $2, current_phase = $3, progress_percentage = $4, \
             records_processed = $5, records_inserted = $6, records_updated = $7, \
             records_failed = $8, finished_at = $9, entrypoint = $10, current_operation = $11, \
             error_message = $12, predecessor = $13 WHERE id = $1",
        )
        .bind(execution.id)
        .bind(execution.status.as_str())
        .bind(execution.current_phase.map(|p| p.as_str()))
        .bind(execution.progress_percentage as i16)
        .bind(execution.counts.processed as i64)
        .bind(execution.counts.inserted as i64)
        .bind(execution.counts.updated as i64)
        .bind(execution.counts.failed as i64)
        .bind(execution.finished_at)
        .bind(&execution.entrypoint)
        .bind(&execution.current_operation)
        .bind(&execution.error_message)
        .bind(execution.predecessor)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::ExecutionNotFound(execution.id));
        }
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>> {
        let row = sqlx::query("SELECT * FROM execution WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_execution).transpose()
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        let limit = filter.limit.map(|l| l as i64).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT * FROM execution \
             WHERE ($1::TEXT IS NULL OR status = $1) \
             AND ($2::TEXT IS NULL OR execution_type = $2) \
             AND ($3::TEXT IS NULL OR entity = $3) \
             ORDER BY started_at DESC LIMIT $4",
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.execution_type.map(|t| t.as_str()))
        .bind(filter.entity.as_deref())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_execution).collect()
    }

    async fn delete_execution(&self, id: Uuid) -> Result<bool> {
        match self.get_execution(id).await? {
            None => Ok(false),
            Some(execution) if execution.status == ExecutionStatus::Running => {
                Err(Error::ExecutionStillRunning(id))
            }
            Some(_) => {
                sqlx::query("DELETE FROM execution WHERE id = $1")
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                Ok(true)
            }
        }
    }

    async fn find_active_execution(
        &self,
        entity: &str,
        year: Option<i32>,
    ) -> Result<Option<Execution>> {
        let row = sqlx::query(
            "SELECT * FROM execution \
             WHERE entity = $1 AND status IN ('pending', 'running') \
             AND ($2::INTEGER IS NULL OR year = $2) \
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(entity)
        .bind(year)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_execution).transpose()
    }

    async fn last_successful_execution(
        &self,
        execution_type: ExecutionType,
        entity: Option<&str>,
    ) -> Result<Option<Execution>> {
        let row = sqlx::query(
            "SELECT * FROM execution \
             WHERE execution_type = $1 AND status = 'completed' \
             AND ($2::TEXT IS NULL OR entity = $2) \
             ORDER BY finished_at DESC LIMIT 1",
        )
        .bind(execution_type.as_str())
        .bind(entity)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_execution).transpose()
    }

    async fn has_completed_execution(
        &self,
        execution_type: ExecutionType,
        entity: &str,
        year: i32,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM execution \
             WHERE execution_type = $1 AND entity = $2 AND year = $3 AND status = 'completed' \
             LIMIT 1",
        )
        .bind(execution_type.as_str())
        .bind(entity)
        .bind(year)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn reclaim_running_as_interrupted(&self, error_message: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE execution SET status = 'interrupted', finished_at = $1, error_message = $2 \
             WHERE status = 'running'",
        )
        .bind(Utc::now())
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn prune_terminal_executions(&self, entity: &str, year: Option<i32>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM execution \
             WHERE entity = $1 AND year IS NOT DISTINCT FROM $2 \
             AND status NOT IN ('pending', 'running')",
        )
        .bind(entity)
        .bind(year)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn statistics(&self) -> Result<Statistics> {
        let mut stats = Statistics::default();

        let rows = sqlx::query(
            "SELECT execution_type, status, COUNT(*) AS count FROM execution \
             GROUP BY execution_type, status",
        )
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            let execution_type: String = row.try_get("execution_type")?;
            let status: String = row.try_get("status")?;
            let count = row.try_get::<i64, _>("count")? as u64;

            stats.total_executions += count;
            match execution_type.as_str() {
                "seeding" => stats.seeding_executions += count,
                "sync" => stats.sync_executions += count,
                "sync_catalogs" => stats.catalog_sync_executions += count,
                _ => {}
            }
            match status.as_str() {
                "completed" => stats.completed += count,
                "failed" => stats.failed += count,
                "pending" | "running" => stats.active += count,
                _ => {}
            }
        }

        stats.last_successful_seeding = self
            .last_successful_execution(ExecutionType::Seeding, None)
            .await?
            .and_then(|e| e.finished_at);
        stats.last_successful_sync = self
            .last_successful_execution(ExecutionType::Sync, None)
            .await?
            .and_then(|e| e.finished_at);
        stats.last_successful_catalog_sync = self
            .last_successful_execution(ExecutionType::SyncCatalogs, None)
            .await?
            .and_then(|e| e.finished_at);

        stats.concession_count = self.concession_count().await?;

        let rows = sqlx::query("SELECT catalog, COUNT(*) AS count FROM catalog_entry GROUP BY catalog")
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            let catalog: String = row.try_get("catalog")?;
            let count = row.try_get::<i64, _>("count")? as u64;
            stats.catalog_counts.insert(catalog, count);
        }

        Ok(stats)
    }

    async fn insert_ignore_concessions(&self, records: &[CanonicalRecord]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for record in records {
            let result = sqlx::query(
                "INSERT INTO concession (source_id, grant_date, regime, beneficiary, \
                 call_reference, amount, instrument) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (source_id, grant_date, regime) DO NOTHING",
            )
            .bind(&record.source_id)
            .bind(record.grant_date)
            .bind(record.regime.as_str())
            .bind(&record.beneficiary)
            .bind(&record.call_reference)
            .bind(record.amount)
            .bind(&record.instrument)
            .execute(&mut *tx)
            .await?;

            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn concession_count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM concession")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("count")? as u64)
    }

    async fn upsert_catalog_entries(
        &self,
        table: CatalogTable,
        entries: &[CatalogEntry],
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut new_codes = 0;

        for entry in entries {
            // xmax = 0 distinguishes a fresh insert from a conflict update
            let row = sqlx::query(
                "INSERT INTO catalog_entry (catalog, code, description, parent) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (catalog, code) \
                 DO UPDATE SET description = EXCLUDED.description, parent = EXCLUDED.parent \
                 RETURNING (xmax = 0) AS inserted",
            )
            .bind(table.as_str())
            .bind(&entry.code)
            .bind(&entry.description)
            .bind(&entry.parent)
            .fetch_one(&mut *tx)
            .await?;

            if row.try_get::<bool, _>("inserted")? {
                new_codes += 1;
            }
        }

        tx.commit().await?;
        Ok(new_codes)
    }

    async fn catalog_count(&self, table: CatalogTable) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM catalog_entry WHERE catalog = $1")
            .bind(table.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("count")? as u64)
    }
}
