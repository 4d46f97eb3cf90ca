//! Control-surface routes
//!
//! Thin handlers over the orchestrator and the storage contract. Runs are
//! started asynchronously: the handlers answer with the pending execution
//! snapshot and clients follow progress over `/ws` or by polling the
//! execution resource.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use grantflow_schemas::{
    ExecutionSnapshot, ExecutionStatus, ExecutionType, RunOptions, CATALOG_ENTITY,
};
use grantflow_storage::{ExecutionFilter, Statistics, Store};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::ApiContextRef;
use grantflow_core::catalog::CatalogError;
use grantflow_core::RunRequest;

pub fn router() -> Router<ApiContextRef> {
    Router::new()
        .route("/executions", get(list_executions))
        .route("/executions/seeding", post(start_seeding))
        .route("/executions/sync", post(start_sync))
        .route(
            "/executions/{id}",
            get(get_execution).delete(delete_execution),
        )
        .route("/executions/{id}/stop", post(stop_execution))
        .route("/executions/{id}/retry", post(retry_execution))
        .route("/catalogs/sync", post(start_catalog_sync))
        .route("/statistics", get(get_statistics))
}

/// Request to start an initial bulk load for one year
#[derive(Debug, Deserialize)]
pub struct StartSeedingRequest {
    pub entity: String,
    pub year: i32,
    /// Source names to extract; empty selects all registered sources
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub cleanup_before: bool,
    #[serde(default)]
    pub create_backup: bool,
}

/// Request to start an incremental sync over a trailing window
#[derive(Debug, Deserialize)]
pub struct StartSyncRequest {
    pub entity: String,
    /// Days to look back; defaults to one week
    #[serde(default)]
    pub days_back: Option<i64>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub parallel: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<ExecutionStatus>,
    #[serde(rename = "type")]
    pub execution_type: Option<ExecutionType>,
    pub entity: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
struct StopResponse {
    status: &'static str,
    execution_id: Uuid,
}

#[derive(Serialize)]
struct CatalogSyncStarted {
    status: &'static str,
}

fn run_options(
    batch_size: Option<usize>,
    workers: Option<usize>,
    parallel: bool,
    cleanup_before: bool,
    create_backup: bool,
) -> RunOptions {
    let defaults = RunOptions::default();
    RunOptions {
        cleanup_before,
        create_backup,
        parallel,
        workers: workers.unwrap_or(defaults.workers),
        batch_size: batch_size.unwrap_or(defaults.batch_size),
    }
}

async fn start_seeding(
    State(context): State<ApiContextRef>,
    Json(request): Json<StartSeedingRequest>,
) -> Result<(StatusCode, Json<ExecutionSnapshot>), ApiError> {
    let options = run_options(
        request.batch_size,
        request.workers,
        request.parallel,
        request.cleanup_before,
        request.create_backup,
    );

    let mut run = RunRequest::seeding(&request.entity, request.year, options);
    run.sources = request.sources;

    let execution = context.orchestrator.start(run).await?;
    info!(execution_id = %execution.id, entity = %execution.entity, "Seeding run accepted");
    Ok((StatusCode::ACCEPTED, Json(execution.snapshot())))
}

async fn start_sync(
    State(context): State<ApiContextRef>,
    Json(request): Json<StartSyncRequest>,
) -> Result<(StatusCode, Json<ExecutionSnapshot>), ApiError> {
    let options = run_options(
        request.batch_size,
        request.workers,
        request.parallel,
        false,
        false,
    );

    let mut run = RunRequest::sync(&request.entity, request.days_back.unwrap_or(7), options);
    run.sources = request.sources;

    let execution = context.orchestrator.start(run).await?;
    info!(execution_id = %execution.id, entity = %execution.entity, "Sync run accepted");
    Ok((StatusCode::ACCEPTED, Json(execution.snapshot())))
}

async fn start_catalog_sync(
    State(context): State<ApiContextRef>,
) -> Result<(StatusCode, Json<CatalogSyncStarted>), ApiError> {
    if let Some(active) = context
        .store
        .find_active_execution(CATALOG_ENTITY, None)
        .await?
    {
        return Err(CatalogError::SyncInProgress {
            execution_id: active.id,
        }
        .into());
    }

    let orchestrator = context.orchestrator.clone();
    tokio::spawn(async move {
        if let Err(error) = orchestrator.sync_catalogs().await {
            warn!(%error, "Catalog sync finished with error");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(CatalogSyncStarted { status: "started" }),
    ))
}

async fn stop_execution(
    State(context): State<ApiContextRef>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<StopResponse>), ApiError> {
    if !context.orchestrator.cancel(id).await {
        return Err(ApiError::NotFound);
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(StopResponse {
            status: "cancelling",
            execution_id: id,
        }),
    ))
}

async fn retry_execution(
    State(context): State<ApiContextRef>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<ExecutionSnapshot>), ApiError> {
    let successor = context
        .orchestrator
        .start_retry(id, RunOptions::default())
        .await?;
    info!(execution_id = %successor.id, predecessor = %id, "Retry accepted");
    Ok((StatusCode::ACCEPTED, Json(successor.snapshot())))
}

async fn get_execution(
    State(context): State<ApiContextRef>,
    Path(id): Path<Uuid>,
) -> Result<Json<ExecutionSnapshot>, ApiError> {
    let execution = context
        .store
        .get_execution(id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(execution.snapshot()))
}

async fn list_executions(
    State(context): State<ApiContextRef>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ExecutionSnapshot>>, ApiError> {
    let filter = ExecutionFilter {
        status: query.status,
        execution_type: query.execution_type,
        entity: query.entity,
        limit: Some(query.limit.unwrap_or(20)),
    };

    let executions = context.store.list_executions(&filter).await?;
    Ok(Json(executions.iter().map(|e| e.snapshot()).collect()))
}

async fn delete_execution(
    State(context): State<ApiContextRef>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if context.store.delete_execution(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

async fn get_statistics(
    State(context): State<ApiContextRef>,
) -> Result<Json<Statistics>, ApiError> {
    Ok(Json(context.store.statistics().await?))
}
