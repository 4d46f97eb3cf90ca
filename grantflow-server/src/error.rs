use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use grantflow_core::catalog::CatalogError;
use grantflow_core::orchestrate::OrchestrateError;
use grantflow_core::tracker::TrackerError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Orchestrate(#[from] OrchestrateError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Storage(#[from] grantflow_storage::Error),

    #[error("Execution not found")]
    NotFound,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    execution_id: Option<String>,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Orchestrate(error) => match error {
                OrchestrateError::UnknownEntity(_) | OrchestrateError::UnknownSource { .. } => {
                    StatusCode::NOT_FOUND
                }
                OrchestrateError::DuplicateActiveRun { .. }
                | OrchestrateError::PrerequisiteMissing { .. } => StatusCode::CONFLICT,
                OrchestrateError::CatalogRetryUnsupported => StatusCode::BAD_REQUEST,
                OrchestrateError::Tracker(TrackerError::NotFound(_)) => StatusCode::NOT_FOUND,
                OrchestrateError::Tracker(TrackerError::InvalidTransition { .. }) => {
                    StatusCode::CONFLICT
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Catalog(CatalogError::SyncInProgress { .. }) => StatusCode::CONFLICT,
            ApiError::Catalog(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Tracker(TrackerError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Tracker(TrackerError::InvalidTransition { .. }) => StatusCode::CONFLICT,
            ApiError::Tracker(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Storage(grantflow_storage::Error::ExecutionStillRunning(_)) => {
                StatusCode::CONFLICT
            }
            ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotFound => StatusCode::NOT_FOUND,
        }
    }

    fn execution_id(&self) -> Option<String> {
        match self {
            ApiError::Orchestrate(OrchestrateError::DuplicateActiveRun {
                execution_id, ..
            }) => Some(execution_id.to_string()),
            ApiError::Catalog(CatalogError::SyncInProgress { execution_id }) => {
                Some(execution_id.to_string())
            }
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_response = ErrorResponse {
            error: self.to_string(),
            execution_id: self.execution_id(),
        };

        let body = serde_json::to_string(&error_response)
            .unwrap_or_else(|_| format!("{{\"error\": \"{}\"}}", self));

        let mut response = Response::new(body.into());
        *response.status_mut() = self.status();

        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        response
    }
}
