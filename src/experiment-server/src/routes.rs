//! HTTP binding of the engine's operation allow-list plus health and liveness endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use experiment_core::ExperimentError;
use experiment_engine::{dispatch, ExperimentEngine, Operation};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ExperimentEngine>,
    pub node_id: String,
    pub start_time: Instant,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/rpc/:operation", post(handle_rpc))
        .route("/health", get(health_check))
        .route("/live", get(liveness))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// HTTP status for an engine error.
pub fn status_for(err: &ExperimentError) -> StatusCode {
    match err {
        ExperimentError::ExperimentNotFound(_)
        | ExperimentError::AssignmentNotFound(_)
        | ExperimentError::UnknownOperation(_) => StatusCode::NOT_FOUND,
        ExperimentError::ExperimentNotRunning { .. }
        | ExperimentError::InvalidStateTransition { .. }
        | ExperimentError::Conflict(_) => StatusCode::CONFLICT,
        ExperimentError::InvalidVariantConfiguration(_)
        | ExperimentError::InvalidConfiguration(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ExperimentError::CollaboratorUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ExperimentError::Serialization(_) => StatusCode::BAD_REQUEST,
    }
}

fn error_response(err: ExperimentError) -> (StatusCode, Json<ErrorResponse>) {
    let status = status_for(&err);
    (
        status,
        Json(ErrorResponse {
            error: err.code().to_string(),
            message: err.to_string(),
        }),
    )
}

/// POST /v1/rpc/{operation}
pub async fn handle_rpc(
    State(state): State<AppState>,
    Path(operation): Path<String>,
    Json(params): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<ErrorResponse>)> {
    let operation: Operation = operation.parse().map_err(|e: ExperimentError| {
        warn!(operation = %operation, "Unknown operation requested");
        metrics::counter!("api.unknown_operations").increment(1);
        error_response(e)
    })?;

    metrics::counter!("api.requests", "operation" => operation.as_str()).increment(1);
    match dispatch(&state.engine, operation, params).await {
        Ok(result) => Ok(Json(result)),
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                error!(operation = %operation, error = %e, "Operation failed");
            } else {
                warn!(operation = %operation, code = e.code(), error = %e, "Operation rejected");
            }
            metrics::counter!("api.errors", "code" => e.code()).increment(1);
            Err(error_response(e))
        }
    }
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use experiment_core::types::ExperimentStatus;
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        let id = Uuid::new_v4();
        assert_eq!(status_for(&ExperimentError::ExperimentNotFound(id)), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&ExperimentError::ExperimentNotRunning {
                id,
                status: ExperimentStatus::Paused
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(status_for(&ExperimentError::Conflict(id)), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&ExperimentError::InvalidConfiguration("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&ExperimentError::CollaboratorUnavailable("redis".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&ExperimentError::UnknownOperation("dropTable".into())),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_error_body_carries_code() {
        let (status, Json(body)) = error_response(ExperimentError::AssignmentNotFound(Uuid::nil()));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error, "assignment_not_found");
        assert!(body.message.contains(&Uuid::nil().to_string()));
    }
}
