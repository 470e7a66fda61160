use crate::{
    error::AppError,
    health::{HealthService, HealthStatus},
};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct HealthCheckQuery {
    #[serde(default)]
    check: Option<String>,
}

/// Liveness is a plain `Running`; `?check=all` (or a check name) runs the
/// registered component checks and answers with JSON.
pub fn create_health_routes() -> Router<Arc<HealthService>> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(
    State(health_service): State<Arc<HealthService>>,
    Query(params): Query<HealthCheckQuery>,
) -> Result<Response, AppError> {
    let Some(filter) = params.check.as_deref().filter(|f| !f.is_empty()) else {
        return Ok("Running".into_response());
    };

    let health_response = health_service.check_health(Some(filter)).await;
    let status = match health_response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    let response_json = serde_json::to_value(&health_response)
        .map_err(|e| AppError::Internal(format!("Failed to serialize health response: {}", e)))?;

    Ok((status, Json(response_json)).into_response())
}
