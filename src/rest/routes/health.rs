//! Health, statistics and API description endpoints.

use axum::{extract::State, http::header, response::IntoResponse, Json};
use utoipa::OpenApi;

use crate::rest::dto::{HealthResponse, StatsResponse};
use crate::rest::error::ApiError;
use crate::rest::openapi::ApiDoc;
use crate::rest::state::ApiState;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions: state.store.len(),
    })
}

/// Aggregate session store statistics
#[utoipa::path(
    get,
    path = "/api/v1/stats",
    tag = "Health",
    responses(
        (status = 200, description = "Store statistics", body = StatsResponse)
    )
)]
pub async fn stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    Json(StatsResponse::new(
        state.store.stats(),
        state.store.get_all_labels(),
    ))
}

/// The OpenAPI document for this server
pub async fn openapi() -> Result<impl IntoResponse, ApiError> {
    let body = serde_json::to_string_pretty(&ApiDoc::openapi())
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::routes::test_state;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_health() {
        let dir = TempDir::new().unwrap();
        let resp = health(State(test_state(&dir))).await;
        assert_eq!(resp.status, "ok");
        assert!(!resp.version.is_empty());
        assert_eq!(resp.sessions, 0);
    }

    #[tokio::test]
    async fn test_stats_include_labels() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let session = state.store.create_session(None).unwrap();
        state.store.add_label(&session.session_id, "Team-A").unwrap();

        let resp = stats(State(state)).await;
        assert_eq!(resp.total_sessions, 1);
        assert_eq!(resp.by_status.get("inactive"), Some(&1));
        assert_eq!(resp.labels, vec!["team-a"]);
    }
}
