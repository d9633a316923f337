//! Session management endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use utoipa::IntoParams;

use crate::rest::dto::{
    AddLabelRequest, CreateSessionRequest, DeleteSessionResponse, SessionResponse,
    SessionSummaryResponse,
};
use crate::rest::error::{ApiError, ErrorResponse};
use crate::rest::state::ApiState;
use crate::session::model::{SessionFilter, SessionStatus};

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ListQuery {
    /// Only sessions carrying this label
    pub label: Option<String>,
    /// Only sessions in this status
    pub status: Option<String>,
}

/// List sessions, newest first
#[utoipa::path(
    get,
    path = "/api/v1/sessions",
    tag = "Sessions",
    params(ListQuery),
    responses(
        (status = 200, description = "Matching sessions", body = Vec<SessionSummaryResponse>),
        (status = 400, description = "Unknown status", body = ErrorResponse)
    )
)]
pub async fn list(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SessionSummaryResponse>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<SessionStatus>)
        .transpose()
        .map_err(ApiError::ValidationError)?;
    let filter = SessionFilter {
        all_labels: query.label.into_iter().collect(),
        status,
        ..Default::default()
    };

    let now = chrono::Utc::now();
    Ok(Json(
        state
            .store
            .list_filtered(&filter)
            .iter()
            .map(|s| SessionSummaryResponse::from(s.summary(now)))
            .collect(),
    ))
}

/// Create a session
#[utoipa::path(
    post,
    path = "/api/v1/sessions",
    tag = "Sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session created", body = SessionResponse),
        (status = 400, description = "Invalid session id or label", body = ErrorResponse),
        (status = 409, description = "Session already exists", body = ErrorResponse),
        (status = 507, description = "Session limit reached", body = ErrorResponse)
    )
)]
pub async fn create(
    State(state): State<ApiState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let mut session = state.store.create_session(request.session_id.as_deref())?;
    if !request.labels.is_empty() {
        session = state.store.set_labels(&session.session_id, &request.labels)?;
    }
    Ok((StatusCode::CREATED, Json(SessionResponse::from(&session))))
}

/// Get a single session by id
#[utoipa::path(
    get,
    path = "/api/v1/sessions/{id}",
    tag = "Sessions",
    params(
        ("id" = String, Path, description = "Session id")
    ),
    responses(
        (status = 200, description = "Session details", body = SessionResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    )
)]
pub async fn get_one(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state.store.get_session(&id)?;
    Ok(Json(SessionResponse::from(&session)))
}

/// Delete a session, cancelling its outstanding jobs
#[utoipa::path(
    delete,
    path = "/api/v1/sessions/{id}",
    tag = "Sessions",
    params(
        ("id" = String, Path, description = "Session id")
    ),
    responses(
        (status = 200, description = "Session deleted", body = DeleteSessionResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    )
)]
pub async fn delete(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteSessionResponse>, ApiError> {
    let cancelled_jobs = state.store.delete_session(&id)?;
    Ok(Json(DeleteSessionResponse {
        session_id: id,
        cancelled_jobs,
    }))
}

/// Add a label to a session
#[utoipa::path(
    post,
    path = "/api/v1/sessions/{id}/labels",
    tag = "Labels",
    params(
        ("id" = String, Path, description = "Session id")
    ),
    request_body = AddLabelRequest,
    responses(
        (status = 200, description = "Label added", body = SessionResponse),
        (status = 400, description = "Invalid label", body = ErrorResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    )
)]
pub async fn add_label(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<AddLabelRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state.store.add_label(&id, &request.label)?;
    Ok(Json(SessionResponse::from(&session)))
}

/// Remove a label from a session
#[utoipa::path(
    delete,
    path = "/api/v1/sessions/{id}/labels/{label}",
    tag = "Labels",
    params(
        ("id" = String, Path, description = "Session id"),
        ("label" = String, Path, description = "Label to remove")
    ),
    responses(
        (status = 200, description = "Label removed", body = SessionResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    )
)]
pub async fn remove_label(
    State(state): State<ApiState>,
    Path((id, label)): Path<(String, String)>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state.store.remove_label(&id, &label)?;
    Ok(Json(SessionResponse::from(&session)))
}

/// Sessions carrying a label, newest first
#[utoipa::path(
    get,
    path = "/api/v1/labels/{label}/sessions",
    tag = "Labels",
    params(
        ("label" = String, Path, description = "Label")
    ),
    responses(
        (status = 200, description = "Sessions with the label", body = Vec<SessionSummaryResponse>),
        (status = 400, description = "Invalid label", body = ErrorResponse)
    )
)]
pub async fn by_label(
    State(state): State<ApiState>,
    Path(label): Path<String>,
) -> Result<Json<Vec<SessionSummaryResponse>>, ApiError> {
    let now = chrono::Utc::now();
    Ok(Json(
        state
            .store
            .get_sessions_by_label(&label)?
            .iter()
            .map(|s| SessionSummaryResponse::from(s.summary(now)))
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::routes::test_state;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_with_labels() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let (status, Json(session)) = create(
            State(state.clone()),
            Json(CreateSessionRequest {
                session_id: Some("session-0001".to_string()),
                labels: vec!["Team-A".to_string(), "team-a".to_string()],
            }),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(session.session_id, "session-0001");
        assert_eq!(session.status, "inactive");
        assert_eq!(session.labels, vec!["team-a"]);
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        state.store.create_session(Some("session-0001")).unwrap();
        state.store.get_or_create("session-0002").unwrap();

        let Json(active) = list(
            State(state.clone()),
            Query(ListQuery {
                status: Some("active".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, "session-0002");

        let err = list(
            State(state),
            Query(ListQuery {
                status: Some("sleeping".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_get_missing_session() {
        let dir = TempDir::new().unwrap();
        let err = get_one(State(test_state(&dir)), Path("session-0404".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_label_round_trip() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        state.store.create_session(Some("session-0001")).unwrap();

        add_label(
            State(state.clone()),
            Path("session-0001".to_string()),
            Json(AddLabelRequest {
                label: "Blue".to_string(),
            }),
        )
        .await
        .unwrap();
        let Json(found) = by_label(State(state.clone()), Path("blue".to_string()))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let Json(session) = remove_label(
            State(state.clone()),
            Path(("session-0001".to_string(), "blue".to_string())),
        )
        .await
        .unwrap();
        assert!(session.labels.is_empty());
    }
}
