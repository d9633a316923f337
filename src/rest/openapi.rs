//! OpenAPI specification builder using utoipa.

use utoipa::OpenApi;

use crate::rest::dto::{
    AddLabelRequest, CreateSessionRequest, DeleteSessionResponse, HealthResponse, JobResponse,
    SessionResponse, SessionSummaryResponse, StageResponse, StatsResponse,
};
use crate::rest::error::ErrorResponse;

/// OpenAPI documentation for the stevedore REST API
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Stevedore API",
        description = "REST API for containerization sessions managed by stevedore.",
        license(name = "MIT")
    ),
    paths(
        // Health endpoints
        crate::rest::routes::health::health,
        crate::rest::routes::health::stats,
        // Session endpoints
        crate::rest::routes::sessions::list,
        crate::rest::routes::sessions::create,
        crate::rest::routes::sessions::get_one,
        crate::rest::routes::sessions::delete,
        // Label endpoints
        crate::rest::routes::sessions::add_label,
        crate::rest::routes::sessions::remove_label,
        crate::rest::routes::sessions::by_label,
    ),
    components(
        schemas(
            // Response types
            HealthResponse,
            StatsResponse,
            SessionResponse,
            SessionSummaryResponse,
            JobResponse,
            StageResponse,
            DeleteSessionResponse,
            ErrorResponse,
            // Request types
            CreateSessionRequest,
            AddLabelRequest,
        )
    ),
    tags(
        (name = "Health", description = "Health check and store statistics"),
        (name = "Sessions", description = "Session lifecycle"),
        (name = "Labels", description = "Session labels"),
    )
)]
pub struct ApiDoc;

impl ApiDoc {
    /// Generate the OpenAPI specification as a JSON string
    pub fn json() -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&Self::openapi())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec_generates() {
        let spec = ApiDoc::json().expect("Failed to generate OpenAPI spec");
        assert!(spec.contains("Stevedore API"));
        assert!(spec.contains("/api/v1/health"));
        assert!(spec.contains("/api/v1/sessions/{id}/labels/{label}"));
        assert!(spec.contains("/api/v1/labels/{label}/sessions"));
    }

    #[test]
    fn test_openapi_has_all_tags() {
        let spec = ApiDoc::json().expect("Failed to generate OpenAPI spec");
        assert!(spec.contains("\"Health\""));
        assert!(spec.contains("\"Sessions\""));
        assert!(spec.contains("\"Labels\""));
    }
}
