//! REST API for stevedore sessions.
//!
//! Exposes the session store over HTTP: create, inspect, label and delete
//! sessions, plus aggregate statistics and the OpenAPI document.

use std::future::Future;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod dto;
pub mod error;
pub mod openapi;
pub mod routes;
pub mod state;

pub use openapi::ApiDoc;
pub use state::ApiState;

/// Build the API router with all routes
pub fn build_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health endpoints
        .route("/api/v1/health", get(routes::health::health))
        .route("/api/v1/stats", get(routes::health::stats))
        .route("/api/v1/openapi.json", get(routes::health::openapi))
        // Session endpoints
        .route(
            "/api/v1/sessions",
            get(routes::sessions::list).post(routes::sessions::create),
        )
        .route(
            "/api/v1/sessions/:id",
            get(routes::sessions::get_one).delete(routes::sessions::delete),
        )
        // Label endpoints
        .route("/api/v1/sessions/:id/labels", post(routes::sessions::add_label))
        .route(
            "/api/v1/sessions/:id/labels/:label",
            delete(routes::sessions::remove_label),
        )
        .route("/api/v1/labels/:label/sessions", get(routes::sessions::by_label))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` resolves
pub async fn serve(
    state: ApiState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind REST API to {addr}"))?;
    tracing::info!("REST API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("REST API server failed")?;

    Ok(())
}
