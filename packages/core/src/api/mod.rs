//! Read-only HTTP API over the resource store.
//!
//! Routes:
//! - `GET /health`                 - liveness plus a database ping
//! - `GET /metrics`                - Prometheus text exposition
//! - `GET /items`                  - items, filterable by account and technology
//! - `GET /items/:id/revisions`    - full revision history of one item
//! - `GET /items/:id/audits`       - every finding attached to one item
//! - `GET /exceptions`             - recent exception records

pub mod exceptions;
pub mod health;
pub mod items;

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{MatchedPath, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::metrics::AppMetrics;
use crate::repository::ResourceRepository;

/// Shared state for every route.
#[derive(Clone)]
pub struct ApiState {
    pub repo: Arc<ResourceRepository>,
    pub metrics: Arc<AppMetrics>,
}

pub type ApiError = (StatusCode, Json<Value>);

pub(crate) fn internal_error(err: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
}

pub(crate) fn not_found(what: &str) -> ApiError {
    (StatusCode::NOT_FOUND, Json(json!({ "error": format!("{} not found", what) })))
}

/// Assemble the full router. `main.rs` and the integration tests both use it.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(render_metrics))
        .route("/items", get(items::list_items))
        .route("/items/:id/revisions", get(items::item_revisions))
        .route("/items/:id/audits", get(items::item_audits))
        .route("/exceptions", get(exceptions::list_exceptions))
        .layer(middleware::from_fn_with_state(state.clone(), count_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /metrics`
async fn render_metrics(State(state): State<ApiState>) -> Response {
    match state.metrics.render() {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(Body::from(body))
            .unwrap_or_default(),
        Err(err) => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from(format!("metrics error: {}", err)))
            .unwrap_or_default(),
    }
}

async fn count_requests(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    state
        .metrics
        .http_requests_total
        .with_label_values(&[&method, &path, response.status().as_str()])
        .inc();
    response
}
