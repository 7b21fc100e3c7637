use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::Response,
};

use super::ApiState;

/// `GET /health` - `ok` when the store answers, 503 otherwise.
pub async fn health(State(state): State<ApiState>) -> Response {
    let (status, body) = match sqlx::query("SELECT 1").execute(state.repo.pool()).await {
        Ok(_) => (StatusCode::OK, "ok"),
        Err(err) => {
            tracing::warn!("Health check failed: {}", err);
            (StatusCode::SERVICE_UNAVAILABLE, "database unavailable")
        }
    };

    Response::builder()
        .status(status)
        .header(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))
        .body(Body::from(body))
        .unwrap_or_default()
}
