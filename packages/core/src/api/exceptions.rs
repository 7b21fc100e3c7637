use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{internal_error, ApiError, ApiState};
use crate::model::ExceptionRecord;

#[derive(Debug, Deserialize)]
pub struct ExceptionsQuery {
    pub event_type: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ExceptionsResponse {
    pub exceptions: Vec<ExceptionRecord>,
    pub total: usize,
}

/// `GET /exceptions?event_type=&limit=` - newest first.
pub async fn list_exceptions(
    State(state): State<ApiState>,
    Query(params): Query<ExceptionsQuery>,
) -> Result<Json<ExceptionsResponse>, ApiError> {
    let exceptions = state
        .repo
        .list_exceptions(params.limit.unwrap_or(50), params.event_type.as_deref())
        .await
        .map_err(internal_error)?;

    let total = exceptions.len();
    Ok(Json(ExceptionsResponse { exceptions, total }))
}
