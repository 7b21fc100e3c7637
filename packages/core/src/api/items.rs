//! Item history endpoints.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{internal_error, not_found, ApiError, ApiState};
use crate::model::{ItemAudit, ItemRevision};
use crate::repository::ItemSummary;

const DEFAULT_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct ItemsQuery {
    pub account: Option<String>,
    pub technology: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ItemsResponse {
    pub items: Vec<ItemSummary>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct RevisionsResponse {
    pub item_id: i64,
    pub revisions: Vec<ItemRevision>,
}

#[derive(Debug, Serialize)]
pub struct AuditsResponse {
    pub item_id: i64,
    pub audits: Vec<ItemAudit>,
}

/// `GET /items?account=&technology=&limit=`
pub async fn list_items(
    State(state): State<ApiState>,
    Query(params): Query<ItemsQuery>,
) -> Result<Json<ItemsResponse>, ApiError> {
    let items = state
        .repo
        .list_items(
            params.account.as_deref(),
            params.technology.as_deref(),
            params.limit.unwrap_or(DEFAULT_LIMIT),
        )
        .await
        .map_err(internal_error)?;

    let total = items.len();
    Ok(Json(ItemsResponse { items, total }))
}

/// `GET /items/:id/revisions` - oldest first.
pub async fn item_revisions(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<RevisionsResponse>, ApiError> {
    ensure_item(&state, id).await?;
    let revisions = state.repo.item_revisions(id).await.map_err(internal_error)?;
    Ok(Json(RevisionsResponse { item_id: id, revisions }))
}

/// `GET /items/:id/audits` - every finding, whichever revision it belongs to.
pub async fn item_audits(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<AuditsResponse>, ApiError> {
    ensure_item(&state, id).await?;
    let audits = state.repo.item_audits(id).await.map_err(internal_error)?;
    Ok(Json(AuditsResponse { item_id: id, audits }))
}

async fn ensure_item(state: &ApiState, id: i64) -> Result<(), ApiError> {
    match state.repo.get_item(id).await.map_err(internal_error)? {
        Some(_) => Ok(()),
        None => Err(not_found("Item")),
    }
}
