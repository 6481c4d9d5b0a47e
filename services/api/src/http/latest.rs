use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::http::response::internal_error;
use crate::rows;
use crate::state::AppState;

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    pub limit: Option<i64>,
}

/// Latest known position per wearable.
pub async fn positions_latest(
    State(state): State<AppState>,
    Query(query): Query<LatestQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    match rows::latest_positions(&state.pool, limit).await {
        Ok(positions) => Json(positions).into_response(),
        Err(e) => internal_error(e),
    }
}

/// Latest non-null scan telemetry per wearable.
pub async fn scans_latest(State(state): State<AppState>) -> impl IntoResponse {
    match rows::latest_scans(&state.pool).await {
        Ok(scans) => Json(scans).into_response(),
        Err(e) => internal_error(e),
    }
}

/// Latest heartbeat per anchor.
pub async fn anchor_status_latest(State(state): State<AppState>) -> impl IntoResponse {
    match rows::latest_anchor_status(&state.pool).await {
        Ok(statuses) => Json(statuses).into_response(),
        Err(e) => internal_error(e),
    }
}
