use axum::{extract::State, response::IntoResponse, Json};

use crate::http::response::internal_error;
use crate::rows;
use crate::state::AppState;

pub async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    match rows::fetch_stats(&state.pool).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal_error(e),
    }
}
