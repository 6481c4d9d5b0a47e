use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use tracing::info;

use crate::auth::require_writer;
use crate::http::response::{conflict, internal_error};
use crate::rows::{self, WearableCreate};
use crate::state::AppState;

pub async fn list_wearables(State(state): State<AppState>) -> impl IntoResponse {
    match rows::list_wearables(&state.pool).await {
        Ok(wearables) => Json(wearables).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn create_wearable(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<WearableCreate>,
) -> impl IntoResponse {
    let claims = match require_writer(&state.auth, &headers) {
        Ok(claims) => claims,
        Err(resp) => return resp,
    };
    match rows::insert_wearable(&state.pool, &body).await {
        Ok(wearable) => {
            info!(uid = %wearable.uid, by = %claims.sub, "wearable created");
            Json(wearable).into_response()
        }
        Err(e) if rows::is_unique_violation(&e) => conflict("wearable uid already exists"),
        Err(e) => internal_error(e),
    }
}
