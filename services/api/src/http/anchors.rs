use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use tracing::info;

use crate::auth::require_writer;
use crate::http::response::{conflict, internal_error};
use crate::rows::{self, AnchorCreate};
use crate::state::AppState;

pub async fn list_anchors(State(state): State<AppState>) -> impl IntoResponse {
    match rows::list_anchors(&state.pool).await {
        Ok(anchors) => Json(anchors).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn create_anchor(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AnchorCreate>,
) -> impl IntoResponse {
    let claims = match require_writer(&state.auth, &headers) {
        Ok(claims) => claims,
        Err(resp) => return resp,
    };
    match rows::insert_anchor(&state.pool, &body).await {
        Ok(anchor) => {
            info!(id = %anchor.id, by = %claims.sub, "anchor created");
            Json(anchor).into_response()
        }
        Err(e) if rows::is_unique_violation(&e) => conflict("anchor id already exists"),
        Err(e) => internal_error(e),
    }
}
