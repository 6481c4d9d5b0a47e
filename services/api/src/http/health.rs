use std::sync::atomic::Ordering;

use axum::{extract::State, Json};
use serde_json::json;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "ws_clients": state.ws_clients.load(Ordering::Relaxed),
        "queues": state.queues.depths(),
    }))
}
