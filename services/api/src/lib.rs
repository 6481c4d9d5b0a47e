//! Operator-facing API server: CRUD for anchors and wearables, latest-data
//! and stats endpoints, and the `/ws/data` push channel fed by the change
//! pollers.

pub mod auth;
pub mod config;
pub mod db;
pub mod events;
pub mod http;
pub mod pollers;
pub mod rows;
pub mod state;
pub mod ws_data;

pub use state::AppState;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/data", get(ws_data::ws_data_handler))
        .route("/health", get(http::health::health))
        .route("/auth/login", post(http::login::login))
        .route(
            "/anchors",
            get(http::anchors::list_anchors).post(http::anchors::create_anchor),
        )
        .route(
            "/wearables",
            get(http::wearables::list_wearables).post(http::wearables::create_wearable),
        )
        .route("/positions/latest", get(http::latest::positions_latest))
        .route("/scans/latest", get(http::latest::scans_latest))
        .route(
            "/anchor_status/latest",
            get(http::latest::anchor_status_latest),
        )
        .route("/stats", get(http::stats::get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
