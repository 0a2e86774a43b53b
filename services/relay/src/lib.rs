pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod janitor;
pub mod outbox;
pub mod registry;
pub mod router;
pub mod state;
pub mod store;
pub mod ws_common;
pub mod ws_producer;
pub mod ws_viewer;

pub use state::AppState;


use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_common::ws_handler))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    match state.catalog.list_active().await {
        Ok(_) => (StatusCode::OK, "ready"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "catalog unreachable"),
    }
}
