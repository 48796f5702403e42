//! HTTP request handlers.

use super::AppState;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};

pub async fn handle_health() -> impl IntoResponse {
    "ok"
}

pub async fn handle_latest_run(State(state): State<AppState>) -> impl IntoResponse {
    match state.scheduler.latest().await {
        Some(record) => Json(record).into_response(),
        None => (StatusCode::NOT_FOUND, "no run has finished yet").into_response(),
    }
}

pub async fn handle_trigger_run(State(state): State<AppState>) -> impl IntoResponse {
    if state.scheduler.spawn_run() {
        (StatusCode::ACCEPTED, "run started")
    } else {
        (StatusCode::CONFLICT, "a run is already in flight")
    }
}
