use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{
    dispatch, handshake,
    registry::UserSnapshot,
    state::AppState,
};

const TEST_PAGE: &str = include_str!("../static/test.html");

#[derive(Debug, Serialize)]
struct StatsResponse {
    connected_users: usize,
    open_channels: usize,
    users: Vec<UserSnapshot>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/test", get(test_page_handler))
        .route("/notify", post(dispatch::notify))
        .route("/ws", get(handshake::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let users = state.registry.snapshot();
    Json(StatsResponse {
        connected_users: users.len(),
        open_channels: users.iter().map(|user| user.channels).sum(),
        users,
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.render_metrics() {
        Some(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /test - manual protocol page, only served in testing mode.
async fn test_page_handler(State(state): State<Arc<AppState>>) -> Response {
    if !state.testing {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "detail": "Testing mode is disabled" })),
        )
            .into_response();
    }
    Html(TEST_PAGE).into_response()
}
