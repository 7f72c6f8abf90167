use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use crate::lifecycle::RelayState;

pub async fn health_check(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "peers": state.registry().len(),
    }))
}

pub async fn metrics(State(state): State<RelayState>) -> Response {
    match state.metrics() {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
