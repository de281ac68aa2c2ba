use axum::{Json, extract::State, http::StatusCode};
use serde_json::{Value, json};

use crate::app::AppState;

pub(crate) async fn live(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    state.telemetry().record_live_probe();
    (StatusCode::OK, Json(json!({"status": "alive"})))
}

pub(crate) async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    state.telemetry().record_ready_probe();
    (StatusCode::OK, Json(json!({"status": "ready"})))
}
