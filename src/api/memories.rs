use axum::{Json, extract::State, http::StatusCode};
use serde_json::{Value, json};
use tracing::error;

use crate::app::AppState;

/// Pending-memory queue statistics: total plus a per-attempt histogram.
pub(crate) async fn stats(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.pending_memory_stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(serde_json::to_value(stats).unwrap_or_else(|_| json!({}))),
        ),
        Err(stats_error) => {
            error!(error = %stats_error, "failed to read pending memory stats");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "failed to read pending memory stats"})),
            )
        }
    }
}
