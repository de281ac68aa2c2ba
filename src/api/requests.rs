use axum::{Json, extract::State, http::StatusCode};
use serde_json::{Value, json};
use tracing::warn;

use crate::app::AppState;
use crate::request::AiRequest;

/// Ingress: accept a conversational AI request and fan it out onto the
/// queue. Responds as soon as the flow is durably submitted.
pub(crate) async fn submit(
    State(state): State<AppState>,
    Json(request): Json<AiRequest>,
) -> (StatusCode, Json<Value>) {
    let request_id = request.request_id.clone();
    match state.orchestrator().submit(request).await {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(json!({"jobId": job_id, "requestId": request_id})),
        ),
        Err(submit_error) => {
            warn!(request_id = %request_id, error = %submit_error, "request rejected");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": submit_error.to_string(), "requestId": request_id})),
            )
        }
    }
}
