//! Diagnostic flight recorder. Accumulates timing, parameter, and error
//! detail across every generation attempt; the payload is sanitized for
//! JSONB and written fire-and-forget once the job settles. A write failure
//! never affects the result.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

use crate::clients::generator::GenerationParams;
use crate::store::dao::DiagnosticsDao;
use crate::store::models::DiagnosticRecord;
use crate::util::text::sanitize_json;

use super::dedup::DuplicateCheck;

pub(crate) struct FlightRecorder {
    request_id: String,
    started: Instant,
    events: Vec<Value>,
}

impl FlightRecorder {
    pub(crate) fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            started: Instant::now(),
            events: Vec::new(),
        }
    }

    fn push(&mut self, label: &str, mut data: Value) {
        if let Some(map) = data.as_object_mut() {
            map.insert("event".to_string(), json!(label));
            map.insert(
                "elapsedMs".to_string(),
                json!(self.started.elapsed().as_millis() as u64),
            );
        }
        self.events.push(data);
    }

    pub(crate) fn note(&mut self, label: &str, data: Value) {
        self.push(label, data);
    }

    pub(crate) fn note_attempt(&mut self, attempt: usize, params: &GenerationParams) {
        self.push(
            "generation_attempt",
            json!({
                "attempt": attempt,
                "temperature": params.temperature,
                "frequencyPenalty": params.frequency_penalty,
            }),
        );
    }

    pub(crate) fn note_duplicate(&mut self, attempt: usize, check: &DuplicateCheck) {
        self.push(
            "duplicate_detected",
            json!({
                "attempt": attempt,
                "matchIndex": check.match_index,
                "layer": check.layer.map(|l| l.name()),
            }),
        );
    }

    pub(crate) fn note_error(&mut self, step: &str, error: &anyhow::Error) {
        self.push(
            "stage_error",
            json!({
                "step": step,
                "error": error.to_string(),
            }),
        );
    }

    /// Write the accumulated payload. Fire-and-forget: the spawned task owns
    /// the record and failures are only logged.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn finish(
        self,
        dao: Arc<dyn DiagnosticsDao>,
        personality_id: Option<Uuid>,
        user_id: String,
        guild_id: Option<String>,
        channel_id: Option<String>,
        model: String,
        provider: String,
    ) {
        let duration_ms = i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX);
        let data = sanitize_json(json!({"events": self.events}));

        let record = DiagnosticRecord {
            request_id: self.request_id,
            trigger_message_id: None,
            personality_id,
            user_id,
            guild_id,
            channel_id,
            model,
            provider,
            duration_ms,
            data,
        };

        tokio::spawn(async move {
            if let Err(write_error) = dao.insert_diagnostic(&record).await {
                warn!(
                    request_id = %record.request_id,
                    error = %write_error,
                    "failed to write diagnostic record"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::dao::mock::MockDao;

    #[tokio::test]
    async fn recorder_accumulates_and_writes_sanitized_payload() {
        let dao = Arc::new(MockDao::new());
        let mut recorder = FlightRecorder::new("r1");

        recorder.note_attempt(1, &GenerationParams::default());
        recorder.note("odd_text", json!({"content": "bad\u{0}byte"}));
        recorder.note_error("generation", &anyhow::anyhow!("boom"));

        recorder.finish(
            dao.clone(),
            None,
            "u1".to_string(),
            None,
            Some("c1".to_string()),
            "model".to_string(),
            "provider".to_string(),
        );

        // The write is fire-and-forget; give the spawned task a beat.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let diagnostics = dao.diagnostics.lock().unwrap();
        assert_eq!(diagnostics.len(), 1);
        let record = &diagnostics[0];
        assert_eq!(record.request_id, "r1");
        let events = record.data["events"].as_array().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1]["content"], "badbyte");
    }
}
