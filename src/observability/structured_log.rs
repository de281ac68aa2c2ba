//! Structured JSON layer for important events. Field names are rewritten to
//! the service's namespaced observability keys so downstream log pipelines
//! can index them uniformly.

use serde_json::json;
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// `job_id -> persona.job.id`, `request_id -> persona.request.id`, etc.
fn convert_key(key: &str) -> String {
    match key {
        "job_id" => "persona.job.id".to_string(),
        "request_id" => "persona.request.id".to_string(),
        "job_type" => "persona.job.type".to_string(),
        "pending_memory_id" => "persona.memory.pending.id".to_string(),
        "channel" => "persona.delivery.channel".to_string(),
        _ => key.to_string(),
    }
}

pub(crate) struct StructuredLogLayer;

impl<S: Subscriber> Layer<S> for StructuredLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        use tracing::field::Visit;

        struct JsonVisitor {
            values: serde_json::Map<String, serde_json::Value>,
        }

        impl Visit for JsonVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                self.values
                    .insert(convert_key(field.name()), json!(format!("{:?}", value)));
            }

            fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
                self.values.insert(convert_key(field.name()), json!(value));
            }

            fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
                self.values.insert(convert_key(field.name()), json!(value));
            }

            fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
                self.values.insert(convert_key(field.name()), json!(value));
            }

            fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
                self.values.insert(convert_key(field.name()), json!(value));
            }
        }

        let mut visitor = JsonVisitor {
            values: serde_json::Map::new(),
        };
        event.record(&mut visitor);

        visitor
            .values
            .insert("persona.pipeline".to_string(), json!("ai-job-orchestration"));

        let log_entry = json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "level": event.metadata().level().as_str(),
            "target": event.metadata().target(),
            "message": event.metadata().name(),
            "fields": visitor.values,
        });

        if matches!(
            event.metadata().level(),
            &tracing::Level::ERROR | &tracing::Level::WARN | &tracing::Level::INFO
        ) {
            eprintln!("{}", serde_json::to_string(&log_entry).unwrap_or_default());
        }
    }
}
