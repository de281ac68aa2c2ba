//! Prometheus metric definitions.

use prometheus::{
    Counter, Histogram, Registry, register_counter_with_registry,
    register_histogram_with_registry,
};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Metrics {
    pub flows_submitted: Counter,
    pub jobs_completed: Counter,
    pub jobs_failed: Counter,
    pub job_attempts_failed: Counter,
    pub generation_attempts: Counter,
    pub duplicates_detected: Counter,
    pub deliveries_published: Counter,
    pub pending_memories_queued: Counter,

    pub generation_duration: Histogram,
    pub preprocess_duration: Histogram,
}

impl Metrics {
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            flows_submitted: register_counter_with_registry!(
                "persona_flows_submitted_total",
                "Total number of job flows submitted",
                registry
            )?,
            jobs_completed: register_counter_with_registry!(
                "persona_jobs_completed_total",
                "Total number of jobs completed",
                registry
            )?,
            jobs_failed: register_counter_with_registry!(
                "persona_jobs_failed_total",
                "Total number of jobs failed terminally",
                registry
            )?,
            job_attempts_failed: register_counter_with_registry!(
                "persona_job_attempts_failed_total",
                "Total number of failed job attempts",
                registry
            )?,
            generation_attempts: register_counter_with_registry!(
                "persona_generation_attempts_total",
                "Total number of generator calls including duplicate retries",
                registry
            )?,
            duplicates_detected: register_counter_with_registry!(
                "persona_duplicates_detected_total",
                "Total number of cross-turn duplicate responses detected",
                registry
            )?,
            deliveries_published: register_counter_with_registry!(
                "persona_deliveries_published_total",
                "Total number of delivery notices published",
                registry
            )?,
            pending_memories_queued: register_counter_with_registry!(
                "persona_pending_memories_queued_total",
                "Total number of memories queued after a failed store",
                registry
            )?,
            generation_duration: register_histogram_with_registry!(
                "persona_generation_duration_seconds",
                "End-to-end duration of LLM generation jobs",
                vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0],
                registry
            )?,
            preprocess_duration: register_histogram_with_registry!(
                "persona_preprocess_duration_seconds",
                "Duration of preprocessing (audio/image) jobs",
                vec![0.1, 0.5, 1.0, 2.5, 5.0, 15.0, 60.0],
                registry
            )?,
        })
    }

    pub(crate) fn record_job_completed(&self, _job_type: &str) {
        self.jobs_completed.inc();
    }

    pub(crate) fn record_job_failed(&self, _job_type: &str) {
        self.jobs_failed.inc();
    }

    pub(crate) fn record_job_attempt_failed(&self, _job_type: &str) {
        self.job_attempts_failed.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_once_per_registry() {
        let registry = Arc::new(Registry::new());
        let metrics = Metrics::new(Arc::clone(&registry)).expect("metrics");

        metrics.record_job_completed("llm_generation");
        metrics.duplicates_detected.inc();

        assert!((metrics.jobs_completed.get() - 1.0).abs() < f64::EPSILON);
        assert!(!registry.gather().is_empty());
    }
}
