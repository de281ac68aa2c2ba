//! Worker loop and per-type dispatch. Handlers are stateless: everything a
//! job needs flows through its payload and the injected components, so any
//! worker slot can run any job of its pool's types.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::delivery::{DeliveryNotifier, JobResultStore, ResultCache};
use crate::observability::metrics::Metrics;
use crate::request::ResponseDestination;

use super::store::JobStore;
use super::types::{Job, JobType};

/// A write into the intermediate result store, produced by preprocessing
/// handlers for their parent to read back.
#[derive(Debug, Clone)]
pub(crate) struct CacheWrite {
    pub(crate) key: String,
    pub(crate) payload: Value,
    pub(crate) ttl: Duration,
}

/// What a handler hands back for the worker to persist and announce.
#[derive(Debug, Clone)]
pub(crate) struct HandlerOutcome {
    pub(crate) request_id: String,
    pub(crate) result: Value,
    pub(crate) cache_write: Option<CacheWrite>,
    /// Present when a destination should be notified about this result.
    pub(crate) delivery: Option<ResponseDestination>,
}

/// One job type's executor. Returning `Err` spends a queue attempt;
/// returning `Ok` completes the job even when the result payload carries a
/// soft failure.
#[async_trait]
pub(crate) trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome>;
}

/// Static dispatch table from type tag to handler.
pub(crate) struct JobRouter {
    pub(crate) generation: Arc<dyn JobHandler>,
    pub(crate) audio: Arc<dyn JobHandler>,
    pub(crate) image: Arc<dyn JobHandler>,
    pub(crate) shapes_import: Arc<dyn JobHandler>,
    pub(crate) shapes_export: Arc<dyn JobHandler>,
    pub(crate) pending_memory: Arc<dyn JobHandler>,
}

impl JobRouter {
    fn handler_for(&self, job_type: JobType) -> &Arc<dyn JobHandler> {
        match job_type {
            JobType::LlmGeneration => &self.generation,
            JobType::AudioTranscription => &self.audio,
            JobType::ImageDescription => &self.image,
            JobType::ShapesImport => &self.shapes_import,
            JobType::ShapesExport => &self.shapes_export,
            JobType::PendingMemoryRetry => &self.pending_memory,
        }
    }
}

/// Background worker bound to one pool of job types.
pub(crate) struct QueueWorker {
    store: Arc<JobStore>,
    router: Arc<JobRouter>,
    cache: ResultCache,
    results: JobResultStore,
    notifier: DeliveryNotifier,
    metrics: Arc<Metrics>,
    types: Vec<JobType>,
    poll_interval: Duration,
    retry_delay_ms: u64,
}

impl QueueWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<JobStore>,
        router: Arc<JobRouter>,
        cache: ResultCache,
        results: JobResultStore,
        notifier: DeliveryNotifier,
        metrics: Arc<Metrics>,
        types: Vec<JobType>,
        poll_interval: Duration,
        retry_delay_ms: u64,
    ) -> Self {
        Self {
            store,
            router,
            cache,
            results,
            notifier,
            metrics,
            types,
            poll_interval,
            retry_delay_ms,
        }
    }

    pub(crate) async fn run(&self) -> Result<()> {
        info!(types = ?self.types, "queue worker started");

        loop {
            let job = match self.store.claim_next_job(&self.types).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    sleep(self.poll_interval).await;
                    continue;
                }
                Err(claim_error) => {
                    error!(error = %claim_error, "failed to claim next job");
                    sleep(Duration::from_millis(1000)).await;
                    continue;
                }
            };

            self.process_job(&job).await;
        }
    }

    async fn process_job(&self, job: &Job) {
        info!(
            job_id = %job.id,
            job_type = job.job_type.as_str(),
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "processing job"
        );

        let handler_started = std::time::Instant::now();
        let handler = self.router.handler_for(job.job_type);
        let handled = handler.handle(job).await;
        if matches!(
            job.job_type,
            JobType::AudioTranscription | JobType::ImageDescription
        ) {
            self.metrics
                .preprocess_duration
                .observe(handler_started.elapsed().as_secs_f64());
        }

        match handled {
            Ok(outcome) => {
                if let Err(finalize_error) = self.finalize_success(job, &outcome).await {
                    error!(
                        job_id = %job.id,
                        error = %finalize_error,
                        "failed to finalize completed job"
                    );
                    self.record_attempt_failure(job, &finalize_error.to_string())
                        .await;
                } else {
                    self.metrics.record_job_completed(job.job_type.as_str());
                }
            }
            Err(handler_error) => {
                self.metrics.record_job_attempt_failed(job.job_type.as_str());
                self.record_attempt_failure(job, &handler_error.to_string())
                    .await;
            }
        }
    }

    /// Persist the result row, propagate the cache write, publish the
    /// delivery notice, and complete the job. Every completed attempt leaves
    /// a durable trace; no job exits the worker silently.
    async fn finalize_success(&self, job: &Job, outcome: &HandlerOutcome) -> Result<()> {
        if let Some(write) = &outcome.cache_write {
            self.cache.put(&write.key, &write.payload, write.ttl).await?;
        }

        self.results
            .upsert_result(&job.id, &outcome.request_id, &outcome.result)
            .await?;

        if let Some(destination) = &outcome.delivery {
            self.notifier
                .publish(
                    &destination.delivery_channel(),
                    &job.id,
                    &outcome.request_id,
                )
                .await?;
            self.metrics.deliveries_published.inc();
        }

        self.store.mark_completed(&job.id).await?;

        debug!(job_id = %job.id, "job completed");
        Ok(())
    }

    async fn record_attempt_failure(&self, job: &Job, message: &str) {
        if job.is_final_attempt() {
            error!(
                job_id = %job.id,
                attempt = job.attempts,
                error = %message,
                "job failed terminally"
            );
            if let Err(store_error) = self.store.mark_failed(&job.id, message).await {
                error!(job_id = %job.id, error = %store_error, "failed to mark job failed");
            }
            self.metrics.record_job_failed(job.job_type.as_str());
        } else {
            warn!(
                job_id = %job.id,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                error = %message,
                "job attempt failed, will retry"
            );
            if let Err(store_error) = self.store.mark_retrying(&job.id, message).await {
                error!(job_id = %job.id, error = %store_error, "failed to mark job retrying");
            }

            let attempt = u32::try_from(job.attempts.max(0)).unwrap_or(0).min(3);
            let delay_ms = self.retry_delay_ms * (1_u64 << attempt);
            debug!(job_id = %job.id, delay_ms, "waiting before retry");
            sleep(Duration::from_millis(delay_ms)).await;
        }
    }
}
