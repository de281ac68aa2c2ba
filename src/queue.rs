//! Durable job queue with flow (parent/children) semantics on Postgres.
//! Workers pull per-type pools; the parent of a flow is only dispatchable
//! once every child completed, and a terminal child failure cancels it.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::delivery::{DeliveryNotifier, JobResultStore, ResultCache};
use crate::observability::metrics::Metrics;

mod store;
mod types;
pub(crate) mod worker;

pub(crate) use store::JobStore;
pub(crate) use types::{Job, JobId, JobStatus, JobType, NewJob};
pub(crate) use worker::{CacheWrite, HandlerOutcome, JobHandler, JobRouter};
use worker::QueueWorker;

/// How long an `active` job may sit without progress before a restarted
/// worker fleet considers its owner dead and requeues it.
const STALE_ACTIVE_SECS: i64 = 15 * 60;

/// Queue facade: owns the store and the per-type worker pools.
pub(crate) struct JobQueue {
    store: Arc<JobStore>,
    workers: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl JobQueue {
    pub(crate) fn new(store: JobStore) -> Self {
        Self {
            store: Arc::new(store),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Submit a flow atomically. Returns the parent job id.
    pub(crate) async fn submit_flow(&self, parent: NewJob, children: Vec<NewJob>) -> Result<JobId> {
        self.store.submit_flow(parent, children).await
    }

    pub(crate) async fn enqueue(&self, job: NewJob) -> Result<JobId> {
        self.store.enqueue(job).await
    }

    /// Spawn the worker pools: one pool per job-type group, sized from
    /// configuration. Also requeues jobs stranded by a previous crash.
    pub(crate) async fn start(
        &self,
        config: &Config,
        router: Arc<JobRouter>,
        cache: ResultCache,
        results: JobResultStore,
        notifier: DeliveryNotifier,
        metrics: Arc<Metrics>,
    ) -> Result<()> {
        match self.store.requeue_stale_active(STALE_ACTIVE_SECS).await {
            Ok(0) => {}
            Ok(requeued) => warn!(requeued, "requeued jobs stranded by a previous worker"),
            Err(error) => warn!(error = %error, "failed to requeue stale active jobs"),
        }

        let pools: [(&str, Vec<JobType>, usize); 3] = [
            (
                "generation",
                vec![JobType::LlmGeneration],
                config.queue_generation_concurrency(),
            ),
            (
                "preprocess",
                vec![JobType::AudioTranscription, JobType::ImageDescription],
                config.queue_preprocess_concurrency(),
            ),
            (
                "exchange",
                vec![
                    JobType::ShapesImport,
                    JobType::ShapesExport,
                    JobType::PendingMemoryRetry,
                ],
                config.queue_exchange_concurrency(),
            ),
        ];

        // Configured pool sizes are capped relative to the host so one
        // worker process cannot oversubscribe a small machine.
        let max_pool = num_cpus::get().saturating_mul(2).max(2);

        let mut workers = self.workers.lock().unwrap();
        for (pool_name, types, concurrency) in pools {
            for slot in 0..concurrency.clamp(1, max_pool) {
                let worker = QueueWorker::new(
                    Arc::clone(&self.store),
                    Arc::clone(&router),
                    cache.clone(),
                    results.clone(),
                    notifier.clone(),
                    Arc::clone(&metrics),
                    types.clone(),
                    config.queue_poll_interval(),
                    config.queue_retry_delay_ms(),
                );
                let handle = tokio::spawn(async move { worker.run().await });
                workers.push(handle);
                info!(pool = pool_name, slot, "queue worker spawned");
            }
        }

        Ok(())
    }

    /// Abort and await every worker task.
    #[allow(dead_code)]
    pub(crate) async fn shutdown(&self) {
        info!("shutting down queue workers");
        let workers = {
            let mut guard = self.workers.lock().unwrap();
            std::mem::take(&mut *guard)
        };

        for worker in &workers {
            worker.abort();
        }
        for worker in workers {
            let _ = worker.await;
        }

        info!("all queue workers stopped");
    }
}
