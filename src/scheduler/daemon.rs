//! Background daemons: the pending-memory retry cadence and housekeeping
//! for the diagnostic log and the intermediate result cache.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::{task::JoinHandle, time::sleep};
use tracing::{error, info};
use uuid::Uuid;

use crate::delivery::ResultCache;
use crate::queue::{JobQueue, JobType, NewJob};
use crate::store::dao::DiagnosticsDao;

/// Enqueue a pending-memory retry job on a fixed interval. The retry work
/// itself runs through the queue so it shares worker concurrency limits and
/// attempt accounting with everything else.
pub(crate) fn spawn_pending_memory_daemon(
    queue: Arc<JobQueue>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "pending-memory daemon started");
        loop {
            sleep(interval).await;

            let job = NewJob::new(
                format!("pending-memory-retry:{}", Uuid::new_v4()),
                JobType::PendingMemoryRetry,
                json!({}),
            );
            match queue.enqueue(job).await {
                Ok(job_id) => info!(job_id = %job_id, "pending-memory retry job enqueued"),
                Err(enqueue_error) => {
                    error!(error = %enqueue_error, "failed to enqueue pending-memory retry job");
                }
            }
        }
    })
}

/// Enforce the diagnostic-log retention window and reclaim expired cache
/// rows.
pub(crate) fn spawn_maintenance_daemon(
    diagnostics: Arc<dyn DiagnosticsDao>,
    cache: ResultCache,
    retention: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            retention_secs = retention.as_secs(),
            interval_secs = interval.as_secs(),
            "maintenance daemon started"
        );
        loop {
            sleep(interval).await;

            match diagnostics.delete_diagnostics_older_than(retention).await {
                Ok(0) => {}
                Ok(deleted) => info!(deleted, "old diagnostic logs removed"),
                Err(cleanup_error) => {
                    error!(error = %cleanup_error, "diagnostic log cleanup failed");
                }
            }

            match cache.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "expired cached results removed"),
                Err(purge_error) => {
                    error!(error = %purge_error, "result cache purge failed");
                }
            }
        }
    })
}
