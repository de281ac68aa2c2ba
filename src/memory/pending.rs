//! Pending-memory retrier. Pulls failed memory stores oldest-first, retries
//! storage with a bounded attempt budget, and permanently shelves rows whose
//! metadata no longer validates.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::clients::VectorMemoryStore;
use crate::schema::memory::PENDING_MEMORY_METADATA_SCHEMA;
use crate::schema::validate_json;
use crate::store::dao::PendingMemoryDao;
use crate::store::models::{PendingMemoryRow, PendingMemoryStats};

use super::DeferredMemoryRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub(crate) struct RetryRunSummary {
    pub(crate) processed: usize,
    pub(crate) stored: usize,
    pub(crate) failed: usize,
    pub(crate) shelved: usize,
    pub(crate) gave_up: usize,
}

pub(crate) struct PendingMemoryRetrier {
    dao: Arc<dyn PendingMemoryDao>,
    memory_store: Arc<dyn VectorMemoryStore>,
    max_attempts: i32,
    batch_size: i64,
}

impl PendingMemoryRetrier {
    pub(crate) fn new(
        dao: Arc<dyn PendingMemoryDao>,
        memory_store: Arc<dyn VectorMemoryStore>,
        max_attempts: i32,
        batch_size: i64,
    ) -> Self {
        Self {
            dao,
            memory_store,
            max_attempts,
            batch_size,
        }
    }

    /// One retry pass. Running this twice over the same state is equivalent
    /// to running it once: stored rows are gone, failed rows advance their
    /// attempt counter exactly once per pass.
    pub(crate) async fn run_once(&self, batch_override: Option<i64>) -> Result<RetryRunSummary> {
        let batch = batch_override.unwrap_or(self.batch_size);
        let rows = self
            .dao
            .fetch_retryable_memories(self.max_attempts, batch)
            .await
            .context("failed to fetch retryable pending memories")?;

        let mut summary = RetryRunSummary::default();
        for row in rows {
            summary.processed += 1;
            self.process_row(row, &mut summary).await?;
        }

        if summary.processed > 0 {
            info!(
                processed = summary.processed,
                stored = summary.stored,
                failed = summary.failed,
                shelved = summary.shelved,
                gave_up = summary.gave_up,
                "pending memory retry pass finished"
            );
        }

        Ok(summary)
    }

    async fn process_row(
        &self,
        row: PendingMemoryRow,
        summary: &mut RetryRunSummary,
    ) -> Result<()> {
        let validation = validate_json(&PENDING_MEMORY_METADATA_SCHEMA, &row.metadata);
        if !validation.valid {
            let reason = format!("invalid metadata: {}", validation.errors.join("; "));
            warn!(
                pending_memory_id = %row.id,
                reason = %reason,
                "shelving pending memory permanently"
            );
            self.dao.shelve_pending_memory(row.id, &reason).await?;
            summary.shelved += 1;
            return Ok(());
        }

        let record = DeferredMemoryRecord {
            text: row.text.clone(),
            metadata: row.metadata.clone(),
            embedding: None,
        };

        match self.memory_store.store_memory(&record).await {
            Ok(()) => {
                self.dao.delete_pending_memory(row.id).await?;
                summary.stored += 1;
                Ok(())
            }
            Err(storage_error) => {
                let attempts = row.attempts + 1;
                let message = storage_error.to_string();
                self.dao
                    .record_memory_failure(row.id, attempts, &message)
                    .await?;
                summary.failed += 1;

                if attempts >= self.max_attempts {
                    summary.gave_up += 1;
                    error!(
                        pending_memory_id = %row.id,
                        attempts,
                        error = %message,
                        "pending memory exhausted its retry budget, giving up"
                    );
                } else {
                    warn!(
                        pending_memory_id = %row.id,
                        attempts,
                        max_attempts = self.max_attempts,
                        error = %message,
                        "pending memory storage failed, will retry"
                    );
                }
                Ok(())
            }
        }
    }

    pub(crate) async fn stats(&self) -> Result<PendingMemoryStats> {
        self.dao.pending_memory_stats().await
    }
}

#[async_trait::async_trait]
impl crate::queue::JobHandler for PendingMemoryRetrier {
    async fn handle(&self, job: &crate::queue::Job) -> Result<crate::queue::HandlerOutcome> {
        let payload: crate::request::PendingMemoryRetryPayload =
            serde_json::from_value(job.payload.clone()).unwrap_or_default();

        let summary = self.run_once(payload.batch_size).await?;

        Ok(crate::queue::HandlerOutcome {
            request_id: job.id.clone(),
            result: serde_json::json!({
                "requestId": job.id,
                "success": true,
                "summary": summary,
            }),
            cache_write: None,
            delivery: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::{MemoryHit, MemorySearch};
    use crate::store::dao::mock::MockDao;
    use crate::store::models::PENDING_MEMORY_SHELVED;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    struct StubMemoryStore {
        fail: bool,
    }

    #[async_trait]
    impl VectorMemoryStore for StubMemoryStore {
        async fn store_memory(&self, _record: &DeferredMemoryRecord) -> Result<()> {
            if self.fail {
                Err(anyhow!("vector store down"))
            } else {
                Ok(())
            }
        }

        async fn search_memories(&self, _search: &MemorySearch) -> Result<Vec<MemoryHit>> {
            Ok(vec![])
        }

        async fn list_memory_texts(&self, _personality_id: Uuid) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    fn pending_row(attempts: i32, metadata: serde_json::Value) -> PendingMemoryRow {
        PendingMemoryRow {
            id: Uuid::new_v4(),
            text: "remember this".to_string(),
            metadata,
            attempts,
            last_attempt_at: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    fn valid_metadata() -> serde_json::Value {
        json!({"personalityId": "p1", "userId": "u1"})
    }

    #[tokio::test]
    async fn successful_retry_deletes_the_row() {
        let dao = Arc::new(MockDao::new());
        dao.add_pending(pending_row(1, valid_metadata()));
        let retrier = PendingMemoryRetrier::new(
            dao.clone(),
            Arc::new(StubMemoryStore { fail: false }),
            3,
            100,
        );

        let summary = retrier.run_once(None).await.expect("run");

        assert_eq!(summary.stored, 1);
        assert!(dao.pending_rows().is_empty());
    }

    #[tokio::test]
    async fn failure_increments_attempts_and_records_error() {
        let dao = Arc::new(MockDao::new());
        dao.add_pending(pending_row(0, valid_metadata()));
        let retrier = PendingMemoryRetrier::new(
            dao.clone(),
            Arc::new(StubMemoryStore { fail: true }),
            3,
            100,
        );

        let summary = retrier.run_once(None).await.expect("run");

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.gave_up, 0);
        let rows = dao.pending_rows();
        assert_eq!(rows[0].attempts, 1);
        assert!(rows[0].error.as_deref().unwrap().contains("vector store"));
        assert!(rows[0].last_attempt_at.is_some());
    }

    #[tokio::test]
    async fn exhausted_row_is_left_at_cap_and_skipped_afterwards() {
        let dao = Arc::new(MockDao::new());
        dao.add_pending(pending_row(2, valid_metadata()));
        let retrier = PendingMemoryRetrier::new(
            dao.clone(),
            Arc::new(StubMemoryStore { fail: true }),
            3,
            100,
        );

        let first = retrier.run_once(None).await.expect("run");
        assert_eq!(first.gave_up, 1);
        assert_eq!(dao.pending_rows()[0].attempts, 3);

        // The row no longer matches `attempts < cap`; further runs leave it
        // untouched.
        let second = retrier.run_once(None).await.expect("run");
        assert_eq!(second.processed, 0);
        assert_eq!(dao.pending_rows()[0].attempts, 3);
    }

    #[tokio::test]
    async fn invalid_metadata_is_shelved_not_retried() {
        let dao = Arc::new(MockDao::new());
        dao.add_pending(pending_row(0, json!({"userId": "u1"})));
        let retrier = PendingMemoryRetrier::new(
            dao.clone(),
            Arc::new(StubMemoryStore { fail: false }),
            3,
            100,
        );

        let summary = retrier.run_once(None).await.expect("run");

        assert_eq!(summary.shelved, 1);
        assert_eq!(summary.stored, 0);
        let rows = dao.pending_rows();
        assert_eq!(rows[0].attempts, PENDING_MEMORY_SHELVED);
        assert!(rows[0].error.as_deref().unwrap().contains("invalid metadata"));
    }

    #[tokio::test]
    async fn batch_override_limits_the_pass() {
        let dao = Arc::new(MockDao::new());
        for _ in 0..5 {
            dao.add_pending(pending_row(0, valid_metadata()));
        }
        let retrier = PendingMemoryRetrier::new(
            dao.clone(),
            Arc::new(StubMemoryStore { fail: false }),
            3,
            100,
        );

        let summary = retrier.run_once(Some(2)).await.expect("run");

        assert_eq!(summary.processed, 2);
        assert_eq!(dao.pending_rows().len(), 3);
    }
}
