use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::types::{Job, JobId, JobStatus, JobType, NewJob};

const JOB_COLUMNS: &str = "id, job_type, status, payload, attempts, max_attempts, \
     parent_job_id, error_message, created_at, started_at, completed_at";

/// Durable job store on Postgres. Dequeue relies on
/// `FOR UPDATE SKIP LOCKED` so concurrent workers never double-claim, and on
/// the flow-admission subquery so a parent is invisible until every child
/// completed.
#[derive(Debug, Clone)]
pub(crate) struct JobStore {
    pool: PgPool,
}

impl JobStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Submit a whole flow (parent plus children) in one transaction.
    ///
    /// Insertion is idempotent on job id: re-submitting a flow whose parent
    /// id already exists is a no-op.
    pub(crate) async fn submit_flow(&self, parent: NewJob, children: Vec<NewJob>) -> Result<JobId> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin flow submission transaction")?;

        let inserted = Self::insert_job(&mut tx, &parent).await?;
        if !inserted {
            tx.rollback()
                .await
                .context("failed to roll back duplicate flow submission")?;
            tracing::debug!(job_id = %parent.id, "flow already submitted, skipping");
            return Ok(parent.id);
        }

        for child in &children {
            Self::insert_job(&mut tx, child).await?;
        }

        tx.commit()
            .await
            .context("failed to commit flow submission")?;

        Ok(parent.id)
    }

    /// Enqueue a single standalone job (no flow links).
    pub(crate) async fn enqueue(&self, job: NewJob) -> Result<JobId> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin enqueue transaction")?;
        Self::insert_job(&mut tx, &job).await?;
        tx.commit().await.context("failed to commit enqueue")?;
        Ok(job.id)
    }

    async fn insert_job(tx: &mut Transaction<'_, Postgres>, job: &NewJob) -> Result<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO jobs
                (id, job_type, status, payload, attempts, max_attempts, parent_job_id)
            VALUES ($1, $2, 'queued', $3, 0, $4, $5)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(&job.id)
        .bind(job.job_type.as_str())
        .bind(&job.payload)
        .bind(job.max_attempts)
        .bind(job.parent_job_id.as_deref())
        .execute(&mut **tx)
        .await
        .with_context(|| format!("failed to insert job {}", job.id))?;

        Ok(result.rows_affected() > 0)
    }

    /// Claim the next dispatchable job of one of the given types.
    ///
    /// A job is dispatchable when it is queued or retrying and has no
    /// incomplete children. Claiming marks it active and spends an attempt.
    pub(crate) async fn claim_next_job(&self, types: &[JobType]) -> Result<Option<Job>> {
        let type_tags: Vec<String> = types.iter().map(|t| t.as_str().to_string()).collect();

        let row = sqlx::query(&format!(
            r"
            UPDATE jobs
            SET status = 'active',
                attempts = attempts + 1,
                started_at = NOW()
            WHERE id = (
                SELECT j.id
                FROM jobs j
                WHERE j.status IN ('queued', 'retrying')
                  AND j.job_type = ANY($1)
                  AND NOT EXISTS (
                      SELECT 1 FROM jobs c
                      WHERE c.parent_job_id = j.id
                        AND c.status <> 'completed'
                  )
                ORDER BY j.created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "
        ))
        .bind(&type_tags)
        .fetch_optional(&self.pool)
        .await
        .context("failed to claim next job")?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(Self::row_to_job(&row)?))
    }

    pub(crate) async fn mark_completed(&self, job_id: &str) -> Result<()> {
        sqlx::query(
            r"
            UPDATE jobs
            SET status = 'completed',
                completed_at = NOW(),
                error_message = NULL
            WHERE id = $1
            ",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("failed to mark job as completed")?;

        Ok(())
    }

    pub(crate) async fn mark_retrying(&self, job_id: &str, error: &str) -> Result<()> {
        sqlx::query(
            r"
            UPDATE jobs
            SET status = 'retrying',
                error_message = $2,
                started_at = NULL
            WHERE id = $1
            ",
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("failed to mark job as retrying")?;

        Ok(())
    }

    /// Terminally fail a job. When the job is a child of a flow, the parent
    /// is cancelled too so it is never dispatched with missing inputs.
    pub(crate) async fn mark_failed(&self, job_id: &str, error: &str) -> Result<()> {
        let row = sqlx::query(
            r"
            UPDATE jobs
            SET status = 'failed',
                error_message = $2,
                completed_at = NOW()
            WHERE id = $1
            RETURNING parent_job_id
            ",
        )
        .bind(job_id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await
        .context("failed to mark job as failed")?;

        let parent_id: Option<String> = match row {
            Some(r) => r.try_get::<Option<String>, _>("parent_job_id").unwrap_or(None),
            None => None,
        };
        if let Some(parent_id) = parent_id {
            let cancelled = sqlx::query(
                r"
                UPDATE jobs
                SET status = 'failed',
                    error_message = $2,
                    completed_at = NOW()
                WHERE id = $1
                  AND status IN ('queued', 'retrying')
                ",
            )
            .bind(&parent_id)
            .bind(format!("cancelled: child job {job_id} failed terminally"))
            .execute(&self.pool)
            .await
            .context("failed to cancel parent job")?;

            if cancelled.rows_affected() > 0 {
                tracing::warn!(
                    parent_job_id = %parent_id,
                    child_job_id = %job_id,
                    "parent flow cancelled after terminal child failure"
                );
            }
        }

        Ok(())
    }

    #[allow(dead_code)]
    pub(crate) async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to get job")?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(Self::row_to_job(&row)?))
    }

    /// Requeue jobs stranded in `active` by a crashed worker.
    pub(crate) async fn requeue_stale_active(&self, older_than_secs: i64) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET status = 'retrying',
                started_at = NULL,
                error_message = 'requeued: worker lost'
            WHERE status = 'active'
              AND started_at < NOW() - make_interval(secs => $1)
              AND attempts < max_attempts
            ",
        )
        .bind(older_than_secs as f64)
        .execute(&self.pool)
        .await
        .context("failed to requeue stale active jobs")?;

        Ok(result.rows_affected())
    }

    fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job> {
        let id: String = row.try_get("id").context("failed to get id")?;
        let type_str: String = row.try_get("job_type").context("failed to get job_type")?;
        let status_str: String = row.try_get("status").context("failed to get status")?;
        let payload: Value = row.try_get("payload").context("failed to get payload")?;
        let attempts: i32 = row.try_get("attempts").unwrap_or(0);
        let max_attempts: i32 = row.try_get("max_attempts").unwrap_or(3);
        let parent_job_id: Option<String> = row.try_get("parent_job_id").ok().flatten();
        let error_message: Option<String> = row.try_get("error_message").ok().flatten();
        let created_at = row
            .try_get("created_at")
            .context("failed to get created_at")?;
        let started_at = row.try_get("started_at").ok().flatten();
        let completed_at = row.try_get("completed_at").ok().flatten();

        let job_type = JobType::from_str(&type_str)
            .with_context(|| format!("invalid job type: {type_str}"))?;
        let status = JobStatus::from_str(&status_str)
            .with_context(|| format!("invalid job status: {status_str}"))?;

        Ok(Job {
            id,
            job_type,
            status,
            payload,
            attempts,
            max_attempts,
            parent_job_id,
            error_message,
            created_at,
            started_at,
            completed_at,
        })
    }
}
