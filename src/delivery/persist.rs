//! Durable per-job results. One row per job, written by the worker that ran
//! the job and flipped to `delivered` by the subscriber that handed the
//! result to its destination.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobResultStatus {
    PendingDelivery,
    Delivered,
}

impl JobResultStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            JobResultStatus::PendingDelivery => "pending_delivery",
            JobResultStatus::Delivered => "delivered",
        }
    }

    pub(crate) fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending_delivery" => Some(JobResultStatus::PendingDelivery),
            "delivered" => Some(JobResultStatus::Delivered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct JobResultRow {
    pub(crate) job_id: String,
    pub(crate) request_id: String,
    pub(crate) result: Value,
    pub(crate) status: JobResultStatus,
    #[allow(dead_code)]
    pub(crate) created_at: DateTime<Utc>,
    #[allow(dead_code)]
    pub(crate) completed_at: Option<DateTime<Utc>>,
    #[allow(dead_code)]
    pub(crate) delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub(crate) struct JobResultStore {
    pool: PgPool,
}

impl JobResultStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert-or-replace the result row for a job. Re-running an attempt
    /// overwrites the previous attempt's row.
    pub(crate) async fn upsert_result(
        &self,
        job_id: &str,
        request_id: &str,
        result: &Value,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO job_results (job_id, request_id, result, status, completed_at)
            VALUES ($1, $2, $3, 'pending_delivery', NOW())
            ON CONFLICT (job_id) DO UPDATE
            SET request_id = EXCLUDED.request_id,
                result = EXCLUDED.result,
                status = 'pending_delivery',
                completed_at = NOW(),
                delivered_at = NULL
            ",
        )
        .bind(job_id)
        .bind(request_id)
        .bind(result)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to persist result for job {job_id}"))?;

        Ok(())
    }

    pub(crate) async fn get_result(&self, job_id: &str) -> Result<Option<JobResultRow>> {
        let row = sqlx::query(
            r"
            SELECT job_id, request_id, result, status, created_at, completed_at, delivered_at
            FROM job_results
            WHERE job_id = $1
            ",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to fetch result for job {job_id}"))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status_str: String = row.try_get("status").context("failed to get status")?;
        let status = JobResultStatus::from_str(&status_str)
            .with_context(|| format!("invalid job result status: {status_str}"))?;

        Ok(Some(JobResultRow {
            job_id: row.try_get("job_id").context("failed to get job_id")?,
            request_id: row
                .try_get("request_id")
                .context("failed to get request_id")?,
            result: row.try_get("result").context("failed to get result")?,
            status,
            created_at: row
                .try_get("created_at")
                .context("failed to get created_at")?,
            completed_at: row.try_get("completed_at").unwrap_or(None),
            delivered_at: row.try_get("delivered_at").unwrap_or(None),
        }))
    }

    /// Transition `pending_delivery → delivered`. Idempotent: a second
    /// delivery of the same job is a benign no-op.
    pub(crate) async fn mark_delivered(&self, job_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE job_results
            SET status = 'delivered',
                delivered_at = NOW()
            WHERE job_id = $1
              AND status = 'pending_delivery'
            ",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to mark job {job_id} delivered"))?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [JobResultStatus::PendingDelivery, JobResultStatus::Delivered] {
            assert_eq!(JobResultStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(JobResultStatus::from_str("unknown"), None);
    }
}
