//! Intermediate result store: a TTL'd key/value table shared by all
//! workers. Preprocessing children write their outputs here; the generation
//! parent reads them back by result key.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::{PgPool, Row};

/// Reserved prefix for preprocessing outputs.
pub(crate) const JOB_RESULT_KEY_PREFIX: &str = "job-result:";

/// Prefix for cached voice transcripts, keyed by the attachment's original
/// URL so re-posts of the same voice message skip the transcription service.
pub(crate) const TRANSCRIPT_KEY_PREFIX: &str = "transcript:";

#[must_use]
pub(crate) fn job_result_key(job_id: &str) -> String {
    format!("{JOB_RESULT_KEY_PREFIX}{job_id}")
}

#[must_use]
pub(crate) fn transcript_key(original_url: &str) -> String {
    format!("{TRANSCRIPT_KEY_PREFIX}{original_url}")
}

#[derive(Debug, Clone)]
pub(crate) struct ResultCache {
    pool: PgPool,
}

impl ResultCache {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub(crate) async fn put(&self, key: &str, payload: &Value, ttl: Duration) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO job_result_cache (key, payload, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
            SET payload = EXCLUDED.payload,
                expires_at = EXCLUDED.expires_at
            ",
        )
        .bind(key)
        .bind(payload)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store cached result for key {key}"))?;

        Ok(())
    }

    pub(crate) async fn get(&self, key: &str) -> Result<Option<Value>> {
        let row = sqlx::query(
            "SELECT payload FROM job_result_cache WHERE key = $1 AND expires_at > NOW()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to read cached result for key {key}"))?;

        Ok(row.and_then(|r| r.try_get("payload").ok()))
    }

    /// Drop expired rows. Called periodically; reads already exclude expired
    /// entries, this only reclaims space.
    pub(crate) async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM job_result_cache WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await
            .context("failed to purge expired cached results")?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_keys_use_the_reserved_prefix() {
        assert_eq!(job_result_key("audio:r1-audio-0"), "job-result:audio:r1-audio-0");
        assert_eq!(
            transcript_key("https://cdn/voice.ogg"),
            "transcript:https://cdn/voice.ogg"
        );
    }
}
