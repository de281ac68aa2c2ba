//! Postgres implementation of the DAO traits.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::store::models::{
    AttemptBucket, DiagnosticRecord, ImportCounters, ImportedPersonality, LlmConfigRecord,
    PendingMemoryRow, PendingMemoryStats, PersonalityRecord,
};

use super::{CredentialDao, DiagnosticsDao, ExchangeJobDao, PendingMemoryDao, PersonalityDao};

#[derive(Debug, Clone)]
pub(crate) struct PgWorkerDao {
    pool: PgPool,
}

impl PgWorkerDao {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_personality(row: &PgRow) -> Result<PersonalityRecord> {
        Ok(PersonalityRecord {
            id: row.try_get("id").context("failed to get id")?,
            slug: row.try_get("slug").context("failed to get slug")?,
            display_name: row
                .try_get("display_name")
                .context("failed to get display_name")?,
            system_prompt: row
                .try_get("system_prompt")
                .context("failed to get system_prompt")?,
            model: row.try_get("model").context("failed to get model")?,
            vision_model: row.try_get("vision_model").unwrap_or(None),
            avatar_url: row.try_get("avatar_url").unwrap_or(None),
            persona_id: row
                .try_get("persona_id")
                .context("failed to get persona_id")?,
            share_ltm_across_personalities: row
                .try_get("share_ltm_across_personalities")
                .unwrap_or(false),
            include_prompt_in_vision: row.try_get("include_prompt_in_vision").unwrap_or(false),
        })
    }

    fn row_to_config(row: &PgRow) -> LlmConfigRecord {
        LlmConfigRecord {
            model: row.try_get("model").unwrap_or(None),
            vision_model: row.try_get("vision_model").unwrap_or(None),
            temperature: row.try_get("temperature").unwrap_or(None),
            frequency_penalty: row.try_get("frequency_penalty").unwrap_or(None),
            max_tokens: row.try_get("max_tokens").unwrap_or(None),
        }
    }

    fn row_to_pending_memory(row: &PgRow) -> Result<PendingMemoryRow> {
        Ok(PendingMemoryRow {
            id: row.try_get("id").context("failed to get id")?,
            text: row.try_get("text").context("failed to get text")?,
            metadata: row.try_get("metadata").context("failed to get metadata")?,
            attempts: row.try_get("attempts").unwrap_or(0),
            last_attempt_at: row.try_get("last_attempt_at").unwrap_or(None),
            error: row.try_get("error").unwrap_or(None),
            created_at: row
                .try_get("created_at")
                .context("failed to get created_at")?,
        })
    }
}

#[async_trait]
impl PersonalityDao for PgWorkerDao {
    async fn personality_by_slug(&self, slug: &str) -> Result<Option<PersonalityRecord>> {
        let row = sqlx::query(
            r"
            SELECT p.id, p.slug, p.display_name, sp.content AS system_prompt,
                   p.model, p.vision_model, p.avatar_url, p.persona_id,
                   per.share_ltm_across_personalities, p.include_prompt_in_vision
            FROM personalities p
            JOIN system_prompts sp ON sp.id = p.system_prompt_id
            JOIN personas per ON per.id = p.persona_id
            WHERE p.slug = $1
            ",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch personality by slug")?;

        row.as_ref().map(Self::row_to_personality).transpose()
    }

    async fn user_personality_config(
        &self,
        user_id: &str,
        personality_id: Uuid,
    ) -> Result<Option<LlmConfigRecord>> {
        let row = sqlx::query(
            r"
            SELECT c.model, c.vision_model, c.temperature, c.frequency_penalty, c.max_tokens
            FROM user_personality_configs upc
            JOIN llm_configs c ON c.id = upc.llm_config_id
            WHERE upc.user_id = $1 AND upc.personality_id = $2
            ",
        )
        .bind(user_id)
        .bind(personality_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch user personality config")?;

        Ok(row.as_ref().map(Self::row_to_config))
    }

    async fn user_default_config(&self, user_id: &str) -> Result<Option<LlmConfigRecord>> {
        let row = sqlx::query(
            r"
            SELECT c.model, c.vision_model, c.temperature, c.frequency_penalty, c.max_tokens
            FROM user_default_configs udc
            JOIN llm_configs c ON c.id = udc.llm_config_id
            WHERE udc.user_id = $1
            ",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch user default config")?;

        Ok(row.as_ref().map(Self::row_to_config))
    }

    async fn personality_default_config(
        &self,
        personality_id: Uuid,
    ) -> Result<Option<LlmConfigRecord>> {
        let row = sqlx::query(
            r"
            SELECT c.model, c.vision_model, c.temperature, c.frequency_penalty, c.max_tokens
            FROM personality_default_configs pdc
            JOIN llm_configs c ON c.id = pdc.llm_config_id
            WHERE pdc.personality_id = $1
            ",
        )
        .bind(personality_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch personality default config")?;

        Ok(row.as_ref().map(Self::row_to_config))
    }

    async fn guest_default_model(&self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM app_settings WHERE key = 'guest_default_model'")
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch guest default model setting")?;

        Ok(row.and_then(|r| r.try_get("value").ok()))
    }

    async fn personality_owner(&self, personality_id: Uuid) -> Result<Option<String>> {
        let row = sqlx::query("SELECT user_id FROM personality_owners WHERE personality_id = $1")
            .bind(personality_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch personality owner")?;

        Ok(row.and_then(|r| r.try_get("user_id").ok()))
    }

    async fn upsert_imported_personality(&self, import: &ImportedPersonality) -> Result<Uuid> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin import transaction")?;

        let prompt_row = sqlx::query(
            r"
            INSERT INTO system_prompts (id, slug, content)
            VALUES (gen_random_uuid(), $1, $2)
            ON CONFLICT (slug) DO UPDATE SET content = EXCLUDED.content
            RETURNING id
            ",
        )
        .bind(&import.slug)
        .bind(&import.system_prompt)
        .fetch_one(&mut *tx)
        .await
        .context("failed to upsert system prompt")?;
        let system_prompt_id: Uuid = prompt_row.try_get("id")?;

        let persona_row = sqlx::query(
            r"
            INSERT INTO personas (id, owner_user_id)
            VALUES (gen_random_uuid(), $1)
            ON CONFLICT (owner_user_id) DO UPDATE SET owner_user_id = EXCLUDED.owner_user_id
            RETURNING id
            ",
        )
        .bind(&import.owner_user_id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to upsert persona")?;
        let persona_id: Uuid = persona_row.try_get("id")?;

        let personality_row = sqlx::query(
            r"
            INSERT INTO personalities
                (id, slug, display_name, system_prompt_id, model, vision_model, persona_id)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6)
            ON CONFLICT (slug) DO UPDATE
            SET display_name = EXCLUDED.display_name,
                system_prompt_id = EXCLUDED.system_prompt_id,
                model = EXCLUDED.model,
                vision_model = EXCLUDED.vision_model
            RETURNING id
            ",
        )
        .bind(&import.slug)
        .bind(&import.display_name)
        .bind(system_prompt_id)
        .bind(&import.model)
        .bind(&import.vision_model)
        .bind(persona_id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to upsert personality")?;
        let personality_id: Uuid = personality_row.try_get("id")?;

        let config_row = sqlx::query(
            r"
            INSERT INTO llm_configs
                (id, model, vision_model, temperature, frequency_penalty, max_tokens)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, $5)
            RETURNING id
            ",
        )
        .bind(&import.default_config.model)
        .bind(&import.default_config.vision_model)
        .bind(import.default_config.temperature)
        .bind(import.default_config.frequency_penalty)
        .bind(import.default_config.max_tokens)
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert imported llm config")?;
        let llm_config_id: Uuid = config_row.try_get("id")?;

        sqlx::query(
            r"
            INSERT INTO personality_default_configs (personality_id, llm_config_id)
            VALUES ($1, $2)
            ON CONFLICT (personality_id) DO UPDATE SET llm_config_id = EXCLUDED.llm_config_id
            ",
        )
        .bind(personality_id)
        .bind(llm_config_id)
        .execute(&mut *tx)
        .await
        .context("failed to upsert personality default config")?;

        sqlx::query(
            r"
            INSERT INTO personality_owners (personality_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (personality_id) DO UPDATE SET user_id = EXCLUDED.user_id
            ",
        )
        .bind(personality_id)
        .bind(&import.owner_user_id)
        .execute(&mut *tx)
        .await
        .context("failed to upsert personality owner")?;

        tx.commit()
            .await
            .context("failed to commit personality import")?;

        Ok(personality_id)
    }

    async fn update_personality_avatar(
        &self,
        personality_id: Uuid,
        avatar_url: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE personalities SET avatar_url = $2 WHERE id = $1")
            .bind(personality_id)
            .bind(avatar_url)
            .execute(&self.pool)
            .await
            .context("failed to update personality avatar")?;

        Ok(())
    }
}

#[async_trait]
impl CredentialDao for PgWorkerDao {
    async fn api_key_for_user(&self, user_id: &str, provider: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT api_key FROM user_api_keys WHERE user_id = $1 AND provider = $2",
        )
        .bind(user_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch user api key")?;

        Ok(row.and_then(|r| r.try_get("api_key").ok()))
    }

    async fn exchange_credential(&self, user_id: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT sealed_credential FROM user_exchange_credentials WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch exchange credential")?;

        Ok(row.and_then(|r| r.try_get("sealed_credential").ok()))
    }

    async fn store_exchange_credential(&self, user_id: &str, sealed: &str) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO user_exchange_credentials (user_id, sealed_credential, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id) DO UPDATE
            SET sealed_credential = EXCLUDED.sealed_credential,
                updated_at = NOW()
            ",
        )
        .bind(user_id)
        .bind(sealed)
        .execute(&self.pool)
        .await
        .context("failed to store exchange credential")?;

        Ok(())
    }
}

#[async_trait]
impl PendingMemoryDao for PgWorkerDao {
    async fn insert_pending_memory(&self, text: &str, metadata: &Value) -> Result<Uuid> {
        let row = sqlx::query(
            r"
            INSERT INTO pending_memories (id, text, metadata, attempts)
            VALUES (gen_random_uuid(), $1, $2, 0)
            RETURNING id
            ",
        )
        .bind(text)
        .bind(metadata)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert pending memory")?;

        row.try_get("id").context("failed to get pending memory id")
    }

    async fn fetch_retryable_memories(
        &self,
        cap: i32,
        limit: i64,
    ) -> Result<Vec<PendingMemoryRow>> {
        let rows = sqlx::query(
            r"
            SELECT id, text, metadata, attempts, last_attempt_at, error, created_at
            FROM pending_memories
            WHERE attempts < $1
            ORDER BY created_at ASC
            LIMIT $2
            ",
        )
        .bind(cap)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch retryable pending memories")?;

        rows.iter().map(Self::row_to_pending_memory).collect()
    }

    async fn delete_pending_memory(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM pending_memories WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to delete pending memory")?;

        Ok(())
    }

    async fn record_memory_failure(&self, id: Uuid, attempts: i32, error: &str) -> Result<()> {
        sqlx::query(
            r"
            UPDATE pending_memories
            SET attempts = $2,
                last_attempt_at = NOW(),
                error = $3
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(attempts)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("failed to record pending memory failure")?;

        Ok(())
    }

    async fn shelve_pending_memory(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r"
            UPDATE pending_memories
            SET attempts = $2,
                last_attempt_at = NOW(),
                error = $3
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(crate::store::models::PENDING_MEMORY_SHELVED)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("failed to shelve pending memory")?;

        Ok(())
    }

    async fn pending_memory_stats(&self) -> Result<PendingMemoryStats> {
        let rows = sqlx::query(
            r"
            SELECT attempts, COUNT(*) AS count
            FROM pending_memories
            GROUP BY attempts
            ORDER BY attempts ASC
            ",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch pending memory stats")?;

        let mut stats = PendingMemoryStats::default();
        for row in rows {
            let attempts: i32 = row.try_get("attempts").unwrap_or(0);
            let count: i64 = row.try_get("count").unwrap_or(0);
            stats.total += count;
            stats.by_attempts.push(AttemptBucket { attempts, count });
        }
        Ok(stats)
    }
}

#[async_trait]
impl DiagnosticsDao for PgWorkerDao {
    async fn insert_diagnostic(&self, record: &DiagnosticRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO diagnostic_logs
                (request_id, trigger_message_id, personality_id, user_id, guild_id,
                 channel_id, model, provider, duration_ms, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ",
        )
        .bind(&record.request_id)
        .bind(&record.trigger_message_id)
        .bind(record.personality_id)
        .bind(&record.user_id)
        .bind(&record.guild_id)
        .bind(&record.channel_id)
        .bind(&record.model)
        .bind(&record.provider)
        .bind(record.duration_ms)
        .bind(&record.data)
        .execute(&self.pool)
        .await
        .context("failed to insert diagnostic log")?;

        Ok(())
    }

    async fn delete_diagnostics_older_than(&self, retention: Duration) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM diagnostic_logs WHERE created_at < NOW() - make_interval(secs => $1)",
        )
        .bind(retention.as_secs_f64())
        .execute(&self.pool)
        .await
        .context("failed to delete old diagnostic logs")?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ExchangeJobDao for PgWorkerDao {
    async fn mark_exchange_in_progress(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE exchange_jobs SET status = 'in_progress', updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to mark exchange job in progress")?;

        Ok(())
    }

    async fn complete_export(
        &self,
        id: Uuid,
        file_name: &str,
        content: &str,
        metadata: &Value,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE exchange_jobs
            SET status = 'completed',
                file_name = $2,
                file_content = $3,
                file_size_bytes = $4,
                metadata = $5,
                updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(file_name)
        .bind(content)
        .bind(content.len() as i64)
        .bind(metadata)
        .execute(&self.pool)
        .await
        .context("failed to complete export job")?;

        Ok(())
    }

    async fn complete_import(&self, id: Uuid, counters: &ImportCounters) -> Result<()> {
        sqlx::query(
            r"
            UPDATE exchange_jobs
            SET status = 'completed',
                imported = $2,
                skipped = $3,
                failed = $4,
                updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(counters.imported as i64)
        .bind(counters.skipped as i64)
        .bind(counters.failed as i64)
        .execute(&self.pool)
        .await
        .context("failed to complete import job")?;

        Ok(())
    }

    async fn fail_exchange(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r"
            UPDATE exchange_jobs
            SET status = 'failed',
                error = $2,
                updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("failed to mark exchange job failed")?;

        Ok(())
    }
}
