//! Data-access traits, one per area. Handlers and the pipeline receive the
//! trait objects they need so tests can substitute the in-memory mock.

#[cfg(test)]
pub(crate) mod mock;
pub(crate) mod pg;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::models::{
    DiagnosticRecord, ImportCounters, ImportedPersonality, LlmConfigRecord, PendingMemoryRow,
    PendingMemoryStats, PersonalityRecord,
};

pub(crate) use pg::PgWorkerDao;

#[async_trait]
pub(crate) trait PersonalityDao: Send + Sync {
    async fn personality_by_slug(&self, slug: &str) -> Result<Option<PersonalityRecord>>;

    /// User's override for one specific personality. Highest precedence.
    async fn user_personality_config(
        &self,
        user_id: &str,
        personality_id: Uuid,
    ) -> Result<Option<LlmConfigRecord>>;

    /// User's catch-all override. Middle precedence.
    async fn user_default_config(&self, user_id: &str) -> Result<Option<LlmConfigRecord>>;

    /// The personality's own stored defaults. Lowest precedence.
    async fn personality_default_config(
        &self,
        personality_id: Uuid,
    ) -> Result<Option<LlmConfigRecord>>;

    /// Guest-mode model configured in the database, when present.
    async fn guest_default_model(&self) -> Result<Option<String>>;

    /// User id owning the personality, when ownership is recorded.
    async fn personality_owner(&self, personality_id: Uuid) -> Result<Option<String>>;

    /// Upsert system prompt, personality, default config and ownership rows
    /// under a single transaction. Returns the personality id.
    async fn upsert_imported_personality(&self, import: &ImportedPersonality) -> Result<Uuid>;

    async fn update_personality_avatar(&self, personality_id: Uuid, avatar_url: &str)
    -> Result<()>;
}

#[async_trait]
pub(crate) trait CredentialDao: Send + Sync {
    async fn api_key_for_user(&self, user_id: &str, provider: &str) -> Result<Option<String>>;

    /// Sealed exchange session credential for the user.
    async fn exchange_credential(&self, user_id: &str) -> Result<Option<String>>;

    async fn store_exchange_credential(&self, user_id: &str, sealed: &str) -> Result<()>;
}

#[async_trait]
pub(crate) trait PendingMemoryDao: Send + Sync {
    async fn insert_pending_memory(&self, text: &str, metadata: &Value) -> Result<Uuid>;

    /// Oldest-first rows with `attempts < cap`, bounded by `limit`.
    async fn fetch_retryable_memories(&self, cap: i32, limit: i64)
    -> Result<Vec<PendingMemoryRow>>;

    async fn delete_pending_memory(&self, id: Uuid) -> Result<()>;

    /// Record a failed storage attempt: bump attempts, stamp the time, keep
    /// the error string.
    async fn record_memory_failure(&self, id: Uuid, attempts: i32, error: &str) -> Result<()>;

    /// Permanently shelve a row whose metadata failed validation.
    async fn shelve_pending_memory(&self, id: Uuid, error: &str) -> Result<()>;

    async fn pending_memory_stats(&self) -> Result<PendingMemoryStats>;
}

#[async_trait]
pub(crate) trait DiagnosticsDao: Send + Sync {
    async fn insert_diagnostic(&self, record: &DiagnosticRecord) -> Result<()>;

    async fn delete_diagnostics_older_than(&self, retention: Duration) -> Result<u64>;
}

#[async_trait]
pub(crate) trait ExchangeJobDao: Send + Sync {
    async fn mark_exchange_in_progress(&self, id: Uuid) -> Result<()>;

    async fn complete_export(
        &self,
        id: Uuid,
        file_name: &str,
        content: &str,
        metadata: &Value,
    ) -> Result<()>;

    async fn complete_import(&self, id: Uuid, counters: &ImportCounters) -> Result<()>;

    async fn fail_exchange(&self, id: Uuid, error: &str) -> Result<()>;
}
