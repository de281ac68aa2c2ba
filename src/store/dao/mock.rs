//! In-memory DAO used by handler and pipeline tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::store::models::{
    AttemptBucket, DiagnosticRecord, ImportCounters, ImportedPersonality, LlmConfigRecord,
    PENDING_MEMORY_SHELVED, PendingMemoryRow, PendingMemoryStats, PersonalityRecord,
};

use super::{CredentialDao, DiagnosticsDao, ExchangeJobDao, PendingMemoryDao, PersonalityDao};

#[derive(Default)]
pub(crate) struct MockDao {
    pub(crate) personalities: Mutex<HashMap<String, PersonalityRecord>>,
    pub(crate) user_personality_configs: Mutex<HashMap<(String, Uuid), LlmConfigRecord>>,
    pub(crate) user_default_configs: Mutex<HashMap<String, LlmConfigRecord>>,
    pub(crate) personality_default_configs: Mutex<HashMap<Uuid, LlmConfigRecord>>,
    pub(crate) guest_model: Mutex<Option<String>>,
    pub(crate) owners: Mutex<HashMap<Uuid, String>>,
    pub(crate) api_keys: Mutex<HashMap<(String, String), String>>,
    pub(crate) exchange_credentials: Mutex<HashMap<String, String>>,
    pub(crate) pending: Mutex<Vec<PendingMemoryRow>>,
    pub(crate) diagnostics: Mutex<Vec<DiagnosticRecord>>,
    pub(crate) exchange_statuses: Mutex<HashMap<Uuid, String>>,
    pub(crate) exchange_errors: Mutex<HashMap<Uuid, String>>,
    pub(crate) exchange_exports: Mutex<HashMap<Uuid, (String, String)>>,
    pub(crate) exchange_counters: Mutex<HashMap<Uuid, ImportCounters>>,
    pub(crate) imports: Mutex<Vec<ImportedPersonality>>,
    pub(crate) avatars: Mutex<Vec<(Uuid, String)>>,
}

impl MockDao {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_personality(&self, record: PersonalityRecord) {
        self.personalities
            .lock()
            .unwrap()
            .insert(record.slug.clone(), record);
    }

    pub(crate) fn add_pending(&self, row: PendingMemoryRow) {
        self.pending.lock().unwrap().push(row);
    }

    pub(crate) fn pending_rows(&self) -> Vec<PendingMemoryRow> {
        self.pending.lock().unwrap().clone()
    }
}

#[async_trait]
impl PersonalityDao for MockDao {
    async fn personality_by_slug(&self, slug: &str) -> Result<Option<PersonalityRecord>> {
        Ok(self.personalities.lock().unwrap().get(slug).cloned())
    }

    async fn user_personality_config(
        &self,
        user_id: &str,
        personality_id: Uuid,
    ) -> Result<Option<LlmConfigRecord>> {
        Ok(self
            .user_personality_configs
            .lock()
            .unwrap()
            .get(&(user_id.to_string(), personality_id))
            .cloned())
    }

    async fn user_default_config(&self, user_id: &str) -> Result<Option<LlmConfigRecord>> {
        Ok(self
            .user_default_configs
            .lock()
            .unwrap()
            .get(user_id)
            .cloned())
    }

    async fn personality_default_config(
        &self,
        personality_id: Uuid,
    ) -> Result<Option<LlmConfigRecord>> {
        Ok(self
            .personality_default_configs
            .lock()
            .unwrap()
            .get(&personality_id)
            .cloned())
    }

    async fn guest_default_model(&self) -> Result<Option<String>> {
        Ok(self.guest_model.lock().unwrap().clone())
    }

    async fn personality_owner(&self, personality_id: Uuid) -> Result<Option<String>> {
        Ok(self.owners.lock().unwrap().get(&personality_id).cloned())
    }

    async fn upsert_imported_personality(&self, import: &ImportedPersonality) -> Result<Uuid> {
        let existing_id = self
            .personalities
            .lock()
            .unwrap()
            .get(&import.slug)
            .map(|p| p.id);
        let id = existing_id.unwrap_or_else(Uuid::new_v4);
        self.imports.lock().unwrap().push(import.clone());
        self.personalities.lock().unwrap().insert(
            import.slug.clone(),
            PersonalityRecord {
                id,
                slug: import.slug.clone(),
                display_name: import.display_name.clone(),
                system_prompt: import.system_prompt.clone(),
                model: import.model.clone(),
                vision_model: import.vision_model.clone(),
                avatar_url: None,
                persona_id: Uuid::new_v4(),
                share_ltm_across_personalities: false,
                include_prompt_in_vision: false,
            },
        );
        self.owners
            .lock()
            .unwrap()
            .insert(id, import.owner_user_id.clone());
        Ok(id)
    }

    async fn update_personality_avatar(
        &self,
        personality_id: Uuid,
        avatar_url: &str,
    ) -> Result<()> {
        self.avatars
            .lock()
            .unwrap()
            .push((personality_id, avatar_url.to_string()));
        Ok(())
    }
}

#[async_trait]
impl CredentialDao for MockDao {
    async fn api_key_for_user(&self, user_id: &str, provider: &str) -> Result<Option<String>> {
        Ok(self
            .api_keys
            .lock()
            .unwrap()
            .get(&(user_id.to_string(), provider.to_string()))
            .cloned())
    }

    async fn exchange_credential(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self
            .exchange_credentials
            .lock()
            .unwrap()
            .get(user_id)
            .cloned())
    }

    async fn store_exchange_credential(&self, user_id: &str, sealed: &str) -> Result<()> {
        self.exchange_credentials
            .lock()
            .unwrap()
            .insert(user_id.to_string(), sealed.to_string());
        Ok(())
    }
}

#[async_trait]
impl PendingMemoryDao for MockDao {
    async fn insert_pending_memory(&self, text: &str, metadata: &Value) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.pending.lock().unwrap().push(PendingMemoryRow {
            id,
            text: text.to_string(),
            metadata: metadata.clone(),
            attempts: 0,
            last_attempt_at: None,
            error: None,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn fetch_retryable_memories(
        &self,
        cap: i32,
        limit: i64,
    ) -> Result<Vec<PendingMemoryRow>> {
        let mut rows: Vec<PendingMemoryRow> = self
            .pending
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.attempts < cap)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(rows)
    }

    async fn delete_pending_memory(&self, id: Uuid) -> Result<()> {
        self.pending.lock().unwrap().retain(|r| r.id != id);
        Ok(())
    }

    async fn record_memory_failure(&self, id: Uuid, attempts: i32, error: &str) -> Result<()> {
        let mut pending = self.pending.lock().unwrap();
        let row = pending
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| anyhow!("pending memory {id} not found"))?;
        row.attempts = attempts;
        row.last_attempt_at = Some(Utc::now());
        row.error = Some(error.to_string());
        Ok(())
    }

    async fn shelve_pending_memory(&self, id: Uuid, error: &str) -> Result<()> {
        let mut pending = self.pending.lock().unwrap();
        let row = pending
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| anyhow!("pending memory {id} not found"))?;
        row.attempts = PENDING_MEMORY_SHELVED;
        row.last_attempt_at = Some(Utc::now());
        row.error = Some(error.to_string());
        Ok(())
    }

    async fn pending_memory_stats(&self) -> Result<PendingMemoryStats> {
        let pending = self.pending.lock().unwrap();
        let mut histogram: HashMap<i32, i64> = HashMap::new();
        for row in pending.iter() {
            *histogram.entry(row.attempts).or_insert(0) += 1;
        }
        let mut by_attempts: Vec<AttemptBucket> = histogram
            .into_iter()
            .map(|(attempts, count)| AttemptBucket { attempts, count })
            .collect();
        by_attempts.sort_by_key(|b| b.attempts);
        Ok(PendingMemoryStats {
            total: pending.len() as i64,
            by_attempts,
        })
    }
}

#[async_trait]
impl DiagnosticsDao for MockDao {
    async fn insert_diagnostic(&self, record: &DiagnosticRecord) -> Result<()> {
        self.diagnostics.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn delete_diagnostics_older_than(&self, _retention: Duration) -> Result<u64> {
        Ok(0)
    }
}

#[async_trait]
impl ExchangeJobDao for MockDao {
    async fn mark_exchange_in_progress(&self, id: Uuid) -> Result<()> {
        self.exchange_statuses
            .lock()
            .unwrap()
            .insert(id, "in_progress".to_string());
        Ok(())
    }

    async fn complete_export(
        &self,
        id: Uuid,
        file_name: &str,
        content: &str,
        _metadata: &Value,
    ) -> Result<()> {
        self.exchange_statuses
            .lock()
            .unwrap()
            .insert(id, "completed".to_string());
        self.exchange_exports
            .lock()
            .unwrap()
            .insert(id, (file_name.to_string(), content.to_string()));
        Ok(())
    }

    async fn complete_import(&self, id: Uuid, counters: &ImportCounters) -> Result<()> {
        self.exchange_statuses
            .lock()
            .unwrap()
            .insert(id, "completed".to_string());
        self.exchange_counters.lock().unwrap().insert(id, *counters);
        Ok(())
    }

    async fn fail_exchange(&self, id: Uuid, error: &str) -> Result<()> {
        self.exchange_statuses
            .lock()
            .unwrap()
            .insert(id, "failed".to_string());
        self.exchange_errors
            .lock()
            .unwrap()
            .insert(id, error.to_string());
        Ok(())
    }
}
