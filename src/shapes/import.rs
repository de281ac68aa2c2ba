//! Shapes import handler. Pulls a shape's profile, memories, stories and
//! personalization from the external service and lands them locally:
//! personality rows under one transactional upsert (full import) and
//! memories diffed by text content through the vector memory service.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clients::VectorMemoryStore;
use crate::memory::DeferredMemoryRecord;
use crate::queue::{HandlerOutcome, Job, JobHandler};
use crate::request::{ImportType, ShapesImportPayload};
use crate::store::dao::{CredentialDao, ExchangeJobDao, PersonalityDao};
use crate::store::models::{ImportCounters, ImportedPersonality, LlmConfigRecord};
use crate::util::secret::SecretBox;

use super::client::{ShapesClient, ShapesProfile};
use super::error::ExchangeError;

/// Connection settings shared by the import and export handlers.
#[derive(Debug, Clone)]
pub(crate) struct ShapesSettings {
    pub(crate) base_url: String,
    pub(crate) connect_timeout: Duration,
    pub(crate) total_timeout: Duration,
    pub(crate) page_size: usize,
    pub(crate) avatar_max_bytes: u64,
    pub(crate) avatar_timeout: Duration,
}

pub(crate) struct ShapesImportHandler {
    personality_dao: Arc<dyn PersonalityDao>,
    credential_dao: Arc<dyn CredentialDao>,
    exchange_dao: Arc<dyn ExchangeJobDao>,
    memory_store: Arc<dyn VectorMemoryStore>,
    secret: SecretBox,
    settings: ShapesSettings,
}

impl ShapesImportHandler {
    pub(crate) fn new(
        personality_dao: Arc<dyn PersonalityDao>,
        credential_dao: Arc<dyn CredentialDao>,
        exchange_dao: Arc<dyn ExchangeJobDao>,
        memory_store: Arc<dyn VectorMemoryStore>,
        secret: SecretBox,
        settings: ShapesSettings,
    ) -> Self {
        Self {
            personality_dao,
            credential_dao,
            exchange_dao,
            memory_store,
            secret,
            settings,
        }
    }

    async fn open_session(&self, user_id: &str) -> Result<ShapesClient, ExchangeError> {
        let sealed = self
            .credential_dao
            .exchange_credential(user_id)
            .await
            .map_err(|dao_error| ExchangeError::Mapping(dao_error.to_string()))?
            .ok_or(ExchangeError::Auth)?;

        let cookie = self
            .secret
            .open(&sealed)
            .map_err(|_| ExchangeError::Auth)?;

        ShapesClient::new(
            &self.settings.base_url,
            cookie,
            self.settings.connect_timeout,
            self.settings.total_timeout,
            self.settings.page_size,
        )
    }

    /// Persist the (possibly rotated) session cookie. Rotation must survive
    /// both success and error paths.
    async fn persist_credential(&self, user_id: &str, client: &ShapesClient) {
        let sealed = match self.secret.seal(&client.current_credential()) {
            Ok(sealed) => sealed,
            Err(seal_error) => {
                warn!(error = %seal_error, "failed to seal rotated shapes credential");
                return;
            }
        };
        if let Err(store_error) = self
            .credential_dao
            .store_exchange_credential(user_id, &sealed)
            .await
        {
            warn!(error = %store_error, "failed to persist rotated shapes credential");
        }
    }

    async fn resolve_target_personality(
        &self,
        payload: &ShapesImportPayload,
        profile: &ShapesProfile,
    ) -> Result<Uuid, ExchangeError> {
        let existing = self
            .personality_dao
            .personality_by_slug(&payload.slug)
            .await
            .map_err(|dao_error| ExchangeError::Mapping(dao_error.to_string()))?;

        match payload.import_type {
            ImportType::MemoryOnly => existing
                .map(|p| p.id)
                .ok_or_else(|| ExchangeError::Mapping(format!(
                    "memory_only import for unknown personality: {}",
                    payload.slug
                ))),
            ImportType::Full => {
                if let Some(existing) = &existing {
                    let owner = self
                        .personality_dao
                        .personality_owner(existing.id)
                        .await
                        .map_err(|dao_error| ExchangeError::Mapping(dao_error.to_string()))?;
                    if let Some(owner) = owner {
                        if owner != payload.user_id && !payload.requester_is_admin {
                            return Err(ExchangeError::Mapping(format!(
                                "personality {} is owned by another user",
                                payload.slug
                            )));
                        }
                    }
                }

                let import = ImportedPersonality {
                    slug: profile.slug.clone(),
                    display_name: profile.display_name.clone(),
                    system_prompt: profile.system_prompt.clone(),
                    model: profile.model.clone(),
                    vision_model: profile.vision_model.clone(),
                    default_config: LlmConfigRecord {
                        model: Some(profile.model.clone()),
                        vision_model: profile.vision_model.clone(),
                        temperature: profile.temperature,
                        frequency_penalty: profile.frequency_penalty,
                        max_tokens: profile.max_tokens,
                    },
                    owner_user_id: payload.user_id.clone(),
                };

                self.personality_dao
                    .upsert_imported_personality(&import)
                    .await
                    .map_err(|dao_error| ExchangeError::Mapping(dao_error.to_string()))
            }
        }
    }

    async fn import_avatar(
        &self,
        client: &ShapesClient,
        personality_id: Uuid,
        profile: &ShapesProfile,
    ) {
        let Some(avatar_url) = &profile.avatar_url else {
            return;
        };

        match client
            .download_avatar(
                avatar_url,
                self.settings.avatar_max_bytes,
                self.settings.avatar_timeout,
            )
            .await
        {
            Ok(bytes) => {
                info!(size = bytes.len(), "avatar downloaded");
                if let Err(update_error) = self
                    .personality_dao
                    .update_personality_avatar(personality_id, avatar_url)
                    .await
                {
                    warn!(error = %update_error, "failed to record avatar, continuing");
                }
            }
            Err(download_error) => {
                warn!(error = %download_error, "avatar download failed, continuing");
            }
        }
    }

    /// Diff fetched memories against stored texts and ingest only the new
    /// ones. A single storage failure only advances its counter.
    async fn ingest_memories(
        &self,
        payload: &ShapesImportPayload,
        personality_id: Uuid,
        memories: Vec<String>,
    ) -> ImportCounters {
        let existing: HashSet<String> = match self
            .memory_store
            .list_memory_texts(personality_id)
            .await
        {
            Ok(texts) => texts.into_iter().collect(),
            Err(list_error) => {
                warn!(error = %list_error, "failed to list stored memories, importing all");
                HashSet::new()
            }
        };

        let mut counters = ImportCounters::default();
        for text in memories {
            if existing.contains(&text) {
                counters.skipped += 1;
                continue;
            }

            let record = DeferredMemoryRecord {
                text: text.clone(),
                metadata: json!({
                    "personalityId": personality_id.to_string(),
                    "userId": payload.user_id,
                    "source": "shapes_import",
                }),
                embedding: None,
            };

            match self.memory_store.store_memory(&record).await {
                Ok(()) => counters.imported += 1,
                Err(store_error) => {
                    warn!(error = %store_error, "memory import failed, counting and continuing");
                    counters.failed += 1;
                }
            }
        }

        counters
    }

    async fn run_import(
        &self,
        payload: &ShapesImportPayload,
        client: &ShapesClient,
    ) -> Result<ImportCounters, ExchangeError> {
        let profile = client.fetch_profile(&payload.slug).await?;
        let memories = client.fetch_memories(&payload.slug).await?;
        // Stories and personalization ride along with a full import; they
        // are fetched for completeness even though only the profile and
        // memories land in local rows today.
        let _stories = client.fetch_stories(&payload.slug).await?;
        let _personalization = client.fetch_user_personalization(&payload.slug).await?;

        let personality_id = self.resolve_target_personality(payload, &profile).await?;

        if payload.import_type == ImportType::Full {
            self.import_avatar(client, personality_id, &profile).await;
        }

        Ok(self.ingest_memories(payload, personality_id, memories).await)
    }
}

#[async_trait]
impl JobHandler for ShapesImportHandler {
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome> {
        let payload: ShapesImportPayload = serde_json::from_value(job.payload.clone())
            .context("failed to parse shapes import payload")?;

        self.exchange_dao
            .mark_exchange_in_progress(payload.exchange_job_id)
            .await?;

        let client = match self.open_session(&payload.user_id).await {
            Ok(client) => client,
            Err(session_error) => {
                return self
                    .conclude_error(job, &payload, None, session_error)
                    .await;
            }
        };

        let import_result = self.run_import(&payload, &client).await;

        // Rotation must not be lost, success or not.
        self.persist_credential(&payload.user_id, &client).await;

        match import_result {
            Ok(counters) => {
                self.exchange_dao
                    .complete_import(payload.exchange_job_id, &counters)
                    .await?;

                info!(
                    exchange_job_id = %payload.exchange_job_id,
                    imported = counters.imported,
                    skipped = counters.skipped,
                    failed = counters.failed,
                    "shapes import completed"
                );

                Ok(HandlerOutcome {
                    request_id: payload.exchange_job_id.to_string(),
                    result: json!({
                        "requestId": payload.exchange_job_id.to_string(),
                        "success": true,
                        "counters": counters,
                    }),
                    cache_write: None,
                    delivery: None,
                })
            }
            Err(exchange_error) => {
                self.conclude_error(job, &payload, Some(&client), exchange_error)
                    .await
            }
        }
    }
}

impl ShapesImportHandler {
    /// Retryable errors re-throw while attempts remain (the row stays
    /// `in_progress`); anything else, or the final attempt, fails the row.
    async fn conclude_error(
        &self,
        job: &Job,
        payload: &ShapesImportPayload,
        client: Option<&ShapesClient>,
        exchange_error: ExchangeError,
    ) -> Result<HandlerOutcome> {
        if let Some(client) = client {
            self.persist_credential(&payload.user_id, client).await;
        }

        if exchange_error.is_retryable() && !job.is_final_attempt() {
            return Err(exchange_error.into());
        }

        let message = exchange_error.to_string();
        self.exchange_dao
            .fail_exchange(payload.exchange_job_id, &message)
            .await?;

        Ok(HandlerOutcome {
            request_id: payload.exchange_job_id.to_string(),
            result: json!({
                "requestId": payload.exchange_job_id.to_string(),
                "success": false,
                "error": message,
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
    use crate::queue::{JobStatus, JobType};
    use crate::store::dao::mock::MockDao;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct RecordingMemoryStore {
        existing: Vec<String>,
        stored: Mutex<Vec<String>>,
        fail_texts: Vec<String>,
    }

    #[async_trait]
    impl VectorMemoryStore for RecordingMemoryStore {
        async fn store_memory(&self, record: &DeferredMemoryRecord) -> Result<()> {
            if self.fail_texts.contains(&record.text) {
                anyhow::bail!("vector store rejected memory");
            }
            self.stored.lock().unwrap().push(record.text.clone());
            Ok(())
        }

        async fn search_memories(&self, _search: &MemorySearch) -> Result<Vec<MemoryHit>> {
            Ok(vec![])
        }

        async fn list_memory_texts(&self, _personality_id: Uuid) -> Result<Vec<String>> {
            Ok(self.existing.clone())
        }
    }

    fn secret() -> SecretBox {
        SecretBox::from_key_base64(&BASE64.encode([9u8; 32])).expect("secret")
    }

    fn settings(base_url: &str) -> ShapesSettings {
        ShapesSettings {
            base_url: base_url.to_string(),
            connect_timeout: Duration::from_secs(1),
            total_timeout: Duration::from_secs(5),
            page_size: 50,
            avatar_max_bytes: 1024 * 1024,
            avatar_timeout: Duration::from_secs(2),
        }
    }

    fn handler(
        server_url: &str,
        dao: Arc<MockDao>,
        memory_store: Arc<RecordingMemoryStore>,
    ) -> ShapesImportHandler {
        let secret = secret();
        let sealed = secret.seal("session-cookie").expect("seal");
        dao.exchange_credentials
            .lock()
            .unwrap()
            .insert("u1".to_string(), sealed);

        ShapesImportHandler::new(
            dao.clone(),
            dao.clone(),
            dao,
            memory_store,
            secret,
            settings(server_url),
        )
    }

    fn import_job(payload: &ShapesImportPayload, attempts: i32, max_attempts: i32) -> Job {
        Job {
            id: format!("shapes-import:{}", payload.exchange_job_id),
            job_type: JobType::ShapesImport,
            status: JobStatus::Active,
            payload: serde_json::to_value(payload).expect("payload"),
            attempts,
            max_attempts,
            parent_job_id: None,
            error_message: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn import_payload(import_type: ImportType) -> ShapesImportPayload {
        ShapesImportPayload {
            exchange_job_id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            slug: "luna".to_string(),
            import_type,
            requester_is_admin: false,
        }
    }

    async fn mount_happy_shape(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/api/shapes/luna/profile"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "slug": "luna",
                "displayName": "Luna",
                "systemPrompt": "You are Luna.",
                "model": "anthropic/claude-sonnet-4"
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/shapes/luna/memories"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": ["knows the stars", "already stored", "poison"],
                "hasMore": false
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/shapes/luna/stories"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/shapes/luna/personalization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn full_import_upserts_and_diffs_memories() {
        let server = MockServer::start().await;
        mount_happy_shape(&server).await;

        let dao = Arc::new(MockDao::new());
        let memory_store = Arc::new(RecordingMemoryStore {
            existing: vec!["already stored".to_string()],
            stored: Mutex::new(vec![]),
            fail_texts: vec!["poison".to_string()],
        });
        let handler = handler(&server.uri(), dao.clone(), memory_store.clone());

        let payload = import_payload(ImportType::Full);
        let outcome = handler
            .handle(&import_job(&payload, 1, 3))
            .await
            .expect("handle");

        assert_eq!(outcome.result["success"], true);
        assert_eq!(
            dao.exchange_statuses.lock().unwrap()[&payload.exchange_job_id],
            "completed"
        );
        let counters = dao.exchange_counters.lock().unwrap()[&payload.exchange_job_id];
        assert_eq!(counters.imported, 1);
        assert_eq!(counters.skipped, 1);
        assert_eq!(counters.failed, 1);
        assert_eq!(dao.imports.lock().unwrap().len(), 1);
        assert_eq!(
            memory_store.stored.lock().unwrap().as_slice(),
            &["knows the stars".to_string()]
        );
    }

    #[tokio::test]
    async fn rate_limit_rethrows_and_leaves_row_in_progress() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/shapes/luna/profile"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let dao = Arc::new(MockDao::new());
        let memory_store = Arc::new(RecordingMemoryStore {
            existing: vec![],
            stored: Mutex::new(vec![]),
            fail_texts: vec![],
        });
        let handler = handler(&server.uri(), dao.clone(), memory_store);

        let payload = import_payload(ImportType::Full);
        let error = handler
            .handle(&import_job(&payload, 1, 3))
            .await
            .expect_err("rethrow");
        assert!(error.to_string().contains("rate limit"));
        assert_eq!(
            dao.exchange_statuses.lock().unwrap()[&payload.exchange_job_id],
            "in_progress"
        );
    }

    #[tokio::test]
    async fn rate_limit_on_final_attempt_fails_the_row() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/shapes/luna/profile"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let dao = Arc::new(MockDao::new());
        let memory_store = Arc::new(RecordingMemoryStore {
            existing: vec![],
            stored: Mutex::new(vec![]),
            fail_texts: vec![],
        });
        let handler = handler(&server.uri(), dao.clone(), memory_store);

        let payload = import_payload(ImportType::Full);
        let outcome = handler
            .handle(&import_job(&payload, 3, 3))
            .await
            .expect("soft failure");

        assert_eq!(outcome.result["success"], false);
        assert_eq!(
            dao.exchange_statuses.lock().unwrap()[&payload.exchange_job_id],
            "failed"
        );
    }

    #[tokio::test]
    async fn memory_only_import_with_unknown_slug_fails_without_upserts() {
        let server = MockServer::start().await;
        mount_happy_shape(&server).await;

        let dao = Arc::new(MockDao::new());
        let memory_store = Arc::new(RecordingMemoryStore {
            existing: vec![],
            stored: Mutex::new(vec![]),
            fail_texts: vec![],
        });
        let handler = handler(&server.uri(), dao.clone(), memory_store);

        let payload = import_payload(ImportType::MemoryOnly);
        let outcome = handler
            .handle(&import_job(&payload, 1, 3))
            .await
            .expect("soft failure");

        assert_eq!(outcome.result["success"], false);
        assert_eq!(
            dao.exchange_statuses.lock().unwrap()[&payload.exchange_job_id],
            "failed"
        );
        assert!(dao.imports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn foreign_owned_personality_blocks_full_import() {
        let server = MockServer::start().await;
        mount_happy_shape(&server).await;

        let dao = Arc::new(MockDao::new());
        // Existing personality with a different owner.
        let existing_id = {
            let import = ImportedPersonality {
                slug: "luna".to_string(),
                display_name: "Luna".to_string(),
                system_prompt: "old".to_string(),
                model: "old/model".to_string(),
                vision_model: None,
                default_config: LlmConfigRecord::default(),
                owner_user_id: "someone-else".to_string(),
            };
            dao.upsert_imported_personality(&import).await.expect("seed")
        };
        dao.imports.lock().unwrap().clear();
        assert!(dao.owners.lock().unwrap().contains_key(&existing_id));

        let memory_store = Arc::new(RecordingMemoryStore {
            existing: vec![],
            stored: Mutex::new(vec![]),
            fail_texts: vec![],
        });
        let handler = handler(&server.uri(), dao.clone(), memory_store);

        let payload = import_payload(ImportType::Full);
        let outcome = handler
            .handle(&import_job(&payload, 1, 3))
            .await
            .expect("soft failure");

        assert_eq!(outcome.result["success"], false);
        assert!(dao.imports.lock().unwrap().is_empty());
        assert_eq!(
            dao.exchange_statuses.lock().unwrap()[&payload.exchange_job_id],
            "failed"
        );
    }
}
