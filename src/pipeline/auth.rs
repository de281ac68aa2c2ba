//! Auth resolution: find the key for this user and provider, decide guest
//! mode, and finalize model selection. Config resolution can only presume
//! guest mode from the payload; stored keys are consulted here, so the
//! guest-mode model substitution is settled in this stage's output.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::clients::provider_for_model;
use crate::request::GenerationJobPayload;
use crate::store::dao::CredentialDao;

use super::config_resolution::is_free_tier;
use super::context::{ResolvedAuth, ResolvedConfig};

pub(crate) struct AuthResolution {
    dao: Arc<dyn CredentialDao>,
}

impl AuthResolution {
    pub(crate) fn new(dao: Arc<dyn CredentialDao>) -> Self {
        Self { dao }
    }

    pub(crate) async fn resolve(
        &self,
        payload: &GenerationJobPayload,
        config: &ResolvedConfig,
    ) -> Result<ResolvedAuth> {
        let provider = provider_for_model(&config.configured_model).to_string();

        let api_key = match &payload.user_api_key {
            Some(key) => Some(key.clone()),
            None => self
                .dao
                .api_key_for_user(&payload.context.user_id, &provider)
                .await
                .context("stored api key lookup failed")?,
        };

        let is_guest_mode = api_key.is_none();

        let (model, vision_model) = if is_guest_mode {
            // Re-apply the guest swap in case config resolution deferred it.
            if is_free_tier(&config.configured_model) {
                (
                    config.configured_model.clone(),
                    config.configured_vision_model.clone(),
                )
            } else {
                (
                    config.free_model.clone(),
                    Some(config.free_vision_model.clone()),
                )
            }
        } else {
            (
                config.configured_model.clone(),
                config.configured_vision_model.clone(),
            )
        };

        debug!(
            provider = %provider,
            is_guest_mode,
            guest_swap_was_applied = config.guest_swap_applied,
            model = %model,
            "auth resolved"
        );

        Ok(ResolvedAuth {
            api_key,
            provider,
            is_guest_mode,
            model,
            vision_model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::generator::GenerationParams;
    use crate::pipeline::context::ConfigSource;
    use crate::request::{RequestContext, ResponseDestination};
    use crate::store::dao::mock::MockDao;
    use crate::store::models::PersonalityRecord;
    use uuid::Uuid;

    fn payload(user_api_key: Option<&str>) -> GenerationJobPayload {
        GenerationJobPayload {
            request_id: "r1".to_string(),
            personality: "test-bot".to_string(),
            message: "Hello".to_string(),
            context: RequestContext {
                user_id: "u1".to_string(),
                ..RequestContext::default()
            },
            response_destination: ResponseDestination {
                kind: "discord".to_string(),
                channel_id: "c1".to_string(),
            },
            user_api_key: user_api_key.map(ToString::to_string),
            dependencies: vec![],
        }
    }

    fn config(model: &str, swap_applied: bool) -> ResolvedConfig {
        ResolvedConfig {
            personality: PersonalityRecord {
                id: Uuid::new_v4(),
                slug: "test-bot".to_string(),
                display_name: "Test Bot".to_string(),
                system_prompt: "prompt".to_string(),
                model: model.to_string(),
                vision_model: None,
                avatar_url: None,
                persona_id: Uuid::new_v4(),
                share_ltm_across_personalities: false,
                include_prompt_in_vision: false,
            },
            params: GenerationParams::default(),
            config_source: ConfigSource::Personality,
            configured_model: model.to_string(),
            configured_vision_model: None,
            free_model: "meta-llama/llama-3.3-70b-instruct:free".to_string(),
            free_vision_model: "google/gemini-2.5-flash".to_string(),
            guest_swap_applied: swap_applied,
        }
    }

    #[tokio::test]
    async fn payload_key_disables_guest_mode() {
        let auth = AuthResolution::new(Arc::new(MockDao::new()));

        let resolved = auth
            .resolve(
                &payload(Some("sk-byok")),
                &config("anthropic/claude-sonnet-4", false),
            )
            .await
            .expect("resolve");

        assert!(!resolved.is_guest_mode);
        assert_eq!(resolved.api_key.as_deref(), Some("sk-byok"));
        assert_eq!(resolved.provider, "anthropic");
        assert_eq!(resolved.model, "anthropic/claude-sonnet-4");
    }

    #[tokio::test]
    async fn stored_key_disables_guest_mode_and_restores_model() {
        let dao = Arc::new(MockDao::new());
        dao.api_keys.lock().unwrap().insert(
            ("u1".to_string(), "anthropic".to_string()),
            "sk-stored".to_string(),
        );
        let auth = AuthResolution::new(dao);

        // Config presumed guest (payload had no key) and swapped already.
        let resolved = auth
            .resolve(&payload(None), &config("anthropic/claude-sonnet-4", true))
            .await
            .expect("resolve");

        assert!(!resolved.is_guest_mode);
        assert_eq!(resolved.api_key.as_deref(), Some("sk-stored"));
        assert_eq!(resolved.model, "anthropic/claude-sonnet-4");
    }

    #[tokio::test]
    async fn missing_key_means_guest_mode_with_free_model() {
        let auth = AuthResolution::new(Arc::new(MockDao::new()));

        let resolved = auth
            .resolve(&payload(None), &config("anthropic/claude-sonnet-4", true))
            .await
            .expect("resolve");

        assert!(resolved.is_guest_mode);
        assert!(resolved.api_key.is_none());
        assert_eq!(resolved.model, "meta-llama/llama-3.3-70b-instruct:free");
        assert_eq!(
            resolved.vision_model.as_deref(),
            Some("google/gemini-2.5-flash")
        );
    }

    #[tokio::test]
    async fn guest_with_free_tier_model_keeps_it() {
        let auth = AuthResolution::new(Arc::new(MockDao::new()));

        let resolved = auth
            .resolve(&payload(None), &config("qwen/qwen3-8b:free", false))
            .await
            .expect("resolve");

        assert!(resolved.is_guest_mode);
        assert_eq!(resolved.model, "qwen/qwen3-8b:free");
    }
}
