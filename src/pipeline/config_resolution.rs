//! Configuration resolution: overlay the user's config hierarchy onto the
//! personality record and pre-compute the guest-mode substitution.
//!
//! Hierarchy, highest precedence first:
//!   user override for this personality > user default > personality default.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::clients::generator::GenerationParams;
use crate::request::GenerationJobPayload;
use crate::store::dao::PersonalityDao;
use crate::store::models::LlmConfigRecord;

use super::context::{ConfigSource, ResolvedConfig};

/// Free-tier models are tagged with this suffix by the model catalog.
pub(crate) fn is_free_tier(model: &str) -> bool {
    model.ends_with(":free")
}

pub(crate) struct ConfigResolution {
    dao: Arc<dyn PersonalityDao>,
    guest_default_model: String,
    vision_fallback_model: String,
}

impl ConfigResolution {
    pub(crate) fn new(
        dao: Arc<dyn PersonalityDao>,
        guest_default_model: String,
        vision_fallback_model: String,
    ) -> Self {
        Self {
            dao,
            guest_default_model,
            vision_fallback_model,
        }
    }

    pub(crate) async fn resolve(&self, payload: &GenerationJobPayload) -> Result<ResolvedConfig> {
        let mut personality = self
            .dao
            .personality_by_slug(&payload.personality)
            .await
            .context("personality lookup failed")?
            .ok_or_else(|| anyhow!("unknown personality: {}", payload.personality))?;

        let personality_default = self
            .dao
            .personality_default_config(personality.id)
            .await
            .context("personality default config lookup failed")?
            .unwrap_or_default();

        let user_id = &payload.context.user_id;
        let (user_override, config_source) = if let Some(config) = self
            .dao
            .user_personality_config(user_id, personality.id)
            .await
            .context("user personality config lookup failed")?
        {
            (config, ConfigSource::UserPersonality)
        } else if let Some(config) = self
            .dao
            .user_default_config(user_id)
            .await
            .context("user default config lookup failed")?
        {
            (config, ConfigSource::UserDefault)
        } else {
            (LlmConfigRecord::default(), ConfigSource::Personality)
        };

        let effective = user_override.apply_over(&personality_default);

        if let Some(model) = &effective.model {
            personality.model = model.clone();
        }
        if effective.vision_model.is_some() {
            personality.vision_model = effective.vision_model.clone();
        }

        let params = GenerationParams {
            temperature: effective.temperature,
            frequency_penalty: effective.frequency_penalty,
            max_tokens: effective.max_tokens,
        };

        let configured_model = personality.model.clone();
        let configured_vision_model = personality.vision_model.clone();

        let free_model = self
            .dao
            .guest_default_model()
            .await
            .unwrap_or(None)
            .unwrap_or_else(|| self.guest_default_model.clone());
        let free_vision_model = self.vision_fallback_model.clone();

        // Without a key on the payload the request is presumed guest; stored
        // keys are only consulted in the auth stage, which finalizes this.
        let guest_swap_applied =
            payload.user_api_key.is_none() && !is_free_tier(&configured_model);
        if guest_swap_applied {
            personality.model = free_model.clone();
            personality.vision_model = Some(free_vision_model.clone());
        }

        debug!(
            personality = %personality.slug,
            config_source = config_source.as_str(),
            model = %personality.model,
            guest_swap_applied,
            "configuration resolved"
        );

        Ok(ResolvedConfig {
            personality,
            params,
            config_source,
            configured_model,
            configured_vision_model,
            free_model,
            free_vision_model,
            guest_swap_applied,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn dao_with_personality(model: &str) -> (Arc<MockDao>, Uuid) {
        let dao = Arc::new(MockDao::new());
        let id = Uuid::new_v4();
        dao.add_personality(PersonalityRecord {
            id,
            slug: "test-bot".to_string(),
            display_name: "Test Bot".to_string(),
            system_prompt: "prompt".to_string(),
            model: model.to_string(),
            vision_model: None,
            avatar_url: None,
            persona_id: Uuid::new_v4(),
            share_ltm_across_personalities: false,
            include_prompt_in_vision: false,
        });
        (dao, id)
    }

    fn resolution(dao: Arc<MockDao>) -> ConfigResolution {
        ConfigResolution::new(
            dao,
            "meta-llama/llama-3.3-70b-instruct:free".to_string(),
            "google/gemini-2.5-flash".to_string(),
        )
    }

    #[tokio::test]
    async fn personality_default_source_when_no_user_config() {
        let (dao, _) = dao_with_personality("anthropic/claude-sonnet-4");
        let config = resolution(dao)
            .resolve(&payload(Some("sk-user-key")))
            .await
            .expect("resolve");

        assert_eq!(config.config_source, ConfigSource::Personality);
        assert_eq!(config.personality.model, "anthropic/claude-sonnet-4");
        assert!(!config.guest_swap_applied);
    }

    #[tokio::test]
    async fn user_personality_override_wins_over_user_default() {
        let (dao, personality_id) = dao_with_personality("anthropic/claude-sonnet-4");
        dao.user_default_configs.lock().unwrap().insert(
            "u1".to_string(),
            LlmConfigRecord {
                model: Some("default/model".to_string()),
                ..LlmConfigRecord::default()
            },
        );
        dao.user_personality_configs.lock().unwrap().insert(
            ("u1".to_string(), personality_id),
            LlmConfigRecord {
                model: Some("override/model".to_string()),
                temperature: Some(0.4),
                ..LlmConfigRecord::default()
            },
        );

        let config = resolution(dao)
            .resolve(&payload(Some("sk-user-key")))
            .await
            .expect("resolve");

        assert_eq!(config.config_source, ConfigSource::UserPersonality);
        assert_eq!(config.personality.model, "override/model");
        assert_eq!(config.params.temperature, Some(0.4));
    }

    #[tokio::test]
    async fn missing_payload_key_swaps_to_free_model() {
        let (dao, _) = dao_with_personality("anthropic/claude-sonnet-4");
        let config = resolution(dao)
            .resolve(&payload(None))
            .await
            .expect("resolve");

        assert!(config.guest_swap_applied);
        assert_eq!(
            config.personality.model,
            "meta-llama/llama-3.3-70b-instruct:free"
        );
        assert_eq!(config.configured_model, "anthropic/claude-sonnet-4");
    }

    #[tokio::test]
    async fn free_tier_model_is_not_swapped() {
        let (dao, _) = dao_with_personality("qwen/qwen3-8b:free");
        let config = resolution(dao)
            .resolve(&payload(None))
            .await
            .expect("resolve");

        assert!(!config.guest_swap_applied);
        assert_eq!(config.personality.model, "qwen/qwen3-8b:free");
    }

    #[tokio::test]
    async fn db_guest_model_overrides_config_fallback() {
        let (dao, _) = dao_with_personality("anthropic/claude-sonnet-4");
        *dao.guest_model.lock().unwrap() = Some("db/free-model:free".to_string());

        let config = resolution(dao)
            .resolve(&payload(None))
            .await
            .expect("resolve");

        assert_eq!(config.personality.model, "db/free-model:free");
    }

    #[tokio::test]
    async fn unknown_personality_is_an_error() {
        let dao = Arc::new(MockDao::new());
        let error = resolution(dao)
            .resolve(&payload(None))
            .await
            .expect_err("should fail");
        assert!(error.to_string().contains("unknown personality"));
    }
}
