//! The generation pipeline's typed context. Each stage returns a context
//! with exactly one more field populated; later stages may read earlier
//! fields, and a missing field at read time is a programming error, not a
//! runtime condition.

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::clients::generator::{GenerationParams, GeneratorMessage};
use crate::request::{GenerationJobPayload, HistoryEntry, MediaKind};
use crate::store::models::PersonalityRecord;

/// Pipeline steps in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Validation,
    Dependencies,
    Config,
    Auth,
    Context,
    Generation,
}

impl Step {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Step::Validation => "validation",
            Step::Dependencies => "dependency_resolution",
            Step::Config => "config_resolution",
            Step::Auth => "auth_resolution",
            Step::Context => "context_preparation",
            Step::Generation => "generation",
        }
    }
}

/// Text derived from a non-text attachment, ready for the generator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProcessedAttachment {
    pub(crate) kind: MediaKind,
    pub(crate) description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) original_url: Option<String>,
    pub(crate) metadata: Value,
}

/// Aggregated preprocessing outputs for one request. Attachments carrying a
/// source reference number route into the per-reference map; the rest
/// accumulate in the flat list.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PreprocessingResults {
    pub(crate) processed_attachments: Vec<ProcessedAttachment>,
    pub(crate) transcriptions: Vec<String>,
    pub(crate) reference_attachments: BTreeMap<u32, Vec<ProcessedAttachment>>,
}

/// Where the effective configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConfigSource {
    Personality,
    UserPersonality,
    UserDefault,
}

impl ConfigSource {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Personality => "personality",
            ConfigSource::UserPersonality => "user-personality",
            ConfigSource::UserDefault => "user-default",
        }
    }
}

/// Output of the config-resolution stage: the effective personality with
/// user overrides applied, plus what a guest-mode swap would substitute.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedConfig {
    pub(crate) personality: PersonalityRecord,
    pub(crate) params: GenerationParams,
    pub(crate) config_source: ConfigSource,
    /// Model before any guest-mode substitution.
    pub(crate) configured_model: String,
    pub(crate) configured_vision_model: Option<String>,
    /// Free-tier defaults to substitute under guest mode.
    pub(crate) free_model: String,
    pub(crate) free_vision_model: String,
    /// Whether the swap was already applied (no user key on the payload).
    pub(crate) guest_swap_applied: bool,
}

/// Output of the auth-resolution stage. Model selection is finalized here
/// because guest mode is only definitive once stored keys were consulted.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedAuth {
    pub(crate) api_key: Option<String>,
    pub(crate) provider: String,
    pub(crate) is_guest_mode: bool,
    pub(crate) model: String,
    pub(crate) vision_model: Option<String>,
}

/// Output of the context-preparation stage.
#[derive(Debug, Clone)]
pub(crate) struct PreparedContext {
    pub(crate) conversation_history: Vec<GeneratorMessage>,
    pub(crate) raw_conversation_history: Vec<HistoryEntry>,
    pub(crate) oldest_history_timestamp: Option<DateTime<Utc>>,
    /// Unique participants: active persona, personas seen in history, and
    /// explicitly mentioned personas.
    pub(crate) participants: Vec<String>,
    /// Last up-to-5 assistant turns, most recent first. The duplicate
    /// detector compares against this fixed snapshot across all retries.
    pub(crate) recent_assistant_messages: Vec<String>,
    /// Inline-described extended-context images.
    pub(crate) extended_context_attachments: Vec<ProcessedAttachment>,
}

/// The immutable, stage-by-stage enriched pipeline payload.
#[derive(Debug)]
pub(crate) struct GenerationContext {
    pub(crate) job_id: String,
    pub(crate) payload: GenerationJobPayload,
    pub(crate) started_at: Instant,
    pub(crate) preprocessing: Option<PreprocessingResults>,
    pub(crate) config: Option<ResolvedConfig>,
    pub(crate) auth: Option<ResolvedAuth>,
    pub(crate) prepared: Option<PreparedContext>,
}

impl GenerationContext {
    pub(crate) fn new(job_id: impl Into<String>, payload: GenerationJobPayload) -> Self {
        Self {
            job_id: job_id.into(),
            payload,
            started_at: Instant::now(),
            preprocessing: None,
            config: None,
            auth: None,
            prepared: None,
        }
    }

    pub(crate) fn preprocessing(&self) -> Result<&PreprocessingResults> {
        self.preprocessing
            .as_ref()
            .ok_or_else(|| anyhow!("preprocessing read before dependency resolution ran"))
    }

    pub(crate) fn config(&self) -> Result<&ResolvedConfig> {
        self.config
            .as_ref()
            .ok_or_else(|| anyhow!("config read before config resolution ran"))
    }

    pub(crate) fn auth(&self) -> Result<&ResolvedAuth> {
        self.auth
            .as_ref()
            .ok_or_else(|| anyhow!("auth read before auth resolution ran"))
    }

    pub(crate) fn prepared(&self) -> Result<&PreparedContext> {
        self.prepared
            .as_ref()
            .ok_or_else(|| anyhow!("prepared context read before context preparation ran"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{RequestContext, ResponseDestination};

    fn payload() -> GenerationJobPayload {
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
            user_api_key: None,
            dependencies: vec![],
        }
    }

    #[test]
    fn step_names_are_stable() {
        let names: Vec<&str> = [
            Step::Validation,
            Step::Dependencies,
            Step::Config,
            Step::Auth,
            Step::Context,
            Step::Generation,
        ]
        .iter()
        .map(|s| s.name())
        .collect();
        assert_eq!(
            names,
            vec![
                "validation",
                "dependency_resolution",
                "config_resolution",
                "auth_resolution",
                "context_preparation",
                "generation",
            ]
        );
    }

    #[test]
    fn missing_stage_fields_are_programming_errors() {
        let ctx = GenerationContext::new("gen:r1", payload());

        assert!(ctx.preprocessing().is_err());
        assert!(ctx.config().is_err());
        assert!(ctx.auth().is_err());
        assert!(ctx.prepared().is_err());
    }
}
