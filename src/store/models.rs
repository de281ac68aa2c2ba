//! Database-facing record types shared by the DAO layer and handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A personality row joined with its owning persona's memory-sharing flag.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PersonalityRecord {
    pub(crate) id: Uuid,
    pub(crate) slug: String,
    pub(crate) display_name: String,
    pub(crate) system_prompt: String,
    pub(crate) model: String,
    pub(crate) vision_model: Option<String>,
    pub(crate) avatar_url: Option<String>,
    pub(crate) persona_id: Uuid,
    /// When true, memory retrieval for this persona spans every personality
    /// it owns instead of filtering to the active one.
    pub(crate) share_ltm_across_personalities: bool,
    /// Whether the personality's system prompt may accompany vision calls.
    pub(crate) include_prompt_in_vision: bool,
}

/// Tunable LLM settings. Any field may be absent; absent fields fall through
/// to the next level of the configuration hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct LlmConfigRecord {
    pub(crate) model: Option<String>,
    pub(crate) vision_model: Option<String>,
    pub(crate) temperature: Option<f64>,
    pub(crate) frequency_penalty: Option<f64>,
    pub(crate) max_tokens: Option<i32>,
}

impl LlmConfigRecord {
    /// Overlay `self` on top of `base`: present fields win.
    pub(crate) fn apply_over(&self, base: &LlmConfigRecord) -> LlmConfigRecord {
        LlmConfigRecord {
            model: self.model.clone().or_else(|| base.model.clone()),
            vision_model: self
                .vision_model
                .clone()
                .or_else(|| base.vision_model.clone()),
            temperature: self.temperature.or(base.temperature),
            frequency_penalty: self.frequency_penalty.or(base.frequency_penalty),
            max_tokens: self.max_tokens.or(base.max_tokens),
        }
    }
}

/// A memory whose storage attempt failed, queued for bounded retries.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingMemoryRow {
    pub(crate) id: Uuid,
    pub(crate) text: String,
    pub(crate) metadata: Value,
    pub(crate) attempts: i32,
    #[allow(dead_code)]
    pub(crate) last_attempt_at: Option<DateTime<Utc>>,
    #[allow(dead_code)]
    pub(crate) error: Option<String>,
    #[allow(dead_code)]
    pub(crate) created_at: DateTime<Utc>,
}

/// Sentinel `attempts` value marking a permanently shelved pending memory.
pub(crate) const PENDING_MEMORY_SHELVED: i32 = 999;

#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct PendingMemoryStats {
    pub(crate) total: i64,
    /// Histogram of rows per attempt count, ascending by attempts.
    pub(crate) by_attempts: Vec<AttemptBucket>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct AttemptBucket {
    pub(crate) attempts: i32,
    pub(crate) count: i64,
}

/// One generation's flight-recorder payload, retained for 24 hours.
#[derive(Debug, Clone)]
pub(crate) struct DiagnosticRecord {
    pub(crate) request_id: String,
    pub(crate) trigger_message_id: Option<String>,
    pub(crate) personality_id: Option<Uuid>,
    pub(crate) user_id: String,
    pub(crate) guild_id: Option<String>,
    pub(crate) channel_id: Option<String>,
    pub(crate) model: String,
    pub(crate) provider: String,
    pub(crate) duration_ms: i64,
    pub(crate) data: Value,
}

/// Everything an external import upserts for one personality, applied under
/// a single transaction.
#[derive(Debug, Clone)]
pub(crate) struct ImportedPersonality {
    pub(crate) slug: String,
    pub(crate) display_name: String,
    pub(crate) system_prompt: String,
    pub(crate) model: String,
    pub(crate) vision_model: Option<String>,
    pub(crate) default_config: LlmConfigRecord,
    pub(crate) owner_user_id: String,
}

/// Memory ingest counters for an import job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub(crate) struct ImportCounters {
    pub(crate) imported: u64,
    pub(crate) skipped: u64,
    pub(crate) failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_overlay_prefers_present_fields() {
        let base = LlmConfigRecord {
            model: Some("base-model".to_string()),
            vision_model: Some("base-vision".to_string()),
            temperature: Some(0.7),
            frequency_penalty: None,
            max_tokens: Some(1024),
        };
        let overlay = LlmConfigRecord {
            model: Some("override-model".to_string()),
            temperature: None,
            ..LlmConfigRecord::default()
        };

        let effective = overlay.apply_over(&base);

        assert_eq!(effective.model.as_deref(), Some("override-model"));
        assert_eq!(effective.vision_model.as_deref(), Some("base-vision"));
        assert_eq!(effective.temperature, Some(0.7));
        assert_eq!(effective.max_tokens, Some(1024));
    }
}
