//! The generation pipeline's result contract. Soft failures travel the same
//! persistence and delivery path as successes; only the queue-visible
//! outcome differs (a soft failure still completes its job).

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use crate::util::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ErrorCategory {
    /// Network-ish failure that exhausted its budget.
    Transient,
    /// The upstream API rejected or mangled the call.
    ApiError,
    /// The model produced nothing usable (reasoning-only output).
    EmptyResponse,
    /// Credentials missing or rejected.
    AuthInvalid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ErrorInfo {
    /// Short machine-readable error type.
    pub(crate) kind: String,
    pub(crate) category: ErrorCategory,
    /// Short human-readable message shown to the user.
    pub(crate) user_message: String,
    /// Support lookup token, also present in logs.
    pub(crate) reference_id: String,
    pub(crate) should_retry: bool,
}

impl ErrorInfo {
    /// Classify a stage failure into user-facing error info.
    pub(crate) fn from_stage_error(error: &anyhow::Error, kind_hint: ErrorKind) -> Self {
        let reference_id = Uuid::new_v4().simple().to_string();
        let (category, user_message, should_retry) = match kind_hint {
            ErrorKind::Retryable => (
                ErrorCategory::Transient,
                "The AI service is briefly unavailable. Please try again.".to_string(),
                true,
            ),
            ErrorKind::Fatal => (
                ErrorCategory::AuthInvalid,
                "The configured API key was rejected. Please check your key.".to_string(),
                false,
            ),
            ErrorKind::NonRetryable => (
                ErrorCategory::ApiError,
                "Something went wrong while generating a response.".to_string(),
                false,
            ),
        };

        Self {
            kind: error
                .chain()
                .last()
                .map_or_else(|| "unknown".to_string(), |root| root.to_string()),
            category,
            user_message,
            reference_id,
            should_retry,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerationMetadata {
    pub(crate) retrieved_memories: usize,
    pub(crate) tokens_in: u64,
    pub(crate) tokens_out: u64,
    pub(crate) processing_time_ms: u64,
    pub(crate) model_used: String,
    pub(crate) provider_used: String,
    pub(crate) config_source: String,
    pub(crate) is_guest_mode: bool,
    pub(crate) cross_turn_duplicate_detected: bool,
    pub(crate) attempts: usize,
    /// Presentation hints for the destination (webhook name and avatar).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub(crate) personality_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) personality_avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) memory_storage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) thinking: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerationResult {
    pub(crate) request_id: String,
    pub(crate) success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) attachment_descriptions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) referenced_messages_descriptions: Option<BTreeMap<u32, Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error_info: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) failed_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) last_successful_step: Option<String>,
    pub(crate) metadata: GenerationMetadata,
}

impl GenerationResult {
    pub(crate) fn soft_failure(
        request_id: impl Into<String>,
        error: &anyhow::Error,
        error_info: ErrorInfo,
        failed_step: &str,
        last_successful_step: &str,
        metadata: GenerationMetadata,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            content: None,
            attachment_descriptions: None,
            referenced_messages_descriptions: None,
            error: Some(error.to_string()),
            error_info: Some(error_info),
            failed_step: Some(failed_step.to_string()),
            last_successful_step: Some(last_successful_step.to_string()),
            metadata,
        }
    }

    pub(crate) fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "requestId": self.request_id,
                "success": self.success,
            })
        })
    }
}
