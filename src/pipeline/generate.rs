//! Generation: invoke the response generator, detect cross-turn duplicates,
//! retry with escalated sampling parameters, and store deferred memory once
//! after the loop settles. Retries run in-process and sequentially; each
//! attempt works on its own deep clone of the conversation history because
//! the generator may mutate message metadata during a call.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{error, info, warn};

use crate::clients::generator::{
    GenerationParams, GeneratorMessage, GeneratorRequest, GeneratorResponse, ResponseGenerator,
};
use crate::memory::MemoryScope;
use crate::memory::deferred::{DeferredMemoryWriter, DeferredStoreOutcome};
use crate::memory::retrieval::MemoryRetriever;
use crate::observability::metrics::Metrics;
use crate::util::text::strip_response_footer;

use super::context::{GenerationContext, ProcessedAttachment};
use super::dedup::DuplicateDetector;
use super::outcome::{ErrorCategory, ErrorInfo, GenerationMetadata, GenerationResult};
use super::prepare::{reduce_history, to_generator_messages};
use super::recorder::FlightRecorder;

const DEFAULT_TEMPERATURE: f64 = 0.7;
const DEFAULT_FREQUENCY_PENALTY: f64 = 0.0;
const TEMPERATURE_STEP: f64 = 0.15;
const TEMPERATURE_CAP: f64 = 1.5;
const FREQUENCY_PENALTY_STEP: f64 = 0.2;
const FREQUENCY_PENALTY_CAP: f64 = 2.0;
const HISTORY_REDUCTION_STEP: u8 = 20;
const HISTORY_REDUCTION_CAP: u8 = 60;

/// Parameter escalation for a 1-based attempt number. Attempt 1 runs the
/// configured parameters; each later attempt raises temperature and
/// frequency penalty monotonically.
pub(crate) fn escalated_params(base: &GenerationParams, attempt: usize) -> GenerationParams {
    if attempt <= 1 {
        return *base;
    }

    let steps = (attempt - 1) as f64;
    let temperature = (base.temperature.unwrap_or(DEFAULT_TEMPERATURE)
        + TEMPERATURE_STEP * steps)
        .min(TEMPERATURE_CAP);
    let frequency_penalty = (base.frequency_penalty.unwrap_or(DEFAULT_FREQUENCY_PENALTY)
        + FREQUENCY_PENALTY_STEP * steps)
        .min(FREQUENCY_PENALTY_CAP);

    GenerationParams {
        temperature: Some(temperature),
        frequency_penalty: Some(frequency_penalty),
        max_tokens: base.max_tokens,
    }
}

/// Oldest-history drop percentage for a 1-based attempt number.
pub(crate) fn history_reduction_percent(attempt: usize) -> u8 {
    if attempt <= 1 {
        return 0;
    }
    let steps = u8::try_from(attempt - 1).unwrap_or(u8::MAX);
    steps
        .saturating_mul(HISTORY_REDUCTION_STEP)
        .min(HISTORY_REDUCTION_CAP)
}

pub(crate) struct GenerationStage {
    generator: Arc<dyn ResponseGenerator>,
    detector: Arc<DuplicateDetector>,
    retriever: Arc<MemoryRetriever>,
    deferred: Arc<DeferredMemoryWriter>,
    metrics: Arc<Metrics>,
    max_attempts: usize,
}

impl GenerationStage {
    pub(crate) fn new(
        generator: Arc<dyn ResponseGenerator>,
        detector: Arc<DuplicateDetector>,
        retriever: Arc<MemoryRetriever>,
        deferred: Arc<DeferredMemoryWriter>,
        metrics: Arc<Metrics>,
        max_attempts: usize,
    ) -> Self {
        Self {
            generator,
            detector,
            retriever,
            deferred,
            metrics,
            max_attempts,
        }
    }

    pub(crate) async fn run(
        &self,
        ctx: &GenerationContext,
        recorder: &mut FlightRecorder,
    ) -> Result<GenerationResult> {
        let payload = &ctx.payload;
        let preprocessing = ctx.preprocessing()?;
        let config = ctx.config()?;
        let auth = ctx.auth()?;
        let prepared = ctx.prepared()?;

        let retrieved_memories = match self
            .retriever
            .retrieve(
                &payload.message,
                &config.personality,
                payload.context.channel_id.as_deref(),
                prepared.oldest_history_timestamp,
            )
            .await
        {
            Ok(hits) => hits.into_iter().map(|hit| hit.text).collect(),
            Err(retrieval_error) => {
                warn!(
                    request_id = %payload.request_id,
                    error = %retrieval_error,
                    "memory retrieval failed, generating without memories"
                );
                Vec::new()
            }
        };

        let attachment_context = build_attachment_context(
            &preprocessing.processed_attachments,
            &preprocessing.transcriptions,
            &preprocessing.reference_attachments,
            &prepared.extended_context_attachments,
        );

        let recent = &prepared.recent_assistant_messages;
        let mut duplicate_detected = false;
        let mut attempts_used = 0;
        let mut accepted: Option<GeneratorResponse> = None;

        for attempt in 1..=self.max_attempts.max(1) {
            attempts_used = attempt;
            let params = escalated_params(&config.params, attempt);
            recorder.note_attempt(attempt, &params);
            self.metrics.generation_attempts.inc();

            // Per-attempt context isolation: the generator may mutate message
            // metadata, so every attempt gets its own clone of the history.
            let reduction = history_reduction_percent(attempt);
            let mut messages = if reduction == 0 {
                prepared.conversation_history.clone()
            } else {
                let history = reduce_history(&prepared.raw_conversation_history, reduction);
                to_generator_messages(&history)
            };
            messages.push(GeneratorMessage {
                role: "user".to_string(),
                content: payload.message.clone(),
            });

            let request = GeneratorRequest {
                request_id: payload.request_id.clone(),
                model: auth.model.clone(),
                system_prompt: config.personality.system_prompt.clone(),
                messages,
                params,
                user_id: payload.context.user_id.clone(),
                channel_id: payload.context.channel_id.clone(),
                participants: prepared.participants.clone(),
                retrieved_memories: retrieved_memories.clone(),
                // Memory storage stays suppressed across every retry; the
                // winning response's memory is stored once below.
                defer_memory_storage: true,
                incognito: payload.context.incognito,
                user_api_key: auth.api_key.clone(),
                attachment_context: Some(attachment_context.clone()),
            };

            let response = self
                .generator
                .generate(&request)
                .await
                .context("response generation failed")?;

            let check = self.detector.check(&response.content, recent).await;
            if !check.is_duplicate {
                accepted = Some(response);
                break;
            }

            duplicate_detected = true;
            self.metrics.duplicates_detected.inc();
            recorder.note_duplicate(attempt, &check);

            if attempt == self.max_attempts {
                error!(
                    request_id = %payload.request_id,
                    attempts = attempt,
                    "duplicate retries exhausted, returning last response anyway"
                );
                accepted = Some(response);
            } else {
                info!(
                    request_id = %payload.request_id,
                    attempt,
                    match_index = check.match_index,
                    "cross-turn duplicate detected, retrying with escalated parameters"
                );
            }
        }

        let response = accepted.context("generation loop produced no response")?;

        let mut metadata = GenerationMetadata {
            retrieved_memories: retrieved_memories.len(),
            tokens_in: response.tokens_in,
            tokens_out: response.tokens_out,
            processing_time_ms: ctx.started_at.elapsed().as_millis() as u64,
            model_used: response.model_used.clone().unwrap_or_else(|| auth.model.clone()),
            provider_used: response
                .provider_used
                .clone()
                .unwrap_or_else(|| auth.provider.clone()),
            config_source: config.config_source.as_str().to_string(),
            is_guest_mode: auth.is_guest_mode,
            cross_turn_duplicate_detected: duplicate_detected,
            attempts: attempts_used,
            personality_name: config.personality.display_name.clone(),
            personality_avatar_url: config.personality.avatar_url.clone(),
            memory_storage: None,
            thinking: None,
        };

        // Reasoning models sometimes emit only thinking tags; after footer
        // stripping there is nothing deliverable left.
        let content = strip_response_footer(&response.content);
        if content.trim().is_empty() {
            metadata.thinking = response.thinking.clone();
            recorder.note("empty_response", json!({"hadThinking": response.thinking.is_some()}));
            let empty_error = anyhow::anyhow!("generator returned no deliverable content");
            return Ok(GenerationResult {
                request_id: payload.request_id.clone(),
                success: false,
                content: None,
                attachment_descriptions: None,
                referenced_messages_descriptions: None,
                error: Some(empty_error.to_string()),
                error_info: Some(ErrorInfo {
                    kind: "empty_response".to_string(),
                    category: ErrorCategory::EmptyResponse,
                    user_message:
                        "The model produced an empty response. Please try rephrasing your message."
                            .to_string(),
                    reference_id: uuid::Uuid::new_v4().simple().to_string(),
                    should_retry: false,
                }),
                failed_step: Some("generation".to_string()),
                last_successful_step: Some("context_preparation".to_string()),
                metadata,
            });
        }

        let scope = MemoryScope {
            persona_id: config.personality.persona_id,
            personality_id: config.personality.id,
            user_id: payload.context.user_id.clone(),
            channel_id: payload.context.channel_id.clone(),
        };
        match self
            .deferred
            .store_once(
                &payload.request_id,
                response.deferred_memory.as_ref(),
                &scope,
                payload.context.incognito,
            )
            .await
        {
            Ok(outcome) => {
                if outcome == DeferredStoreOutcome::Queued {
                    self.metrics.pending_memories_queued.inc();
                }
                metadata.memory_storage = Some(memory_outcome_label(outcome).to_string());
            }
            Err(store_error) => {
                // The user already has a validated response; memory problems
                // must not fail the job.
                warn!(
                    request_id = %payload.request_id,
                    error = %store_error,
                    "deferred memory pathway failed"
                );
                metadata.memory_storage = Some("error".to_string());
            }
        }

        let attachment_descriptions: Vec<String> = preprocessing
            .processed_attachments
            .iter()
            .chain(prepared.extended_context_attachments.iter())
            .map(|attachment| attachment.description.clone())
            .collect();

        let referenced_messages_descriptions: BTreeMap<u32, Vec<String>> = preprocessing
            .reference_attachments
            .iter()
            .map(|(reference, attachments)| {
                (
                    *reference,
                    attachments.iter().map(|a| a.description.clone()).collect(),
                )
            })
            .collect();

        Ok(GenerationResult {
            request_id: payload.request_id.clone(),
            success: true,
            content: Some(content),
            attachment_descriptions: if attachment_descriptions.is_empty() {
                None
            } else {
                Some(attachment_descriptions)
            },
            referenced_messages_descriptions: if referenced_messages_descriptions.is_empty() {
                None
            } else {
                Some(referenced_messages_descriptions)
            },
            error: None,
            error_info: None,
            failed_step: None,
            last_successful_step: None,
            metadata,
        })
    }
}

fn memory_outcome_label(outcome: DeferredStoreOutcome) -> &'static str {
    match outcome {
        DeferredStoreOutcome::Stored => "stored",
        DeferredStoreOutcome::Queued => "queued_for_retry",
        DeferredStoreOutcome::SkippedIncognito => "skipped_incognito",
        DeferredStoreOutcome::None => "none",
    }
}

fn build_attachment_context(
    processed: &[ProcessedAttachment],
    transcriptions: &[String],
    references: &BTreeMap<u32, Vec<ProcessedAttachment>>,
    extended: &[ProcessedAttachment],
) -> serde_json::Value {
    json!({
        "processedAttachments": processed,
        "transcriptions": transcriptions,
        "referenceAttachments": references,
        "extendedContextAttachments": extended,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_one_uses_configured_parameters() {
        let base = GenerationParams {
            temperature: Some(0.5),
            frequency_penalty: Some(0.1),
            max_tokens: Some(512),
        };
        assert_eq!(escalated_params(&base, 1), base);
    }

    #[test]
    fn escalation_is_strictly_monotone_from_attempt_two() {
        let base = GenerationParams::default();
        let mut previous_temperature = f64::MIN;
        let mut previous_penalty = f64::MIN;

        for attempt in 2..=4 {
            let params = escalated_params(&base, attempt);
            let temperature = params.temperature.unwrap();
            let penalty = params.frequency_penalty.unwrap();
            assert!(temperature > previous_temperature);
            assert!(penalty > previous_penalty);
            previous_temperature = temperature;
            previous_penalty = penalty;
        }
    }

    #[test]
    fn escalation_preserves_max_tokens() {
        let base = GenerationParams {
            temperature: None,
            frequency_penalty: None,
            max_tokens: Some(2048),
        };
        assert_eq!(escalated_params(&base, 3).max_tokens, Some(2048));
    }

    #[test]
    fn history_reduction_is_progressive_and_capped() {
        assert_eq!(history_reduction_percent(1), 0);
        assert_eq!(history_reduction_percent(2), 20);
        assert_eq!(history_reduction_percent(3), 40);
        assert_eq!(history_reduction_percent(4), 60);
        assert_eq!(history_reduction_percent(9), 60);
    }
}
