//! Context preparation: extract conversation participants, compute the
//! oldest history timestamp, convert raw history into generator messages,
//! snapshot the recent assistant window for duplicate detection, and
//! describe extended-context images inline with the config- and
//! auth-resolved vision settings.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::clients::generator::GeneratorMessage;
use crate::describers::ImageDescriber;
use crate::request::{GenerationJobPayload, HistoryEntry, HistoryRole, MediaKind};

use super::context::{PreparedContext, ProcessedAttachment, ResolvedAuth, ResolvedConfig};

/// How many recent assistant turns feed duplicate detection.
const RECENT_ASSISTANT_WINDOW: usize = 5;

pub(crate) struct ContextPreparation;

impl ContextPreparation {
    pub(crate) async fn prepare(
        payload: &GenerationJobPayload,
        config: &ResolvedConfig,
        auth: &ResolvedAuth,
        image_describer: &ImageDescriber,
    ) -> PreparedContext {
        let history = &payload.context.conversation_history;

        let oldest_history_timestamp = oldest_timestamp(history);
        let participants = unique_participants(payload);
        let recent_assistant_messages = recent_assistant_messages(history);
        let conversation_history = to_generator_messages(history);

        let extended_context_attachments =
            describe_extended_context(payload, config, auth, image_describer).await;

        debug!(
            history_len = history.len(),
            participants = participants.len(),
            recent_assistant = recent_assistant_messages.len(),
            extended_attachments = extended_context_attachments.len(),
            "context prepared"
        );

        PreparedContext {
            conversation_history,
            raw_conversation_history: history.clone(),
            oldest_history_timestamp,
            participants,
            recent_assistant_messages,
            extended_context_attachments,
        }
    }
}

fn oldest_timestamp(history: &[HistoryEntry]) -> Option<DateTime<Utc>> {
    history.iter().filter_map(|entry| entry.timestamp).min()
}

/// Active persona first, then personas seen in history, then explicit
/// mentions; first occurrence wins.
fn unique_participants(payload: &GenerationJobPayload) -> Vec<String> {
    let mut participants = vec![payload.personality.clone()];

    let history_personas = payload
        .context
        .conversation_history
        .iter()
        .filter_map(|entry| entry.personality.clone());
    let mentioned = payload.context.mentioned_personalities.iter().cloned();

    for candidate in history_personas.chain(mentioned) {
        if !participants.contains(&candidate) {
            participants.push(candidate);
        }
    }

    participants
}

fn recent_assistant_messages(history: &[HistoryEntry]) -> Vec<String> {
    history
        .iter()
        .rev()
        .filter(|entry| entry.role == HistoryRole::Assistant)
        .take(RECENT_ASSISTANT_WINDOW)
        .map(|entry| entry.content.clone())
        .collect()
}

/// Convert raw history into the message form the generator consumes. Image
/// descriptions already attached to a turn ride along inside its content.
pub(crate) fn to_generator_messages(history: &[HistoryEntry]) -> Vec<GeneratorMessage> {
    history
        .iter()
        .map(|entry| {
            let role = match entry.role {
                HistoryRole::User => "user",
                HistoryRole::Assistant => "assistant",
                HistoryRole::System => "system",
            };

            let mut content = entry.content.clone();
            if !entry.message_metadata.image_descriptions.is_empty() {
                content.push_str("\n[attached images: ");
                content.push_str(&entry.message_metadata.image_descriptions.join("; "));
                content.push(']');
            }

            GeneratorMessage {
                role: role.to_string(),
                content,
            }
        })
        .collect()
}

/// Drop the oldest `drop_percent` of history entries. Used by the retry
/// loop's progressive history reduction.
pub(crate) fn reduce_history(history: &[HistoryEntry], drop_percent: u8) -> Vec<HistoryEntry> {
    if drop_percent == 0 || history.is_empty() {
        return history.to_vec();
    }
    let drop_count = (history.len() * usize::from(drop_percent.min(100))) / 100;
    history[drop_count.min(history.len())..].to_vec()
}

async fn describe_extended_context(
    payload: &GenerationJobPayload,
    config: &ResolvedConfig,
    auth: &ResolvedAuth,
    image_describer: &ImageDescriber,
) -> Vec<ProcessedAttachment> {
    let images: Vec<_> = payload
        .context
        .extended_context_attachments
        .iter()
        .filter(|attachment| attachment.media_kind() == Some(MediaKind::Image))
        .cloned()
        .collect();

    if images.is_empty() {
        return Vec::new();
    }

    // These never traverse the queue: the vision model and key resolved for
    // this request apply directly.
    let mut effective = config.personality.clone();
    effective.model = auth.model.clone();
    effective.vision_model = auth.vision_model.clone();

    let output = image_describer
        .describe_batch(&images, Some(&effective), auth.api_key.as_deref())
        .await;

    output
        .descriptions
        .into_iter()
        .map(|item| ProcessedAttachment {
            kind: MediaKind::Image,
            description: item.description,
            original_url: Some(item.url),
            metadata: serde_json::json!({"extendedContext": true}),
        })
        .collect()
}
