//! Request-side domain types: the ingress AI request, attachments, and the
//! typed job payloads the orchestrator fans out onto the queue.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Media class an attachment resolves to for preprocessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
}

/// A raw attachment as it arrives from the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_voice_message: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

impl Attachment {
    /// Route by content-type prefix. Voice messages count as audio even when
    /// the platform reports a generic content type.
    #[must_use]
    pub fn media_kind(&self) -> Option<MediaKind> {
        if self.is_voice_message.unwrap_or(false) {
            return Some(MediaKind::Audio);
        }
        if self.content_type.starts_with("audio/") {
            return Some(MediaKind::Audio);
        }
        if self.content_type.starts_with("image/") {
            return Some(MediaKind::Image);
        }
        None
    }
}

/// A message the user quoted, carrying its own attachments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReferencedMessage {
    /// 1-based ordinal identifying the reference in the prompt.
    pub reference_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

/// Per-entry metadata the generator may mutate during a call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referenced_messages: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_descriptions: Vec<String>,
}

/// One turn of raw conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    /// Persona that produced an assistant turn, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality: Option<String>,
    #[serde(default)]
    pub message_metadata: MessageMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    User,
    Assistant,
    System,
}

/// The conversational surroundings of an incoming request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conversation_history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Images attached to surrounding context messages; described inline
    /// rather than through the queue.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extended_context_attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referenced_messages: Vec<ReferencedMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referenced_channels: Vec<String>,
    /// Personas explicitly mentioned in the triggering message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentioned_personalities: Vec<String>,
    /// Suppresses long-term memory writes for this request.
    #[serde(default)]
    pub incognito: bool,
}

impl Default for HistoryEntry {
    fn default() -> Self {
        Self {
            role: HistoryRole::User,
            content: String::new(),
            timestamp: None,
            author_id: None,
            personality: None,
            message_metadata: MessageMetadata::default(),
        }
    }
}

/// Where the final result should be announced once persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseDestination {
    /// Destination type, e.g. `discord`.
    #[serde(rename = "type")]
    pub kind: String,
    pub channel_id: String,
}

impl ResponseDestination {
    /// Pub/sub channel this destination's subscriber listens on.
    #[must_use]
    pub fn delivery_channel(&self) -> String {
        format!("delivery:{}", self.kind)
    }
}

/// An accepted conversational AI request, as handed to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AiRequest {
    pub request_id: String,
    /// Personality slug the request addresses.
    pub personality: String,
    pub message: String,
    pub context: RequestContext,
    pub response_destination: ResponseDestination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_api_key: Option<String>,
}

/// Link from a generation parent to one preprocessing child.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobDependency {
    pub child_job_id: String,
    pub child_type: ChildJobType,
    /// Address of the child's output in the intermediate result store.
    pub result_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildJobType {
    AudioTranscription,
    ImageDescription,
}

/// Payload of an `llm_generation` job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationJobPayload {
    pub request_id: String,
    pub personality: String,
    pub message: String,
    pub context: RequestContext,
    pub response_destination: ResponseDestination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<JobDependency>,
}

/// Payload of an `audio_transcription` child job. One job per audio
/// attachment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudioJobPayload {
    pub request_id: String,
    pub attachment: Attachment,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_reference_number: Option<u32>,
}

/// Payload of an `image_description` child job. Batched: one job carries
/// every image from its source message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageJobPayload {
    pub request_id: String,
    pub attachments: Vec<Attachment>,
    pub personality: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_reference_number: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportType {
    Full,
    MemoryOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Markdown,
}

/// Payload of a `shapes_import` job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShapesImportPayload {
    pub exchange_job_id: uuid::Uuid,
    pub user_id: String,
    pub slug: String,
    pub import_type: ImportType,
    #[serde(default)]
    pub requester_is_admin: bool,
}

/// Payload of a `shapes_export` job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShapesExportPayload {
    pub exchange_job_id: uuid::Uuid,
    pub user_id: String,
    pub slug: String,
    pub format: ExportFormat,
}

/// Payload of a `pending_memory_retry` job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingMemoryRetryPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(content_type: &str, voice: Option<bool>) -> Attachment {
        Attachment {
            url: "https://ex/a".to_string(),
            original_url: None,
            content_type: content_type.to_string(),
            name: None,
            size: None,
            is_voice_message: voice,
            duration_seconds: None,
        }
    }

    #[test]
    fn content_type_prefix_routes_media_kind() {
        assert_eq!(
            attachment("image/png", None).media_kind(),
            Some(MediaKind::Image)
        );
        assert_eq!(
            attachment("audio/mpeg", None).media_kind(),
            Some(MediaKind::Audio)
        );
        assert_eq!(attachment("application/pdf", None).media_kind(), None);
    }

    #[test]
    fn voice_message_flag_forces_audio() {
        assert_eq!(
            attachment("application/octet-stream", Some(true)).media_kind(),
            Some(MediaKind::Audio)
        );
    }

    #[test]
    fn generation_payload_round_trips_camel_case() {
        let payload = GenerationJobPayload {
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
        };

        let json = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(json["requestId"], "r1");
        assert_eq!(json["responseDestination"]["channelId"], "c1");

        let back: GenerationJobPayload = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, payload);
    }

    #[test]
    fn delivery_channel_is_scoped_by_destination_type() {
        let dest = ResponseDestination {
            kind: "discord".to_string(),
            channel_id: "c9".to_string(),
        };
        assert_eq!(dest.delivery_channel(), "delivery:discord");
    }
}
