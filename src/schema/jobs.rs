//! Job payload schemas. The orchestrator validates every payload before a
//! flow is admitted to the queue; the generation pipeline re-validates at
//! dequeue as its first stage.

use once_cell::sync::Lazy;
use serde_json::{Value, json};

pub(crate) static GENERATION_JOB_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "required": ["requestId", "personality", "message", "context", "responseDestination"],
        "properties": {
            "requestId": {"type": "string", "minLength": 1},
            "personality": {"type": "string", "minLength": 1},
            "message": {"type": "string"},
            "context": {
                "type": "object",
                "required": ["userId"],
                "properties": {
                    "userId": {"type": "string", "minLength": 1},
                    "channelId": {"type": "string"},
                    "serverId": {"type": "string"},
                    "conversationHistory": {"type": "array"},
                    "attachments": {"type": "array"},
                    "extendedContextAttachments": {"type": "array"},
                    "referencedMessages": {"type": "array"}
                }
            },
            "responseDestination": {
                "type": "object",
                "required": ["type", "channelId"],
                "properties": {
                    "type": {"type": "string", "minLength": 1},
                    "channelId": {"type": "string", "minLength": 1}
                }
            },
            "userApiKey": {"type": "string"},
            "dependencies": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["childJobId", "childType", "resultKey"],
                    "properties": {
                        "childJobId": {"type": "string", "minLength": 1},
                        "childType": {"enum": ["audio_transcription", "image_description"]},
                        "resultKey": {"type": "string", "minLength": 1}
                    }
                }
            }
        }
    })
});

pub(crate) static AUDIO_JOB_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "required": ["requestId", "attachment", "userId"],
        "properties": {
            "requestId": {"type": "string", "minLength": 1},
            "attachment": {
                "type": "object",
                "required": ["url", "contentType"],
                "properties": {
                    "url": {"type": "string", "minLength": 1},
                    "contentType": {"type": "string", "minLength": 1}
                }
            },
            "userId": {"type": "string", "minLength": 1},
            "channelId": {"type": "string"},
            "sourceReferenceNumber": {"type": "integer", "minimum": 1}
        }
    })
});

pub(crate) static IMAGE_JOB_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "required": ["requestId", "attachments", "personality", "userId"],
        "properties": {
            "requestId": {"type": "string", "minLength": 1},
            "attachments": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "required": ["url", "contentType"],
                    "properties": {
                        "url": {"type": "string", "minLength": 1},
                        "contentType": {"type": "string", "pattern": "^image/"}
                    }
                }
            },
            "personality": {"type": "string", "minLength": 1},
            "userId": {"type": "string", "minLength": 1},
            "sourceReferenceNumber": {"type": "integer", "minimum": 1}
        }
    })
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::validate_json;

    #[test]
    fn generation_schema_accepts_minimal_payload() {
        let instance = json!({
            "requestId": "r1",
            "personality": "test-bot",
            "message": "Hello",
            "context": {"userId": "u1"},
            "responseDestination": {"type": "discord", "channelId": "c1"}
        });
        assert!(validate_json(&GENERATION_JOB_SCHEMA, &instance).valid);
    }

    #[test]
    fn generation_schema_rejects_missing_destination() {
        let instance = json!({
            "requestId": "r1",
            "personality": "test-bot",
            "message": "Hello",
            "context": {"userId": "u1"}
        });
        assert!(!validate_json(&GENERATION_JOB_SCHEMA, &instance).valid);
    }

    #[test]
    fn audio_schema_rejects_attachment_without_url() {
        let instance = json!({
            "requestId": "r1",
            "attachment": {"contentType": "audio/ogg"},
            "userId": "u1"
        });
        assert!(!validate_json(&AUDIO_JOB_SCHEMA, &instance).valid);
    }

    #[test]
    fn image_schema_rejects_non_image_content_type() {
        let instance = json!({
            "requestId": "r1",
            "attachments": [{"url": "https://ex/b.pdf", "contentType": "application/pdf"}],
            "personality": "test-bot",
            "userId": "u1"
        });
        assert!(!validate_json(&IMAGE_JOB_SCHEMA, &instance).valid);
    }
}
