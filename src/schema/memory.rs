//! Pending-memory metadata contract. Rows whose metadata no longer satisfies
//! this schema are permanently shelved by the retrier instead of retried.

use once_cell::sync::Lazy;
use serde_json::{Value, json};

pub(crate) static PENDING_MEMORY_METADATA_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "required": ["personalityId", "userId"],
        "properties": {
            "personalityId": {"type": "string", "minLength": 1},
            "userId": {"type": "string", "minLength": 1},
            "channelId": {"type": ["string", "null"]},
            "serverId": {"type": ["string", "null"]},
            "requestId": {"type": "string"},
            "summaryType": {"type": "string"}
        }
    })
});
