//! Long-term memory pathway: deferred storage after the retry loop
//! converges, a bounded retry queue for failed stores, and scoped retrieval.

pub(crate) mod deferred;
pub(crate) mod pending;
pub mod retrieval;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A memory produced during generation, stored once per request after the
/// duplicate-retry loop settles on a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeferredMemoryRecord {
    pub(crate) text: String,
    pub(crate) metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) embedding: Option<Vec<f32>>,
}

/// Ownership scope attached to a stored memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MemoryScope {
    pub(crate) persona_id: Uuid,
    pub(crate) personality_id: Uuid,
    pub(crate) user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) channel_id: Option<String>,
}
