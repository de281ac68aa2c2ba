pub(crate) mod embeddings;
pub(crate) mod generator;
pub(crate) mod memory;
pub(crate) mod transcription;
pub(crate) mod vision;

pub(crate) use embeddings::{Embedder, HttpEmbedder, cosine_similarity};
pub(crate) use generator::{GatewayGeneratorClient, ResponseGenerator};
pub(crate) use memory::{HttpVectorMemoryStore, VectorMemoryStore};
pub(crate) use transcription::{HttpTranscriber, Transcriber};
pub(crate) use vision::{HttpVisionModel, VisionModel};

/// Provider tag derived from a namespaced model id
/// (`anthropic/claude-sonnet-4` → `anthropic`).
#[must_use]
pub(crate) fn provider_for_model(model: &str) -> &str {
    model.split('/').next().unwrap_or(model)
}

/// Cap error bodies quoted into logs and error chains.
pub(crate) fn truncate_error_body(body: &str) -> String {
    crate::util::text::truncate_chars(body, 512)
}
