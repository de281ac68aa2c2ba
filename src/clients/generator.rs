//! Client for the external response-generator gateway. The gateway owns
//! prompt assembly and memory retrieval; this worker owns orchestration,
//! duplicate detection, and retry policy.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::memory::{DeferredMemoryRecord, MemoryScope};

use super::truncate_error_body;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeneratorMessage {
    pub(crate) role: String,
    pub(crate) content: String,
}

/// Sampling parameters for one generation attempt. The duplicate-retry loop
/// escalates these between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerationParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) max_tokens: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeneratorRequest {
    pub(crate) request_id: String,
    pub(crate) model: String,
    pub(crate) system_prompt: String,
    pub(crate) messages: Vec<GeneratorMessage>,
    pub(crate) params: GenerationParams,
    pub(crate) user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) channel_id: Option<String>,
    /// Conversation participants, active persona first. The prompt
    /// assembler uses these to disambiguate multi-persona history.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) participants: Vec<String>,
    /// Memories retrieved by the worker, offered to the prompt assembler.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) retrieved_memories: Vec<String>,
    /// When set, the gateway must return deferred-memory data instead of
    /// storing it; the worker stores once after retries converge.
    pub(crate) defer_memory_storage: bool,
    pub(crate) incognito: bool,
    /// Bring-your-own key; absent in guest mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) user_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) attachment_context: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeneratorResponse {
    #[serde(default)]
    pub(crate) content: String,
    #[serde(default)]
    pub(crate) thinking: Option<String>,
    #[serde(default)]
    pub(crate) deferred_memory: Option<DeferredMemoryRecord>,
    #[serde(default)]
    pub(crate) tokens_in: u64,
    #[serde(default)]
    pub(crate) tokens_out: u64,
    #[serde(default)]
    pub(crate) model_used: Option<String>,
    #[serde(default)]
    pub(crate) provider_used: Option<String>,
}

#[async_trait]
pub(crate) trait ResponseGenerator: Send + Sync {
    async fn generate(&self, request: &GeneratorRequest) -> Result<GeneratorResponse>;

    /// Store the deferred-memory data a previous `generate` call returned.
    async fn store_deferred_memory(
        &self,
        memory: &DeferredMemoryRecord,
        scope: &MemoryScope,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub(crate) struct GatewayGeneratorClient {
    client: Client,
    base_url: Url,
    total_timeout: Duration,
    service_token: Option<String>,
}

impl GatewayGeneratorClient {
    pub(crate) fn new(
        base_url: impl Into<String>,
        connect_timeout: Duration,
        total_timeout: Duration,
        service_token: Option<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("failed to build response-generator client")?;

        let base_url =
            Url::parse(&base_url.into()).context("invalid response-generator base URL")?;

        Ok(Self {
            client,
            base_url,
            total_timeout,
            service_token,
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.service_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl ResponseGenerator for GatewayGeneratorClient {
    async fn generate(&self, request: &GeneratorRequest) -> Result<GeneratorResponse> {
        let url = self
            .base_url
            .join("v1/responses/generate")
            .context("failed to build generation URL")?;

        debug!(
            request_id = %request.request_id,
            model = %request.model,
            message_count = request.messages.len(),
            defer_memory = request.defer_memory_storage,
            "sending generation request"
        );

        let response = self
            .authorized(self.client.post(url))
            .json(request)
            .header("X-Request-ID", &request.request_id)
            .timeout(self.total_timeout)
            .send()
            .await
            .context("generation request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "generation endpoint returned error status {status}: {}",
                truncate_error_body(&body)
            ));
        }

        response
            .json::<GeneratorResponse>()
            .await
            .context("failed to deserialize generation response")
    }

    async fn store_deferred_memory(
        &self,
        memory: &DeferredMemoryRecord,
        scope: &MemoryScope,
    ) -> Result<()> {
        let url = self
            .base_url
            .join("v1/memories/deferred")
            .context("failed to build deferred-memory URL")?;

        self.authorized(self.client.post(url))
            .json(&serde_json::json!({
                "memory": memory,
                "scope": scope,
            }))
            .timeout(self.total_timeout)
            .send()
            .await
            .context("deferred-memory request failed")?
            .error_for_status()
            .context("deferred-memory endpoint returned error status")?;

        Ok(())
    }
}
