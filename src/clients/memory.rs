//! Vector memory service client: long-term memory storage, scoped search,
//! and the text listing the importer diffs against.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::memory::DeferredMemoryRecord;

use super::truncate_error_body;

/// Search scoped per the persona's sharing flag: `personality_id = None`
/// spans every personality of the persona.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MemorySearch {
    pub(crate) text: String,
    pub(crate) persona_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) personality_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) channel_id: Option<String>,
    pub(crate) limit: usize,
    /// Excludes memories newer than this bound; used to avoid re-retrieving
    /// what is already present in the conversation window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) created_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MemoryHit {
    pub(crate) text: String,
    #[serde(default)]
    pub(crate) score: f32,
}

#[async_trait]
pub(crate) trait VectorMemoryStore: Send + Sync {
    async fn store_memory(&self, record: &DeferredMemoryRecord) -> Result<()>;

    async fn search_memories(&self, search: &MemorySearch) -> Result<Vec<MemoryHit>>;

    /// Every stored memory text for a personality. The importer uses this to
    /// skip entries that already exist.
    async fn list_memory_texts(&self, personality_id: Uuid) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub(crate) struct HttpVectorMemoryStore {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    memories: Vec<MemoryHit>,
}

#[derive(Debug, Deserialize)]
struct TextsResponse {
    texts: Vec<String>,
}

impl HttpVectorMemoryStore {
    pub(crate) fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build vector memory client")?;
        let base_url = Url::parse(&base_url.into()).context("invalid vector memory base URL")?;

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }
}

#[async_trait]
impl VectorMemoryStore for HttpVectorMemoryStore {
    async fn store_memory(&self, record: &DeferredMemoryRecord) -> Result<()> {
        let url = self
            .base_url
            .join("v1/memories")
            .context("failed to build memory store URL")?;

        let response = self
            .client
            .post(url)
            .json(record)
            .timeout(self.timeout)
            .send()
            .await
            .context("memory store request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "memory store endpoint returned error status {status}: {}",
                truncate_error_body(&body)
            ));
        }

        Ok(())
    }

    async fn search_memories(&self, search: &MemorySearch) -> Result<Vec<MemoryHit>> {
        let url = self
            .base_url
            .join("v1/memories/search")
            .context("failed to build memory search URL")?;

        let response = self
            .client
            .post(url)
            .json(search)
            .timeout(self.timeout)
            .send()
            .await
            .context("memory search request failed")?
            .error_for_status()
            .context("memory search endpoint returned error status")?;

        let parsed: SearchResponse = response
            .json()
            .await
            .context("failed to deserialize memory search response")?;

        Ok(parsed.memories)
    }

    async fn list_memory_texts(&self, personality_id: Uuid) -> Result<Vec<String>> {
        let url = self
            .base_url
            .join(&format!("v1/memories/texts/{personality_id}"))
            .context("failed to build memory texts URL")?;

        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .context("memory texts request failed")?
            .error_for_status()
            .context("memory texts endpoint returned error status")?;

        let parsed: TextsResponse = response
            .json()
            .await
            .context("failed to deserialize memory texts response")?;

        Ok(parsed.texts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn search_parses_hits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/memories/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "memories": [{"text": "likes tea", "score": 0.87}]
            })))
            .mount(&server)
            .await;

        let store =
            HttpVectorMemoryStore::new(server.uri(), Duration::from_secs(2)).expect("store");

        let hits = store
            .search_memories(&MemorySearch {
                text: "tea".to_string(),
                persona_id: Uuid::new_v4(),
                personality_id: None,
                channel_id: None,
                limit: 5,
                created_before: None,
            })
            .await
            .expect("search");

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "likes tea");
    }
}
