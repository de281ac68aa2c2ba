//! Embedding service client. Used by the duplicate detector's semantic
//! layer and by memory import tooling; the detector tolerates its absence.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;

#[async_trait]
pub(crate) trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Whether the service is configured and worth calling.
    fn is_ready(&self) -> bool;
}

#[derive(Debug, Clone)]
pub(crate) struct HttpEmbedder {
    client: Client,
    base_url: Url,
    model: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    embeddings: Vec<Vec<f32>>,
}

impl HttpEmbedder {
    pub(crate) fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build embeddings client")?;
        let base_url = Url::parse(&base_url.into()).context("invalid embeddings base URL")?;

        Ok(Self {
            client,
            base_url,
            model: model.into(),
            timeout,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = self
            .base_url
            .join("v1/embeddings")
            .context("failed to build embeddings URL")?;

        let response = self
            .client
            .post(url)
            .json(&json!({"model": self.model, "input": texts}))
            .timeout(self.timeout)
            .send()
            .await
            .context("embeddings request failed")?
            .error_for_status()
            .context("embeddings endpoint returned error status")?;

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .context("failed to deserialize embeddings response")?;

        if parsed.embeddings.len() != texts.len() {
            return Err(anyhow!(
                "embeddings count mismatch: sent {}, got {}",
                texts.len(),
                parsed.embeddings.len()
            ));
        }

        Ok(parsed.embeddings)
    }

    fn is_ready(&self) -> bool {
        true
    }
}

/// Cosine similarity between two vectors; 0.0 when either has zero norm.
#[must_use]
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot_product: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5f32, 0.25, -0.75];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn cosine_handles_zero_norm() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn embed_round_trips_vectors() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [[0.1, 0.2], [0.3, 0.4]]
            })))
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(server.uri(), "test-model", Duration::from_secs(2))
            .expect("embedder");
        let vectors = embedder
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .expect("embed");

        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], vec![0.1, 0.2]);
    }
}
