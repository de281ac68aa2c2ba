//! Vision model client. Descriptions are requested through the generator
//! gateway with a fixed objective prompt; the personality's own prompt rides
//! along as a system message only when the personality allows it.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;

use super::truncate_error_body;

/// Fixed instruction for attachment description. Kept objective so the
/// downstream generator receives neutral text regardless of persona.
pub(crate) const DESCRIPTION_PROMPT: &str =
    "Provide a detailed, objective description of this image. Describe what is visible without interpretation or commentary.";

#[derive(Debug, Clone)]
pub(crate) struct VisionRequest {
    pub(crate) image_url: String,
    pub(crate) model: String,
    pub(crate) system_prompt: Option<String>,
    pub(crate) user_api_key: Option<String>,
}

#[async_trait]
pub(crate) trait VisionModel: Send + Sync {
    async fn describe_image(&self, request: &VisionRequest) -> Result<String>;
}

#[derive(Debug, Clone)]
pub(crate) struct HttpVisionModel {
    client: Client,
    base_url: Url,
    timeout: Duration,
    service_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VisionResponse {
    description: String,
}

impl HttpVisionModel {
    pub(crate) fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        service_token: Option<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("failed to build vision client")?;
        let base_url = Url::parse(&base_url.into()).context("invalid vision base URL")?;

        Ok(Self {
            client,
            base_url,
            timeout,
            service_token,
        })
    }
}

#[async_trait]
impl VisionModel for HttpVisionModel {
    async fn describe_image(&self, request: &VisionRequest) -> Result<String> {
        let url = self
            .base_url
            .join("v1/vision/describe")
            .context("failed to build vision URL")?;

        let mut builder = self.client.post(url).json(&json!({
            "imageUrl": request.image_url,
            "model": request.model,
            "prompt": DESCRIPTION_PROMPT,
            "systemPrompt": request.system_prompt,
            "userApiKey": request.user_api_key,
        }));
        if let Some(token) = &self.service_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .timeout(self.timeout)
            .send()
            .await
            .context("vision request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "vision endpoint returned error status {status}: {}",
                truncate_error_body(&body)
            ));
        }

        let parsed: VisionResponse = response
            .json()
            .await
            .context("failed to deserialize vision response")?;

        Ok(parsed.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn describe_image_sends_model_and_returns_description() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/vision/describe"))
            .and(body_partial_json(
                serde_json::json!({"model": "google/gemini-2.5-flash"}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"description": "A red bicycle against a wall."}),
            ))
            .mount(&server)
            .await;

        let vision = HttpVisionModel::new(server.uri(), Duration::from_secs(5), None)
            .expect("vision client");

        let description = vision
            .describe_image(&VisionRequest {
                image_url: "https://ex/b.png".to_string(),
                model: "google/gemini-2.5-flash".to_string(),
                system_prompt: None,
                user_api_key: None,
            })
            .await
            .expect("describe");

        assert_eq!(description, "A red bicycle against a wall.");
    }
}
