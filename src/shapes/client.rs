//! Cookie-session HTTP client for the shapes service. The service rotates
//! the session cookie on (some) responses; the client tracks the latest
//! value so callers can persist it even when a job fails midway.

use std::sync::Mutex;
use std::time::Duration;

use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::error::ExchangeError;

const SESSION_COOKIE_NAME: &str = "shapes_session";

/// A shape's profile as served by the external service.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ShapesProfile {
    pub(crate) slug: String,
    pub(crate) display_name: String,
    pub(crate) system_prompt: String,
    pub(crate) model: String,
    #[serde(default)]
    pub(crate) vision_model: Option<String>,
    #[serde(default)]
    pub(crate) temperature: Option<f64>,
    #[serde(default)]
    pub(crate) frequency_penalty: Option<f64>,
    #[serde(default)]
    pub(crate) max_tokens: Option<i32>,
    #[serde(default)]
    pub(crate) avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemoriesPage {
    items: Vec<String>,
    #[serde(default)]
    has_more: bool,
}

/// Everything an export serializes.
#[derive(Debug, Clone)]
pub(crate) struct ShapesExportData {
    pub(crate) profile: ShapesProfile,
    pub(crate) memories: Vec<String>,
    pub(crate) stories: Vec<Value>,
    pub(crate) personalization: Value,
}

pub(crate) struct ShapesClient {
    client: Client,
    base_url: Url,
    total_timeout: Duration,
    page_size: usize,
    session_cookie: Mutex<String>,
}

impl ShapesClient {
    pub(crate) fn new(
        base_url: impl Into<String>,
        session_cookie: String,
        connect_timeout: Duration,
        total_timeout: Duration,
        page_size: usize,
    ) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(ExchangeError::Network)?;
        let base_url = Url::parse(&base_url.into())
            .map_err(|parse_error| ExchangeError::Mapping(parse_error.to_string()))?;

        Ok(Self {
            client,
            base_url,
            total_timeout,
            page_size,
            session_cookie: Mutex::new(session_cookie),
        })
    }

    /// Latest session credential, rotated or not. Callers persist this
    /// before returning and before propagating any error.
    pub(crate) fn current_credential(&self) -> String {
        self.session_cookie.lock().unwrap().clone()
    }

    fn cookie_header(&self) -> String {
        format!(
            "{SESSION_COOKIE_NAME}={}",
            self.session_cookie.lock().unwrap()
        )
    }

    fn capture_rotation(&self, response: &reqwest::Response) {
        for header in response.headers().get_all(SET_COOKIE) {
            let Ok(raw) = header.to_str() else { continue };
            let Some(rest) = raw.strip_prefix(&format!("{SESSION_COOKIE_NAME}=")) else {
                continue;
            };
            let value = rest.split(';').next().unwrap_or_default();
            if !value.is_empty() {
                let mut cookie = self.session_cookie.lock().unwrap();
                if *cookie != value {
                    debug!("shapes session cookie rotated");
                    *cookie = value.to_string();
                }
            }
        }
    }

    async fn get_json(&self, path: &str) -> Result<Value, ExchangeError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|join_error| ExchangeError::Mapping(join_error.to_string()))?;

        let response = self
            .client
            .get(url)
            .header(COOKIE, self.cookie_header())
            .timeout(self.total_timeout)
            .send()
            .await?;

        self.capture_rotation(&response);

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(ExchangeError::from_status(status, retry_after));
        }

        response
            .json::<Value>()
            .await
            .map_err(ExchangeError::Network)
    }

    pub(crate) async fn fetch_profile(&self, slug: &str) -> Result<ShapesProfile, ExchangeError> {
        let value = self.get_json(&format!("api/shapes/{slug}/profile")).await?;
        serde_json::from_value(value)
            .map_err(|parse_error| ExchangeError::Mapping(parse_error.to_string()))
    }

    /// Fetch the full memory list, page by page.
    pub(crate) async fn fetch_memories(&self, slug: &str) -> Result<Vec<String>, ExchangeError> {
        let mut memories = Vec::new();
        let mut page = 1usize;

        loop {
            let value = self
                .get_json(&format!(
                    "api/shapes/{slug}/memories?page={page}&pageSize={}",
                    self.page_size
                ))
                .await?;
            let parsed: MemoriesPage = serde_json::from_value(value)
                .map_err(|parse_error| ExchangeError::Mapping(parse_error.to_string()))?;

            memories.extend(parsed.items);
            if !parsed.has_more {
                break;
            }
            page += 1;
        }

        debug!(slug, count = memories.len(), "shapes memories fetched");
        Ok(memories)
    }

    pub(crate) async fn fetch_stories(&self, slug: &str) -> Result<Vec<Value>, ExchangeError> {
        let value = self.get_json(&format!("api/shapes/{slug}/stories")).await?;
        match value {
            Value::Array(stories) => Ok(stories),
            other => Err(ExchangeError::Mapping(format!(
                "expected story array, got {other}"
            ))),
        }
    }

    pub(crate) async fn fetch_user_personalization(
        &self,
        slug: &str,
    ) -> Result<Value, ExchangeError> {
        self.get_json(&format!("api/shapes/{slug}/personalization"))
            .await
    }

    /// Everything an export needs, fetched in sequence.
    pub(crate) async fn fetch_all(&self, slug: &str) -> Result<ShapesExportData, ExchangeError> {
        let profile = self.fetch_profile(slug).await?;
        let memories = self.fetch_memories(slug).await?;
        let stories = self.fetch_stories(slug).await?;
        let personalization = self.fetch_user_personalization(slug).await?;

        Ok(ShapesExportData {
            profile,
            memories,
            stories,
            personalization,
        })
    }

    /// Bounded avatar download. Failures are soft; the import continues
    /// without an avatar.
    pub(crate) async fn download_avatar(
        &self,
        avatar_url: &str,
        max_bytes: u64,
        timeout: Duration,
    ) -> Result<Vec<u8>, ExchangeError> {
        let response = self
            .client
            .get(avatar_url)
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExchangeError::from_status(status, None));
        }

        if let Some(length) = response.content_length() {
            if length > max_bytes {
                return Err(ExchangeError::Mapping(format!(
                    "avatar exceeds size limit: {length} > {max_bytes} bytes"
                )));
            }
        }

        let bytes = response.bytes().await?;
        if bytes.len() as u64 > max_bytes {
            return Err(ExchangeError::Mapping(format!(
                "avatar exceeds size limit: {} > {max_bytes} bytes",
                bytes.len()
            )));
        }

        Ok(bytes.to_vec())
    }
}

impl std::fmt::Debug for ShapesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShapesClient")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> ShapesClient {
        ShapesClient::new(
            server.uri(),
            "initial-session".to_string(),
            Duration::from_secs(1),
            Duration::from_secs(5),
            2,
        )
        .expect("client")
    }

    #[tokio::test]
    async fn profile_fetch_parses_and_rotates_cookie() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/shapes/luna/profile"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "shapes_session=rotated-value; Path=/; HttpOnly")
                    .set_body_json(serde_json::json!({
                        "slug": "luna",
                        "displayName": "Luna",
                        "systemPrompt": "You are Luna.",
                        "model": "anthropic/claude-sonnet-4"
                    })),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let profile = client.fetch_profile("luna").await.expect("profile");

        assert_eq!(profile.display_name, "Luna");
        assert_eq!(client.current_credential(), "rotated-value");
    }

    #[tokio::test]
    async fn rate_limit_maps_to_retryable_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/shapes/luna/profile"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let error = client.fetch_profile("luna").await.expect_err("error");

        assert!(matches!(
            error,
            ExchangeError::RateLimit {
                retry_after: Some(30)
            }
        ));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn memories_follow_pagination() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/shapes/luna/memories"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": ["m1", "m2"],
                "hasMore": true
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/shapes/luna/memories"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": ["m3"],
                "hasMore": false
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let memories = client.fetch_memories("luna").await.expect("memories");

        assert_eq!(memories, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn expired_session_maps_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/shapes/luna/profile"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let error = client.fetch_profile("luna").await.expect_err("error");

        assert!(matches!(error, ExchangeError::Auth));
        assert!(!error.is_retryable());
    }
}
