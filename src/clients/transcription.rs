//! Audio transcription service client: bounded download of the audio bytes
//! followed by a multipart upload typed with the attachment's content type.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Url};
use serde::Deserialize;

use super::truncate_error_body;

/// Audio payload ready for the transcription service.
#[derive(Debug, Clone)]
pub(crate) struct AudioUpload {
    pub(crate) bytes: Vec<u8>,
    pub(crate) content_type: String,
    pub(crate) file_name: String,
}

#[async_trait]
pub(crate) trait Transcriber: Send + Sync {
    /// Fetch the audio bytes from the platform CDN. The download has its own
    /// hard timeout independent of the transcription call.
    async fn fetch_audio(&self, url: &str) -> Result<Vec<u8>>;

    async fn transcribe(&self, upload: AudioUpload) -> Result<String>;
}

#[derive(Debug, Clone)]
pub(crate) struct HttpTranscriber {
    client: Client,
    base_url: Url,
    transcription_timeout: Duration,
    download_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl HttpTranscriber {
    pub(crate) fn new(
        base_url: impl Into<String>,
        transcription_timeout: Duration,
        download_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("failed to build transcription client")?;
        let base_url = Url::parse(&base_url.into()).context("invalid transcription base URL")?;

        Ok(Self {
            client,
            base_url,
            transcription_timeout,
            download_timeout,
        })
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn fetch_audio(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .await
            .context("audio download failed")?
            .error_for_status()
            .context("audio download returned error status")?;

        let bytes = response
            .bytes()
            .await
            .context("failed to read audio body")?;

        Ok(bytes.to_vec())
    }

    async fn transcribe(&self, upload: AudioUpload) -> Result<String> {
        let url = self
            .base_url
            .join("v1/audio/transcriptions")
            .context("failed to build transcription URL")?;

        let part = Part::bytes(upload.bytes)
            .file_name(upload.file_name)
            .mime_str(&upload.content_type)
            .context("invalid audio content type")?;
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(url)
            .multipart(form)
            .timeout(self.transcription_timeout)
            .send()
            .await
            .context("transcription request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "transcription endpoint returned error status {status}: {}",
                truncate_error_body(&body)
            ));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .context("failed to deserialize transcription response")?;

        Ok(parsed.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn transcribe_returns_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/transcriptions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"text": "hello from audio"})),
            )
            .mount(&server)
            .await;

        let transcriber =
            HttpTranscriber::new(server.uri(), Duration::from_secs(5), Duration::from_secs(2))
                .expect("transcriber");

        let transcript = transcriber
            .transcribe(AudioUpload {
                bytes: vec![1, 2, 3],
                content_type: "audio/ogg".to_string(),
                file_name: "voice.ogg".to_string(),
            })
            .await
            .expect("transcribe");

        assert_eq!(transcript, "hello from audio");
    }

    #[tokio::test]
    async fn fetch_audio_downloads_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.mp3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9u8, 8, 7]))
            .mount(&server)
            .await;

        let transcriber =
            HttpTranscriber::new(server.uri(), Duration::from_secs(5), Duration::from_secs(2))
                .expect("transcriber");

        let bytes = transcriber
            .fetch_audio(&format!("{}/a.mp3", server.uri()))
            .await
            .expect("fetch");

        assert_eq!(bytes, vec![9, 8, 7]);
    }
}
