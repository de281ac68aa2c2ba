//! Audio transcription child jobs. Transcripts are cached by the
//! attachment's original URL so a re-posted voice message never hits the
//! transcription service twice.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clients::transcription::{AudioUpload, Transcriber};
use crate::delivery::ResultCache;
use crate::delivery::cache::transcript_key;
use crate::queue::{CacheWrite, HandlerOutcome, Job, JobHandler};
use crate::request::AudioJobPayload;
use crate::schema::jobs::AUDIO_JOB_SCHEMA;
use crate::schema::validate_json;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AudioJobOutput {
    pub(crate) success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) content: Option<String>,
    pub(crate) attachment_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) attachment_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) source_reference_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
}

pub(crate) struct AudioDescriber {
    transcriber: Arc<dyn Transcriber>,
    cache: ResultCache,
    result_ttl: Duration,
    transcript_ttl: Duration,
}

impl AudioDescriber {
    pub(crate) fn new(
        transcriber: Arc<dyn Transcriber>,
        cache: ResultCache,
        result_ttl: Duration,
        transcript_ttl: Duration,
    ) -> Self {
        Self {
            transcriber,
            cache,
            result_ttl,
            transcript_ttl,
        }
    }

    async fn transcribe(&self, payload: &AudioJobPayload) -> Result<String> {
        // Cached transcript short-circuits the download and the service call.
        if let Some(original_url) = &payload.attachment.original_url {
            if let Ok(Some(cached)) = self.cache.get(&transcript_key(original_url)).await {
                if let Some(transcript) = cached.as_str() {
                    info!(
                        request_id = %payload.request_id,
                        "transcript cache hit, skipping transcription"
                    );
                    return Ok(transcript.to_string());
                }
            }
        }

        let bytes = self
            .transcriber
            .fetch_audio(&payload.attachment.url)
            .await
            .context("failed to download audio attachment")?;

        let file_name = payload
            .attachment
            .name
            .clone()
            .unwrap_or_else(|| "audio".to_string());

        let transcript = self
            .transcriber
            .transcribe(AudioUpload {
                bytes,
                content_type: payload.attachment.content_type.clone(),
                file_name,
            })
            .await
            .context("transcription service call failed")?;

        if let Some(original_url) = &payload.attachment.original_url {
            if let Err(cache_error) = self
                .cache
                .put(
                    &transcript_key(original_url),
                    &json!(transcript),
                    self.transcript_ttl,
                )
                .await
            {
                warn!(error = %cache_error, "failed to cache transcript, continuing");
            }
        }

        Ok(transcript)
    }
}

#[async_trait]
impl JobHandler for AudioDescriber {
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome> {
        let validation = validate_json(&AUDIO_JOB_SCHEMA, &job.payload);
        if !validation.valid {
            anyhow::bail!(
                "audio job payload failed validation: {}",
                validation.errors.join("; ")
            );
        }
        let payload: AudioJobPayload = serde_json::from_value(job.payload.clone())
            .context("failed to parse audio job payload")?;

        let output = match self.transcribe(&payload).await {
            Ok(transcript) => AudioJobOutput {
                success: true,
                content: Some(transcript),
                attachment_url: payload.attachment.url.clone(),
                attachment_name: payload.attachment.name.clone(),
                source_reference_number: payload.source_reference_number,
                error: None,
            },
            Err(transcribe_error) => {
                if !job.is_final_attempt() {
                    return Err(transcribe_error);
                }
                warn!(
                    job_id = %job.id,
                    error = %transcribe_error,
                    "transcription exhausted its attempts, emitting soft failure"
                );
                AudioJobOutput {
                    success: false,
                    content: None,
                    attachment_url: payload.attachment.url.clone(),
                    attachment_name: payload.attachment.name.clone(),
                    source_reference_number: payload.source_reference_number,
                    error: Some(transcribe_error.to_string()),
                }
            }
        };

        let result = serde_json::to_value(&output).context("failed to serialize audio output")?;

        Ok(HandlerOutcome {
            request_id: payload.request_id,
            result: result.clone(),
            cache_write: Some(CacheWrite {
                key: crate::delivery::job_result_key(&job.id),
                payload: result,
                ttl: self.result_ttl,
            }),
            delivery: None,
        })
    }
}
