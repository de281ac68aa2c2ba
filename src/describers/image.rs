//! Image description child jobs. One job carries every image from its
//! source message; images are described in parallel with bounded per-image
//! retries, and an exhausted image degrades to a fallback description
//! rather than failing the flow.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clients::vision::{VisionModel, VisionRequest};
use crate::queue::{CacheWrite, HandlerOutcome, Job, JobHandler};
use crate::request::{Attachment, ImageJobPayload};
use crate::schema::jobs::IMAGE_JOB_SCHEMA;
use crate::schema::validate_json;
use crate::store::dao::PersonalityDao;
use crate::store::models::PersonalityRecord;
use crate::util::retry::RetryConfig;

const FALLBACK_DESCRIPTION: &str = "[image could not be described]";
const IMAGE_CONCURRENCY: usize = 4;

/// Model-name fragments treated as vision-capable when a personality has no
/// dedicated vision model configured.
const VISION_CAPABLE_HINTS: [&str; 4] = ["vision", "gemini", "gpt-4o", "claude"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ImageDescriptionItem {
    pub(crate) url: String,
    pub(crate) description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ImageJobOutput {
    pub(crate) success: bool,
    pub(crate) descriptions: Vec<ImageDescriptionItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) source_reference_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
}

pub(crate) struct ImageDescriber {
    vision: Arc<dyn VisionModel>,
    dao: Arc<dyn PersonalityDao>,
    fallback_model: String,
    retry: RetryConfig,
    result_ttl: Duration,
}

impl ImageDescriber {
    pub(crate) fn new(
        vision: Arc<dyn VisionModel>,
        dao: Arc<dyn PersonalityDao>,
        fallback_model: String,
        retry: RetryConfig,
        result_ttl: Duration,
    ) -> Self {
        Self {
            vision,
            dao,
            fallback_model,
            retry,
            result_ttl,
        }
    }

    /// Vision model priority chain: the personality's dedicated vision
    /// model, then its main model when vision-capable, then the configured
    /// fallback.
    pub(crate) fn select_vision_model(&self, personality: Option<&PersonalityRecord>) -> String {
        if let Some(personality) = personality {
            if let Some(vision_model) = &personality.vision_model {
                return vision_model.clone();
            }
            if model_is_vision_capable(&personality.model) {
                return personality.model.clone();
            }
        }
        self.fallback_model.clone()
    }

    async fn describe_one(
        &self,
        attachment: &Attachment,
        model: &str,
        system_prompt: Option<&str>,
        api_key: Option<&str>,
    ) -> (ImageDescriptionItem, bool) {
        for attempt in 0..self.retry.max_attempts {
            let delay = self.retry.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let request = VisionRequest {
                image_url: attachment.url.clone(),
                model: model.to_string(),
                system_prompt: system_prompt.map(ToString::to_string),
                user_api_key: api_key.map(ToString::to_string),
            };

            match self.vision.describe_image(&request).await {
                Ok(description) => {
                    debug!(url = %attachment.url, attempt, "image described");
                    return (
                        ImageDescriptionItem {
                            url: attachment.url.clone(),
                            description,
                        },
                        true,
                    );
                }
                Err(describe_error) => {
                    warn!(
                        url = %attachment.url,
                        attempt,
                        error = %describe_error,
                        "image description attempt failed"
                    );
                }
            }
        }

        (
            ImageDescriptionItem {
                url: attachment.url.clone(),
                description: FALLBACK_DESCRIPTION.to_string(),
            },
            false,
        )
    }

    pub(crate) async fn describe_batch(
        &self,
        attachments: &[Attachment],
        personality: Option<&PersonalityRecord>,
        api_key: Option<&str>,
    ) -> ImageJobOutput {
        let model = self.select_vision_model(personality);
        let system_prompt = personality
            .filter(|p| p.include_prompt_in_vision)
            .map(|p| p.system_prompt.as_str());

        let futures: Vec<_> = attachments
            .iter()
            .map(|attachment| {
                let model = &model;
                Box::pin(async move { self.describe_one(attachment, model, system_prompt, api_key).await })
                    as std::pin::Pin<Box<dyn std::future::Future<Output = (ImageDescriptionItem, bool)> + Send + '_>>
            })
            .collect();

        let results: Vec<(ImageDescriptionItem, bool)> = stream::iter(futures)
            .buffered(IMAGE_CONCURRENCY)
            .collect()
            .await;

        let all_ok = results.iter().all(|(_, ok)| *ok);
        let descriptions = results.into_iter().map(|(item, _)| item).collect();

        ImageJobOutput {
            success: all_ok,
            descriptions,
            source_reference_number: None,
            error: if all_ok {
                None
            } else {
                Some("one or more images fell back to a placeholder description".to_string())
            },
        }
    }
}

fn model_is_vision_capable(model: &str) -> bool {
    let lowered = model.to_lowercase();
    VISION_CAPABLE_HINTS.iter().any(|hint| lowered.contains(hint))
}

#[async_trait]
impl JobHandler for ImageDescriber {
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome> {
        let validation = validate_json(&IMAGE_JOB_SCHEMA, &job.payload);
        if !validation.valid {
            anyhow::bail!(
                "image job payload failed validation: {}",
                validation.errors.join("; ")
            );
        }
        let payload: ImageJobPayload = serde_json::from_value(job.payload.clone())
            .context("failed to parse image job payload")?;

        let personality = self
            .dao
            .personality_by_slug(&payload.personality)
            .await
            .unwrap_or_else(|lookup_error| {
                warn!(
                    slug = %payload.personality,
                    error = %lookup_error,
                    "personality lookup failed, using fallback vision model"
                );
                None
            });

        let mut output = self
            .describe_batch(
                &payload.attachments,
                personality.as_ref(),
                payload.user_api_key.as_deref(),
            )
            .await;
        output.source_reference_number = payload.source_reference_number;

        let result = serde_json::to_value(&output).context("failed to serialize image output")?;

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
