//! Job-chain orchestrator: turns an accepted AI request into a durable flow
//! on the queue. Fan-out happens here, at ingress, so the queue itself
//! enforces parent-after-children ordering and the describers run with free
//! parallelism.

use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::info;

use crate::delivery::job_result_key;
use crate::observability::metrics::Metrics;
use crate::queue::{JobId, JobQueue, JobType, NewJob};
use crate::request::{
    AiRequest, Attachment, AudioJobPayload, ChildJobType, GenerationJobPayload, ImageJobPayload,
    JobDependency, MediaKind,
};
use crate::schema::jobs::{AUDIO_JOB_SCHEMA, GENERATION_JOB_SCHEMA, IMAGE_JOB_SCHEMA};
use crate::schema::validate_json;

pub(crate) struct JobChainOrchestrator {
    queue: Arc<JobQueue>,
    metrics: Arc<Metrics>,
    max_attempts: i32,
}

impl JobChainOrchestrator {
    pub(crate) fn new(queue: Arc<JobQueue>, metrics: Arc<Metrics>, max_attempts: i32) -> Self {
        Self {
            queue,
            metrics,
            max_attempts,
        }
    }

    /// Validate, build, and atomically submit the flow for a request.
    /// Returns the parent job id. Any child failing schema validation
    /// rejects the whole flow before submission.
    pub(crate) async fn submit(&self, request: AiRequest) -> Result<JobId> {
        let (parent, children) = build_flow(&request, self.max_attempts)?;
        let child_count = children.len();

        let parent_id = self.queue.submit_flow(parent, children).await?;
        self.metrics.flows_submitted.inc();

        info!(
            job_id = %parent_id,
            request_id = %request.request_id,
            children = child_count,
            "job flow submitted"
        );

        Ok(parent_id)
    }
}

/// Build the flow for a request: audio children (one per attachment), a
/// single batched image child per source message, repeated for every
/// referenced message with its 1-based reference tag, and one generation
/// parent carrying the dependency list.
pub(crate) fn build_flow(request: &AiRequest, max_attempts: i32) -> Result<(NewJob, Vec<NewJob>)> {
    let parent_id = format!("gen:{}", request.request_id);
    let mut children: Vec<NewJob> = Vec::new();
    let mut dependencies: Vec<JobDependency> = Vec::new();

    let add_group = |attachments: &[Attachment],
                         reference: Option<u32>,
                         children: &mut Vec<NewJob>,
                         dependencies: &mut Vec<JobDependency>|
     -> Result<()> {
        let infix = reference.map_or(String::new(), |n| format!("-ref{n}"));

        let audio: Vec<&Attachment> = attachments
            .iter()
            .filter(|a| a.media_kind() == Some(MediaKind::Audio))
            .collect();
        let images: Vec<Attachment> = attachments
            .iter()
            .filter(|a| a.media_kind() == Some(MediaKind::Image))
            .cloned()
            .collect();

        for (index, attachment) in audio.iter().enumerate() {
            let child_id = format!("audio:{}{infix}-audio-{index}", request.request_id);
            let payload = AudioJobPayload {
                request_id: format!("{}{infix}-audio-{index}", request.request_id),
                attachment: (*attachment).clone(),
                user_id: request.context.user_id.clone(),
                channel_id: request.context.channel_id.clone(),
                source_reference_number: reference,
            };
            let payload_json = serde_json::to_value(&payload)?;
            let validation = validate_json(&AUDIO_JOB_SCHEMA, &payload_json);
            if !validation.valid {
                bail!(
                    "audio child payload rejected: {}",
                    validation.errors.join("; ")
                );
            }

            dependencies.push(JobDependency {
                child_job_id: child_id.clone(),
                child_type: ChildJobType::AudioTranscription,
                result_key: job_result_key(&child_id),
            });
            children.push(
                NewJob::new(child_id, JobType::AudioTranscription, payload_json)
                    .with_parent(&parent_id)
                    .with_max_attempts(max_attempts),
            );
        }

        if !images.is_empty() {
            // Batched by design: one child carries the whole image list.
            let child_id = format!("image:{}{infix}-image", request.request_id);
            let payload = ImageJobPayload {
                request_id: format!("{}{infix}-image", request.request_id),
                attachments: images,
                personality: request.personality.clone(),
                user_id: request.context.user_id.clone(),
                user_api_key: request.user_api_key.clone(),
                source_reference_number: reference,
            };
            let payload_json = serde_json::to_value(&payload)?;
            let validation = validate_json(&IMAGE_JOB_SCHEMA, &payload_json);
            if !validation.valid {
                bail!(
                    "image child payload rejected: {}",
                    validation.errors.join("; ")
                );
            }

            dependencies.push(JobDependency {
                child_job_id: child_id.clone(),
                child_type: ChildJobType::ImageDescription,
                result_key: job_result_key(&child_id),
            });
            children.push(
                NewJob::new(child_id, JobType::ImageDescription, payload_json)
                    .with_parent(&parent_id)
                    .with_max_attempts(max_attempts),
            );
        }

        Ok(())
    };

    add_group(
        &request.context.attachments,
        None,
        &mut children,
        &mut dependencies,
    )?;
    for referenced in &request.context.referenced_messages {
        add_group(
            &referenced.attachments,
            Some(referenced.reference_number),
            &mut children,
            &mut dependencies,
        )?;
    }

    let parent_payload = GenerationJobPayload {
        request_id: request.request_id.clone(),
        personality: request.personality.clone(),
        message: request.message.clone(),
        context: request.context.clone(),
        response_destination: request.response_destination.clone(),
        user_api_key: request.user_api_key.clone(),
        dependencies,
    };
    let parent_json = serde_json::to_value(&parent_payload)?;
    let validation = validate_json(&GENERATION_JOB_SCHEMA, &parent_json);
    if !validation.valid {
        bail!(
            "generation payload rejected: {}",
            validation.errors.join("; ")
        );
    }

    let parent = NewJob::new(parent_id, JobType::LlmGeneration, parent_json)
        .with_max_attempts(max_attempts);

    Ok((parent, children))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ReferencedMessage, RequestContext, ResponseDestination};

    fn attachment(url: &str, content_type: &str) -> Attachment {
        Attachment {
            url: url.to_string(),
            original_url: None,
            content_type: content_type.to_string(),
            name: None,
            size: None,
            is_voice_message: None,
            duration_seconds: None,
        }
    }

    fn request(request_id: &str, attachments: Vec<Attachment>) -> AiRequest {
        AiRequest {
            request_id: request_id.to_string(),
            personality: "test-bot".to_string(),
            message: "Hello".to_string(),
            context: RequestContext {
                user_id: "u1".to_string(),
                attachments,
                ..RequestContext::default()
            },
            response_destination: ResponseDestination {
                kind: "discord".to_string(),
                channel_id: "c1".to_string(),
            },
            user_api_key: None,
        }
    }

    #[test]
    fn no_attachments_builds_a_bare_parent() {
        let (parent, children) = build_flow(&request("r1", vec![]), 3).expect("flow");

        assert_eq!(parent.id, "gen:r1");
        assert!(children.is_empty());

        let payload: GenerationJobPayload =
            serde_json::from_value(parent.payload).expect("payload");
        assert!(payload.dependencies.is_empty());
    }

    #[test]
    fn one_audio_and_one_image_fan_out_into_two_children() {
        let (parent, children) = build_flow(
            &request(
                "r2",
                vec![
                    attachment("https://ex/a.mp3", "audio/mpeg"),
                    attachment("https://ex/b.png", "image/png"),
                ],
            ),
            3,
        )
        .expect("flow");

        assert_eq!(children.len(), 2);
        assert_eq!(children[0].id, "audio:r2-audio-0");
        assert_eq!(children[1].id, "image:r2-image");
        assert!(children
            .iter()
            .all(|child| child.parent_job_id.as_deref() == Some("gen:r2")));

        let payload: GenerationJobPayload =
            serde_json::from_value(parent.payload).expect("payload");
        assert_eq!(payload.dependencies.len(), 2);
        assert_eq!(
            payload.dependencies[0].result_key,
            "job-result:audio:r2-audio-0"
        );
        assert_eq!(
            payload.dependencies[1].result_key,
            "job-result:image:r2-image"
        );
    }

    #[test]
    fn images_are_batched_into_a_single_child() {
        let (_, children) = build_flow(
            &request(
                "r3",
                vec![
                    attachment("https://ex/a.png", "image/png"),
                    attachment("https://ex/b.jpg", "image/jpeg"),
                    attachment("https://ex/c.webp", "image/webp"),
                ],
            ),
            3,
        )
        .expect("flow");

        assert_eq!(children.len(), 1);
        let payload: ImageJobPayload =
            serde_json::from_value(children[0].payload.clone()).expect("payload");
        assert_eq!(payload.attachments.len(), 3);
    }

    #[test]
    fn other_content_types_are_discarded() {
        let (_, children) = build_flow(
            &request("r4", vec![attachment("https://ex/doc.pdf", "application/pdf")]),
            3,
        )
        .expect("flow");

        assert!(children.is_empty());
    }

    #[test]
    fn voice_message_flag_routes_to_audio() {
        let mut voice = attachment("https://ex/v.bin", "application/octet-stream");
        voice.is_voice_message = Some(true);

        let (_, children) = build_flow(&request("r5", vec![voice]), 3).expect("flow");

        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "audio:r5-audio-0");
    }

    #[test]
    fn referenced_messages_get_tagged_children_that_never_merge() {
        let mut req = request("r6", vec![attachment("https://ex/direct.png", "image/png")]);
        req.context.referenced_messages = vec![ReferencedMessage {
            reference_number: 1,
            author_name: None,
            content: "quoted".to_string(),
            attachments: vec![
                attachment("https://ex/q.ogg", "audio/ogg"),
                attachment("https://ex/q.png", "image/png"),
            ],
        }];

        let (parent, children) = build_flow(&req, 3).expect("flow");

        let ids: Vec<&str> = children.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["image:r6-image", "audio:r6-ref1-audio-0", "image:r6-ref1-image"]
        );

        let audio_payload: AudioJobPayload =
            serde_json::from_value(children[1].payload.clone()).expect("payload");
        assert_eq!(audio_payload.source_reference_number, Some(1));

        let payload: GenerationJobPayload =
            serde_json::from_value(parent.payload).expect("payload");
        assert_eq!(payload.dependencies.len(), 3);
    }

    #[test]
    fn invalid_child_payload_rejects_the_whole_flow() {
        // An empty attachment URL violates the audio child schema.
        let bad = Attachment {
            url: String::new(),
            original_url: None,
            content_type: "audio/mpeg".to_string(),
            name: None,
            size: None,
            is_voice_message: None,
            duration_seconds: None,
        };

        let error = build_flow(&request("r7", vec![bad]), 3).expect_err("rejected");
        assert!(error.to_string().contains("audio child payload rejected"));
    }
}
