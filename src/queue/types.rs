use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Job identifier. Prefixed per type and per request so one request's jobs
/// share an identifier prefix (`gen:r1`, `audio:r1-audio-0`, `image:r1-image`).
pub(crate) type JobId = String;

/// Routable job type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum JobType {
    LlmGeneration,
    AudioTranscription,
    ImageDescription,
    ShapesImport,
    ShapesExport,
    PendingMemoryRetry,
}

impl JobType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            JobType::LlmGeneration => "llm_generation",
            JobType::AudioTranscription => "audio_transcription",
            JobType::ImageDescription => "image_description",
            JobType::ShapesImport => "shapes_import",
            JobType::ShapesExport => "shapes_export",
            JobType::PendingMemoryRetry => "pending_memory_retry",
        }
    }

    pub(crate) fn from_str(s: &str) -> Option<Self> {
        match s {
            "llm_generation" => Some(JobType::LlmGeneration),
            "audio_transcription" => Some(JobType::AudioTranscription),
            "image_description" => Some(JobType::ImageDescription),
            "shapes_import" => Some(JobType::ShapesImport),
            "shapes_export" => Some(JobType::ShapesExport),
            "pending_memory_retry" => Some(JobType::PendingMemoryRetry),
            _ => None,
        }
    }
}

/// Queue-visible job state. `Retrying` is transient and internal to the
/// queue; observers only ever see it between an attempt failure and the next
/// dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum JobStatus {
    Queued,
    Active,
    Completed,
    Failed,
    Retrying,
}

impl JobStatus {
    #[allow(dead_code)]
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
        }
    }

    pub(crate) fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "active" => Some(JobStatus::Active),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "retrying" => Some(JobStatus::Retrying),
            _ => None,
        }
    }
}

/// A durable job as read back from the queue.
#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub(crate) id: JobId,
    pub(crate) job_type: JobType,
    #[allow(dead_code)]
    pub(crate) status: JobStatus,
    pub(crate) payload: Value,
    /// Attempts already spent, including the current one once active.
    pub(crate) attempts: i32,
    pub(crate) max_attempts: i32,
    #[allow(dead_code)]
    pub(crate) parent_job_id: Option<JobId>,
    #[allow(dead_code)]
    pub(crate) error_message: Option<String>,
    #[allow(dead_code)]
    pub(crate) created_at: DateTime<Utc>,
    #[allow(dead_code)]
    pub(crate) started_at: Option<DateTime<Utc>>,
    #[allow(dead_code)]
    pub(crate) completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether the current attempt is the last one the queue will grant.
    pub(crate) fn is_final_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// A job to be inserted into the queue.
#[derive(Debug, Clone)]
pub(crate) struct NewJob {
    pub(crate) id: JobId,
    pub(crate) job_type: JobType,
    pub(crate) payload: Value,
    pub(crate) max_attempts: i32,
    pub(crate) parent_job_id: Option<JobId>,
}

impl NewJob {
    pub(crate) fn new(id: impl Into<JobId>, job_type: JobType, payload: Value) -> Self {
        Self {
            id: id.into(),
            job_type,
            payload,
            max_attempts: 3,
            parent_job_id: None,
        }
    }

    pub(crate) fn with_parent(mut self, parent: impl Into<JobId>) -> Self {
        self.parent_job_id = Some(parent.into());
        self
    }

    pub(crate) fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}
