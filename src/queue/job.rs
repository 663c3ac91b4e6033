use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;
use crate::eid::Eid;
use crate::queue::QueueError;

/// Opaque key/value bag stored with a job; the typed view is [`Task`].
pub type Payload = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ExtractMetadata,
}

impl JobKind {
    pub const ALL: &'static [JobKind] = &[JobKind::ExtractMetadata];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ExtractMetadata => "extract_metadata",
        }
    }
}

impl Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Eid,
    pub kind: JobKind,
    pub payload: Payload,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Where a failed job went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retry { at: DateTime<Utc> },
    DeadLettered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    /// `min(initial * 2^(attempt-1), cap)`; attempt 1 waits `initial`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exp)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

impl From<&QueueConfig> for BackoffPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            initial: Duration::from_secs(config.initial_backoff_secs),
            cap: Duration::from_secs(config.max_backoff_secs),
        }
    }
}

impl Job {
    pub fn new(kind: JobKind, payload: Payload, max_retries: u32) -> Self {
        Self {
            id: Eid::new(),
            kind,
            payload,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            updated_at: None,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            last_error: None,
        }
    }

    fn expect_status(&self, expected: JobStatus, action: &'static str) -> Result<(), QueueError> {
        if self.status != expected {
            return Err(QueueError::InvalidState {
                id: self.id.clone(),
                status: self.status,
                action,
            });
        }
        Ok(())
    }

    /// pending -> processing
    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.expect_status(JobStatus::Pending, "claim")?;
        self.status = JobStatus::Processing;
        self.next_retry_at = None;
        self.updated_at = Some(now);
        Ok(())
    }

    /// processing -> completed
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.expect_status(JobStatus::Processing, "complete")?;
        self.status = JobStatus::Completed;
        self.updated_at = Some(now);
        Ok(())
    }

    /// processing -> pending (scheduled retry) or failed (dead-letter).
    pub fn fail(
        &mut self,
        now: DateTime<Utc>,
        error: &str,
        policy: &BackoffPolicy,
    ) -> Result<FailOutcome, QueueError> {
        self.expect_status(JobStatus::Processing, "fail")?;

        self.retry_count += 1;
        self.last_error = Some(error.to_string());
        self.updated_at = Some(now);

        if self.retry_count <= self.max_retries {
            let backoff = policy.backoff_for(self.retry_count);
            let at = now
                + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());
            self.status = JobStatus::Pending;
            self.next_retry_at = Some(at);
            Ok(FailOutcome::Retry { at })
        } else {
            self.status = JobStatus::Failed;
            self.next_retry_at = None;
            Ok(FailOutcome::DeadLettered)
        }
    }

    /// processing -> failed, skipping the retry budget.
    pub fn bury(&mut self, now: DateTime<Utc>, reason: &str) -> Result<(), QueueError> {
        self.expect_status(JobStatus::Processing, "bury")?;
        self.status = JobStatus::Failed;
        self.last_error = Some(reason.to_string());
        self.next_retry_at = None;
        self.updated_at = Some(now);
        Ok(())
    }

    /// processing -> pending, for jobs whose consumer went away. A job that
    /// was popped but never claimed is still pending and only gets touched.
    pub fn release(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        if self.status.is_terminal() {
            return Err(QueueError::InvalidState {
                id: self.id.clone(),
                status: self.status,
                action: "release",
            });
        }
        self.status = JobStatus::Pending;
        self.updated_at = Some(now);
        Ok(())
    }

    /// True when the job is unfinished and untouched since before `cutoff`.
    /// Only asked of ids sitting in a processing list, where a pending status
    /// means the consumer died between the pop and its claim write.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.updated_at.unwrap_or(self.created_at) < cutoff
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractMetadata {
    pub item_id: Eid,
    pub url: String,
    pub platform: String,
    #[serde(default)]
    pub server_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

/// Typed job payloads, one variant per [`JobKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    ExtractMetadata(ExtractMetadata),
}

impl Task {
    pub fn kind(&self) -> JobKind {
        match self {
            Task::ExtractMetadata(_) => JobKind::ExtractMetadata,
        }
    }

    pub fn payload(&self) -> Result<Payload, QueueError> {
        let value = match self {
            Task::ExtractMetadata(p) => serde_json::to_value(p),
        }
        .map_err(|e| QueueError::InvalidPayload {
            id: None,
            reason: e.to_string(),
        })?;

        match value {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(QueueError::InvalidPayload {
                id: None,
                reason: "payload is not an object".into(),
            }),
        }
    }

    /// Decodes and validates the payload of a dequeued job.
    pub fn from_job(job: &Job) -> Result<Task, QueueError> {
        let invalid = |reason: String| QueueError::InvalidPayload {
            id: Some(job.id.clone()),
            reason,
        };

        match job.kind {
            JobKind::ExtractMetadata => {
                let p: ExtractMetadata =
                    serde_json::from_value(serde_json::Value::Object(job.payload.clone()))
                        .map_err(|e| invalid(e.to_string()))?;

                if p.item_id.is_empty() {
                    return Err(invalid("empty item_id".into()));
                }
                url::Url::parse(&p.url).map_err(|e| invalid(format!("url {}: {e}", p.url)))?;

                Ok(Task::ExtractMetadata(p))
            }
        }
    }
}
