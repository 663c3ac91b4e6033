//! Durable at-least-once job queue.
//!
//! A job id lives in exactly one of four places per kind: the pending list,
//! the processing list, the retry schedule or the dead-letter list. Dequeue
//! moves an id from pending to processing in one step, so a consumer that
//! dies mid-job leaves the id recoverable with [`JobQueue::recover_stale`].

pub mod job;
pub mod memory;
pub mod redis_queue;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eid::Eid;
pub use job::{BackoffPolicy, FailOutcome, Job, JobKind, JobStatus, Payload, Task};

pub const QUEUE_PREFIX: &str = "queue:";
pub const JOB_PREFIX: &str = "job:";
pub const PROCESSING_PREFIX: &str = "processing:";
pub const RETRY_PREFIX: &str = "retry:";
pub const DEAD_PREFIX: &str = "dead:";
pub const STATS_PREFIX: &str = "stats:";

pub fn pending_key(kind: JobKind) -> String {
    format!("{QUEUE_PREFIX}{kind}")
}

pub fn processing_key(kind: JobKind) -> String {
    format!("{PROCESSING_PREFIX}{kind}")
}

pub fn retry_key(kind: JobKind) -> String {
    format!("{RETRY_PREFIX}{kind}")
}

pub fn dead_key(kind: JobKind) -> String {
    format!("{DEAD_PREFIX}{kind}")
}

pub fn stats_key(kind: JobKind) -> String {
    format!("{STATS_PREFIX}{kind}")
}

pub fn job_key(id: &Eid) -> String {
    format!("{JOB_PREFIX}{id}")
}

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("job {0} not found")]
    NotFound(Eid),

    #[error("job {id} has corrupt data: {reason}")]
    Corrupt { id: Eid, reason: String },

    #[error("invalid job payload{}: {reason}", id.as_ref().map(|id| format!(" for {id}")).unwrap_or_default())]
    InvalidPayload { id: Option<Eid>, reason: String },

    #[error("job {id} is {status}, cannot {action}")]
    InvalidState {
        id: Eid,
        status: JobStatus,
        action: &'static str,
    },
}

/// Counters maintained with atomic increments plus the live structure sizes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_enqueued: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub current_pending: u64,
    pub current_processing: u64,
    pub current_retrying: u64,
    pub current_dead: u64,
}

pub trait JobQueue: Send + Sync {
    /// Stores a new pending job and appends it to the kind's pending list.
    fn enqueue(&self, kind: JobKind, payload: Payload) -> Result<Eid, QueueError>;

    /// Moves the oldest pending job to processing, waiting up to `wait` for
    /// one to appear. `Ok(None)` when nothing arrived in time.
    fn dequeue(&self, kind: JobKind, wait: Duration) -> Result<Option<Job>, QueueError>;

    fn complete(&self, id: &Eid) -> Result<(), QueueError>;

    /// Schedules a retry with backoff, or dead-letters once the budget is spent.
    fn fail(&self, id: &Eid, error: &str) -> Result<FailOutcome, QueueError>;

    /// Dead-letters a processing job right away; for jobs that can never succeed.
    fn bury(&self, id: &Eid, reason: &str) -> Result<(), QueueError>;

    fn get(&self, id: &Eid) -> Result<Job, QueueError>;

    fn pending_count(&self, kind: JobKind) -> Result<usize, QueueError>;

    fn stats(&self, kind: JobKind) -> Result<QueueStats, QueueError>;

    /// Most recently dead-lettered jobs first.
    fn dead_letters(&self, kind: JobKind, limit: usize) -> Result<Vec<Job>, QueueError>;

    /// Moves every retry entry due at `now` back onto the pending list.
    fn promote_due(&self, kind: JobKind, now: DateTime<Utc>) -> Result<usize, QueueError>;

    /// Returns processing jobs claimed longer than `older_than` ago to pending.
    fn recover_stale(&self, kind: JobKind, older_than: Duration) -> Result<usize, QueueError>;

    fn submit(&self, task: &Task) -> Result<Eid, QueueError> {
        self.enqueue(task.kind(), task.payload()?)
    }
}

pub(crate) fn stale_cutoff(older_than: Duration) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero())
}
