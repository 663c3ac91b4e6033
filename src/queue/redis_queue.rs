use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use redis::{Connection, RedisError, Script};

use crate::config::QueueConfig;
use crate::eid::Eid;
use crate::queue::{
    dead_key, job_key, pending_key, processing_key, retry_key, stale_cutoff, stats_key,
    BackoffPolicy, FailOutcome, Job, JobKind, JobQueue, Payload, QueueError, QueueStats,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Moves every due retry entry to the pending list in one server-side step.
static PROMOTE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(ids) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('LPUSH', KEYS[2], id)
end
if #ids > 0 then
    redis.call('HINCRBY', KEYS[3], 'pending', #ids)
end
return #ids
",
    )
});

/// Writes the claim of a popped id, unless stale recovery already took it
/// back (the stored record no longer matches what the consumer read).
static CLAIM_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
if redis.call('HGET', KEYS[1], 'data') ~= ARGV[1] then
    return 0
end
redis.call('HSET', KEYS[1], 'data', ARGV[2], 'status', 'processing', 'updated_at', ARGV[3])
redis.call('HINCRBY', KEYS[2], 'pending', -1)
redis.call('HINCRBY', KEYS[2], 'processing', 1)
return 1
",
    )
});

/// Requeues one id from the processing list, unless its record changed since
/// it was judged stale. Counters only move for ids whose claim had landed.
static REQUEUE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
if redis.call('HGET', KEYS[3], 'data') ~= ARGV[4] then
    return 0
end
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
    return 0
end
local claimed = redis.call('HGET', KEYS[3], 'status') == 'processing'
redis.call('LPUSH', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[3], 'data', ARGV[2], 'status', 'pending', 'updated_at', ARGV[3])
if claimed then
    redis.call('HINCRBY', KEYS[4], 'processing', -1)
    redis.call('HINCRBY', KEYS[4], 'pending', 1)
end
return 1
",
    )
});

impl From<RedisError> for QueueError {
    fn from(err: RedisError) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

/// Queue backed by Redis lists, hashes and sorted sets.
///
/// Layout per kind: `queue:{kind}` pending list, `processing:{kind}` claimed
/// ids, `retry:{kind}` sorted set scored by due time in ms, `dead:{kind}`
/// dead-letter list, `stats:{kind}` counters. Each job is a hash at
/// `job:{id}` holding the JSON record under `data`.
pub struct RedisQueue {
    client: redis::Client,
    idle: Mutex<Vec<Connection>>,
    config: QueueConfig,
    policy: BackoffPolicy,
}

impl RedisQueue {
    pub fn connect(redis_url: &str, config: &QueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let queue = Self {
            client,
            idle: Mutex::new(Vec::new()),
            config: config.clone(),
            policy: BackoffPolicy::from(config),
        };

        queue.with_conn(|con| redis::cmd("PING").query::<String>(con))?;
        log::info!("connected to redis");

        Ok(queue)
    }

    /// Runs `f` on a pooled connection. Connections that saw an I/O error
    /// are discarded instead of returned.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> redis::RedisResult<T>,
    ) -> Result<T, QueueError> {
        let pooled = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop();
        let mut con = match pooled {
            Some(con) => con,
            None => self.client.get_connection_with_timeout(CONNECT_TIMEOUT)?,
        };

        match f(&mut con) {
            Ok(v) => {
                self.idle.lock().unwrap_or_else(|e| e.into_inner()).push(con);
                Ok(v)
            }
            Err(e) => {
                if !(e.is_io_error() || e.is_connection_dropped() || e.is_timeout()) {
                    self.idle.lock().unwrap_or_else(|e| e.into_inner()).push(con);
                }
                Err(e.into())
            }
        }
    }

    fn load(&self, id: &Eid) -> Result<Job, QueueError> {
        self.load_raw(id).map(|(job, _)| job)
    }

    /// The decoded job plus the stored record, for compare-and-set scripts.
    fn load_raw(&self, id: &Eid) -> Result<(Job, String), QueueError> {
        let data: Option<String> =
            self.with_conn(|con| redis::cmd("HGET").arg(job_key(id)).arg("data").query(con))?;
        let data = data.ok_or_else(|| QueueError::NotFound(id.clone()))?;
        Ok((decode(id, &data)?, data))
    }
}

fn decode(id: &Eid, data: &str) -> Result<Job, QueueError> {
    serde_json::from_str(data).map_err(|e| QueueError::Corrupt {
        id: id.clone(),
        reason: e.to_string(),
    })
}

fn encode(job: &Job) -> Result<String, QueueError> {
    serde_json::to_string(job).map_err(|e| QueueError::Corrupt {
        id: job.id.clone(),
        reason: e.to_string(),
    })
}

impl JobQueue for RedisQueue {
    fn enqueue(&self, kind: JobKind, payload: Payload) -> Result<Eid, QueueError> {
        let job = Job::new(kind, payload, self.config.max_retries);
        let data = encode(&job)?;
        let key = job_key(&job.id);
        let stats = stats_key(kind);

        self.with_conn(|con| {
            redis::pipe()
                .atomic()
                .cmd("HSET")
                .arg(&key)
                .arg("data")
                .arg(&data)
                .arg("status")
                .arg(job.status.as_str())
                .arg("type")
                .arg(kind.as_str())
                .arg("created_at")
                .arg(job.created_at.timestamp())
                .arg("retry_count")
                .arg(job.retry_count)
                .ignore()
                .cmd("EXPIRE")
                .arg(&key)
                .arg(self.config.job_ttl_secs)
                .ignore()
                .cmd("LPUSH")
                .arg(pending_key(kind))
                .arg(job.id.as_str())
                .ignore()
                .cmd("HINCRBY")
                .arg(&stats)
                .arg("total_enqueued")
                .arg(1)
                .ignore()
                .cmd("HINCRBY")
                .arg(&stats)
                .arg("pending")
                .arg(1)
                .ignore()
                .query::<()>(con)
        })?;

        log::info!(
            "job enqueued job_id={} kind={kind} payload_size={}",
            job.id,
            data.len()
        );
        Ok(job.id)
    }

    fn dequeue(&self, kind: JobKind, wait: Duration) -> Result<Option<Job>, QueueError> {
        let pending = pending_key(kind);
        let processing = processing_key(kind);

        let popped: Option<String> = self.with_conn(|con| {
            if wait.is_zero() {
                redis::cmd("RPOPLPUSH")
                    .arg(&pending)
                    .arg(&processing)
                    .query(con)
            } else {
                redis::cmd("BRPOPLPUSH")
                    .arg(&pending)
                    .arg(&processing)
                    .arg(wait.as_secs_f64())
                    .query(con)
            }
        })?;

        let Some(raw_id) = popped else {
            return Ok(None);
        };
        let id = Eid::from(raw_id);

        let (mut job, stored) = match self.load_raw(&id) {
            Ok(loaded) => loaded,
            Err(QueueError::NotFound(id)) => {
                log::warn!("job data not found, removing from processing job_id={id}");
                self.with_conn(|con| {
                    redis::cmd("LREM")
                        .arg(&processing)
                        .arg(1)
                        .arg(id.as_str())
                        .query::<()>(con)
                })?;
                return Err(QueueError::NotFound(id));
            }
            Err(QueueError::Corrupt { id, reason }) => {
                log::error!("job data corrupt, dead-lettering job_id={id} err={reason}");
                self.with_conn(|con| {
                    redis::pipe()
                        .atomic()
                        .cmd("LREM")
                        .arg(&processing)
                        .arg(1)
                        .arg(id.as_str())
                        .ignore()
                        .cmd("LPUSH")
                        .arg(dead_key(kind))
                        .arg(id.as_str())
                        .ignore()
                        .cmd("HINCRBY")
                        .arg(stats_key(kind))
                        .arg("failed")
                        .arg(1)
                        .ignore()
                        .query::<()>(con)
                })?;
                return Err(QueueError::Corrupt { id, reason });
            }
            Err(e) => return Err(e),
        };

        let now = Utc::now();
        if let Err(e) = job.claim(now) {
            log::warn!("dropping unclaimable job from processing job_id={id} err={e}");
            self.with_conn(|con| {
                redis::cmd("LREM")
                    .arg(&processing)
                    .arg(1)
                    .arg(id.as_str())
                    .query::<()>(con)
            })?;
            return Err(e);
        }

        // until this lands the id sits in processing with a pending record,
        // which stale recovery hands back out if the consumer never returns
        let data = encode(&job)?;
        let claimed: i64 = self.with_conn(|con| {
            CLAIM_SCRIPT
                .key(job_key(&id))
                .key(stats_key(kind))
                .arg(&stored)
                .arg(&data)
                .arg(now.timestamp())
                .invoke(con)
        })?;

        if claimed == 0 {
            log::warn!("job was recovered before its claim landed job_id={id} kind={kind}");
            return Ok(None);
        }

        log::info!(
            "job dequeued job_id={id} kind={kind} retry_count={}",
            job.retry_count
        );
        Ok(Some(job))
    }

    fn complete(&self, id: &Eid) -> Result<(), QueueError> {
        let mut job = self.load(id)?;
        let now = Utc::now();
        job.complete(now)?;
        let data = encode(&job)?;
        let key = job_key(id);
        let stats = stats_key(job.kind);

        self.with_conn(|con| {
            redis::pipe()
                .atomic()
                .cmd("HSET")
                .arg(&key)
                .arg("data")
                .arg(&data)
                .arg("status")
                .arg(job.status.as_str())
                .arg("updated_at")
                .arg(now.timestamp())
                .ignore()
                .cmd("LREM")
                .arg(processing_key(job.kind))
                .arg(1)
                .arg(id.as_str())
                .ignore()
                .cmd("HINCRBY")
                .arg(&stats)
                .arg("processing")
                .arg(-1)
                .ignore()
                .cmd("HINCRBY")
                .arg(&stats)
                .arg("completed")
                .arg(1)
                .ignore()
                .cmd("EXPIRE")
                .arg(&key)
                .arg(self.config.completed_ttl_secs)
                .ignore()
                .query::<()>(con)
        })?;

        log::info!("job completed job_id={id} kind={}", job.kind);
        Ok(())
    }

    fn fail(&self, id: &Eid, error: &str) -> Result<FailOutcome, QueueError> {
        let mut job = self.load(id)?;
        let now = Utc::now();
        let outcome = job.fail(now, error, &self.policy)?;
        let data = encode(&job)?;
        let kind = job.kind;
        let stats = stats_key(kind);

        let mut pipe = redis::pipe();
        pipe.atomic();

        match outcome {
            FailOutcome::Retry { at } => {
                pipe.cmd("ZADD")
                    .arg(retry_key(kind))
                    .arg(at.timestamp_millis())
                    .arg(id.as_str())
                    .ignore();
            }
            FailOutcome::DeadLettered => {
                pipe.cmd("LPUSH")
                    .arg(dead_key(kind))
                    .arg(id.as_str())
                    .ignore()
                    .cmd("HINCRBY")
                    .arg(&stats)
                    .arg("failed")
                    .arg(1)
                    .ignore();
            }
        }

        pipe.cmd("HSET")
            .arg(job_key(id))
            .arg("data")
            .arg(&data)
            .arg("status")
            .arg(job.status.as_str())
            .arg("updated_at")
            .arg(now.timestamp())
            .arg("retry_count")
            .arg(job.retry_count)
            .arg("error")
            .arg(error)
            .ignore()
            .cmd("LREM")
            .arg(processing_key(kind))
            .arg(1)
            .arg(id.as_str())
            .ignore()
            .cmd("HINCRBY")
            .arg(&stats)
            .arg("processing")
            .arg(-1)
            .ignore();

        self.with_conn(|con| pipe.query::<()>(con))?;

        match outcome {
            FailOutcome::Retry { at } => log::info!(
                "job scheduled for retry job_id={id} kind={kind} retry_count={} next_retry={at} err={error}",
                job.retry_count
            ),
            FailOutcome::DeadLettered => log::error!(
                "job failed permanently job_id={id} kind={kind} retry_count={} err={error}",
                job.retry_count
            ),
        }

        Ok(outcome)
    }

    fn bury(&self, id: &Eid, reason: &str) -> Result<(), QueueError> {
        let mut job = self.load(id)?;
        let now = Utc::now();
        job.bury(now, reason)?;
        let data = encode(&job)?;
        let kind = job.kind;
        let stats = stats_key(kind);

        self.with_conn(|con| {
            redis::pipe()
                .atomic()
                .cmd("HSET")
                .arg(job_key(id))
                .arg("data")
                .arg(&data)
                .arg("status")
                .arg(job.status.as_str())
                .arg("updated_at")
                .arg(now.timestamp())
                .arg("error")
                .arg(reason)
                .ignore()
                .cmd("LREM")
                .arg(processing_key(kind))
                .arg(1)
                .arg(id.as_str())
                .ignore()
                .cmd("LPUSH")
                .arg(dead_key(kind))
                .arg(id.as_str())
                .ignore()
                .cmd("HINCRBY")
                .arg(&stats)
                .arg("processing")
                .arg(-1)
                .ignore()
                .cmd("HINCRBY")
                .arg(&stats)
                .arg("failed")
                .arg(1)
                .ignore()
                .query::<()>(con)
        })?;

        log::error!("job buried job_id={id} kind={kind} reason={reason}");
        Ok(())
    }

    fn get(&self, id: &Eid) -> Result<Job, QueueError> {
        self.load(id)
    }

    fn pending_count(&self, kind: JobKind) -> Result<usize, QueueError> {
        self.with_conn(|con| redis::cmd("LLEN").arg(pending_key(kind)).query(con))
    }

    fn stats(&self, kind: JobKind) -> Result<QueueStats, QueueError> {
        let (counters, pending, processing, retrying, dead): (
            HashMap<String, i64>,
            u64,
            u64,
            u64,
            u64,
        ) = self.with_conn(|con| {
            redis::pipe()
                .cmd("HGETALL")
                .arg(stats_key(kind))
                .cmd("LLEN")
                .arg(pending_key(kind))
                .cmd("LLEN")
                .arg(processing_key(kind))
                .cmd("ZCARD")
                .arg(retry_key(kind))
                .cmd("LLEN")
                .arg(dead_key(kind))
                .query(con)
        })?;

        let counter = |name: &str| counters.get(name).copied().unwrap_or_default();

        Ok(QueueStats {
            total_enqueued: counter("total_enqueued"),
            pending: counter("pending"),
            processing: counter("processing"),
            completed: counter("completed"),
            failed: counter("failed"),
            current_pending: pending,
            current_processing: processing,
            current_retrying: retrying,
            current_dead: dead,
        })
    }

    fn dead_letters(&self, kind: JobKind, limit: usize) -> Result<Vec<Job>, QueueError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let ids: Vec<String> = self.with_conn(|con| {
            redis::cmd("LRANGE")
                .arg(dead_key(kind))
                .arg(0)
                .arg(limit as i64 - 1)
                .query(con)
        })?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids.into_iter().map(Eid::from) {
            match self.load(&id) {
                Ok(job) => jobs.push(job),
                Err(QueueError::NotFound(_)) => log::debug!("dead job expired job_id={id}"),
                Err(QueueError::Corrupt { reason, .. }) => {
                    log::warn!("skipping corrupt dead job job_id={id} err={reason}")
                }
                Err(e) => return Err(e),
            }
        }

        Ok(jobs)
    }

    fn promote_due(&self, kind: JobKind, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let count: usize = self.with_conn(|con| {
            PROMOTE_SCRIPT
                .key(retry_key(kind))
                .key(pending_key(kind))
                .key(stats_key(kind))
                .arg(now.timestamp_millis())
                .invoke(con)
        })?;

        if count > 0 {
            log::info!("promoted retry jobs kind={kind} count={count}");
        }
        Ok(count)
    }

    fn recover_stale(&self, kind: JobKind, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = stale_cutoff(older_than);
        let processing = processing_key(kind);

        let ids: Vec<String> =
            self.with_conn(|con| redis::cmd("LRANGE").arg(&processing).arg(0).arg(-1).query(con))?;

        let mut recovered = 0;
        for id in ids.into_iter().map(Eid::from) {
            let (mut job, stored) = match self.load_raw(&id) {
                Ok(loaded) => loaded,
                Err(QueueError::NotFound(_)) => {
                    log::warn!("removing expired job from processing job_id={id}");
                    self.with_conn(|con| {
                        redis::cmd("LREM")
                            .arg(&processing)
                            .arg(1)
                            .arg(id.as_str())
                            .query::<()>(con)
                    })?;
                    continue;
                }
                Err(QueueError::Corrupt { reason, .. }) => {
                    log::warn!("skipping corrupt job in processing job_id={id} err={reason}");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !job.is_stale(cutoff) {
                continue;
            }

            let now = Utc::now();
            job.release(now)?;
            let data = encode(&job)?;

            let moved: i64 = self.with_conn(|con| {
                REQUEUE_SCRIPT
                    .key(&processing)
                    .key(pending_key(kind))
                    .key(job_key(&id))
                    .key(stats_key(kind))
                    .arg(id.as_str())
                    .arg(&data)
                    .arg(now.timestamp())
                    .arg(&stored)
                    .invoke(con)
            })?;

            if moved == 1 {
                log::warn!("recovered stale job job_id={id} kind={kind}");
                recovered += 1;
            }
        }

        Ok(recovered)
    }
}
