use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::config::QueueConfig;
use crate::eid::Eid;
use crate::queue::{
    stale_cutoff, BackoffPolicy, FailOutcome, Job, JobKind, JobQueue, JobStatus, Payload,
    QueueError, QueueStats,
};

#[derive(Default)]
struct Lanes {
    /// Newest at the front, next to dequeue at the back.
    pending: VecDeque<Eid>,
    processing: Vec<Eid>,
    retry: Vec<(DateTime<Utc>, Eid)>,
    dead: VecDeque<Eid>,
    counters: QueueStats,
}

#[derive(Default)]
struct State {
    jobs: HashMap<Eid, Job>,
    lanes: HashMap<JobKind, Lanes>,
    /// Finished jobs by the time their record may be dropped.
    expiring: BTreeSet<(DateTime<Utc>, Eid)>,
}

impl State {
    fn lanes(&mut self, kind: JobKind) -> &mut Lanes {
        self.lanes.entry(kind).or_default()
    }

    fn expire_at(&mut self, id: &Eid, at: DateTime<Utc>) {
        self.expiring.insert((at, id.clone()));
    }

    /// Drops finished jobs whose retention ran out, along with their
    /// dead-letter entries.
    fn prune(&mut self, now: DateTime<Utc>) {
        while self.expiring.first().is_some_and(|(at, _)| *at <= now) {
            let Some((_, id)) = self.expiring.pop_first() else {
                break;
            };
            let Some(job) = self.jobs.remove(&id) else {
                continue;
            };
            let dead = &mut self.lanes(job.kind).dead;
            if let Some(pos) = dead.iter().position(|x| *x == id) {
                dead.remove(pos);
            }
            log::debug!("job expired job_id={id} status={}", job.status);
        }
    }

    fn processing_job(&mut self, id: &Eid) -> Result<&mut Job, QueueError> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))
    }
}

/// Single-process queue with the same lifecycle as the Redis one.
pub struct MemoryQueue {
    state: Mutex<State>,
    ready: Condvar,
    max_retries: u32,
    policy: BackoffPolicy,
    job_ttl: chrono::Duration,
    completed_ttl: chrono::Duration,
}

/// Longer retention than a century is treated as a century.
const MAX_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn ttl(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_TTL_SECS) as i64)
}

impl MemoryQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ready: Condvar::new(),
            max_retries: config.max_retries,
            policy: BackoffPolicy::from(config),
            job_ttl: ttl(config.job_ttl_secs),
            completed_ttl: ttl(config.completed_ttl_secs),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn remove_id(list: &mut Vec<Eid>, id: &Eid) {
    if let Some(pos) = list.iter().position(|x| x == id) {
        list.remove(pos);
    }
}

impl JobQueue for MemoryQueue {
    fn enqueue(&self, kind: JobKind, payload: Payload) -> Result<Eid, QueueError> {
        let job = Job::new(kind, payload, self.max_retries);
        let id = job.id.clone();

        let mut state = self.lock();
        state.jobs.insert(id.clone(), job);
        let lanes = state.lanes(kind);
        lanes.pending.push_front(id.clone());
        lanes.counters.total_enqueued += 1;
        lanes.counters.pending += 1;
        drop(state);

        self.ready.notify_one();
        log::info!("job enqueued job_id={id} kind={kind}");
        Ok(id)
    }

    fn dequeue(&self, kind: JobKind, wait: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = Instant::now() + wait;
        let mut state = self.lock();

        loop {
            if let Some(id) = state.lanes(kind).pending.pop_back() {
                let now = Utc::now();
                let Some(job) = state.jobs.get_mut(&id) else {
                    log::warn!("job data not found, dropping id job_id={id}");
                    continue;
                };
                if let Err(e) = job.claim(now) {
                    log::warn!("skipping unclaimable job job_id={id} err={e}");
                    continue;
                }
                let job = job.clone();

                let lanes = state.lanes(kind);
                lanes.processing.push(id);
                lanes.counters.pending -= 1;
                lanes.counters.processing += 1;

                log::info!(
                    "job dequeued job_id={} kind={kind} retry_count={}",
                    job.id,
                    job.retry_count
                );
                return Ok(Some(job));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            state = self
                .ready
                .wait_timeout(state, remaining)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    fn complete(&self, id: &Eid) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut state = self.lock();
        let job = state.processing_job(id)?;
        job.complete(now)?;
        let kind = job.kind;

        let lanes = state.lanes(kind);
        remove_id(&mut lanes.processing, id);
        lanes.counters.processing -= 1;
        lanes.counters.completed += 1;

        state.expire_at(id, now + self.completed_ttl);
        state.prune(now);

        log::info!("job completed job_id={id} kind={kind}");
        Ok(())
    }

    fn fail(&self, id: &Eid, error: &str) -> Result<FailOutcome, QueueError> {
        let now = Utc::now();
        let mut state = self.lock();
        let job = state.processing_job(id)?;
        let outcome = job.fail(now, error, &self.policy)?;
        let (kind, retry_count, created_at) = (job.kind, job.retry_count, job.created_at);

        let lanes = state.lanes(kind);
        remove_id(&mut lanes.processing, id);
        lanes.counters.processing -= 1;

        match outcome {
            FailOutcome::Retry { at } => {
                lanes.retry.push((at, id.clone()));
                log::info!(
                    "job scheduled for retry job_id={id} kind={kind} retry_count={retry_count} next_retry={at} err={error}"
                );
            }
            FailOutcome::DeadLettered => {
                lanes.dead.push_front(id.clone());
                lanes.counters.failed += 1;
                log::error!(
                    "job failed permanently job_id={id} kind={kind} retry_count={retry_count} err={error}"
                );
                state.expire_at(id, created_at + self.job_ttl);
            }
        }

        state.prune(now);
        Ok(outcome)
    }

    fn bury(&self, id: &Eid, reason: &str) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut state = self.lock();
        let job = state.processing_job(id)?;
        job.bury(now, reason)?;
        let (kind, created_at) = (job.kind, job.created_at);

        let lanes = state.lanes(kind);
        remove_id(&mut lanes.processing, id);
        lanes.dead.push_front(id.clone());
        lanes.counters.processing -= 1;
        lanes.counters.failed += 1;

        state.expire_at(id, created_at + self.job_ttl);
        state.prune(now);

        log::error!("job buried job_id={id} kind={kind} reason={reason}");
        Ok(())
    }

    fn get(&self, id: &Eid) -> Result<Job, QueueError> {
        self.lock()
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound(id.clone()))
    }

    fn pending_count(&self, kind: JobKind) -> Result<usize, QueueError> {
        Ok(self.lock().lanes(kind).pending.len())
    }

    fn stats(&self, kind: JobKind) -> Result<QueueStats, QueueError> {
        let mut state = self.lock();
        let lanes = state.lanes(kind);
        Ok(QueueStats {
            current_pending: lanes.pending.len() as u64,
            current_processing: lanes.processing.len() as u64,
            current_retrying: lanes.retry.len() as u64,
            current_dead: lanes.dead.len() as u64,
            ..lanes.counters.clone()
        })
    }

    fn dead_letters(&self, kind: JobKind, limit: usize) -> Result<Vec<Job>, QueueError> {
        let mut state = self.lock();
        state.prune(Utc::now());
        let ids: Vec<Eid> = state.lanes(kind).dead.iter().take(limit).cloned().collect();
        Ok(ids
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect())
    }

    fn promote_due(&self, kind: JobKind, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut state = self.lock();
        let lanes = state.lanes(kind);

        let (mut due, waiting): (Vec<_>, Vec<_>) =
            lanes.retry.drain(..).partition(|(at, _)| *at <= now);
        lanes.retry = waiting;
        due.sort_by_key(|(at, _)| *at);

        let count = due.len();
        for (_, id) in due {
            lanes.pending.push_front(id);
        }
        lanes.counters.pending += count as i64;
        drop(state);

        if count > 0 {
            self.ready.notify_all();
            log::info!("promoted retry jobs kind={kind} count={count}");
        }
        Ok(count)
    }

    fn recover_stale(&self, kind: JobKind, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = stale_cutoff(older_than);
        let now = Utc::now();
        let mut state = self.lock();
        let State { jobs, lanes, .. } = &mut *state;
        let lanes = lanes.entry(kind).or_default();

        let mut recovered = 0;
        lanes.processing.retain(|id| {
            let Some(job) = jobs.get_mut(id) else {
                return false;
            };
            if job.status != JobStatus::Processing || !job.is_stale(cutoff) {
                return true;
            }
            if job.release(now).is_err() {
                return true;
            }
            lanes.pending.push_front(id.clone());
            recovered += 1;
            false
        });

        lanes.counters.processing -= recovered as i64;
        lanes.counters.pending += recovered as i64;
        drop(state);

        if recovered > 0 {
            self.ready.notify_all();
            log::warn!("recovered stale jobs kind={kind} count={recovered}");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> MemoryQueue {
        MemoryQueue::new(&QueueConfig {
            max_retries: 2,
            ..Default::default()
        })
    }

    fn payload(n: u32) -> Payload {
        let mut p = Payload::new();
        p.insert("n".into(), n.into());
        p
    }

    #[test]
    fn test_fifo_order() {
        let q = queue();
        let a = q.enqueue(JobKind::ExtractMetadata, payload(1)).unwrap();
        let b = q.enqueue(JobKind::ExtractMetadata, payload(2)).unwrap();

        let first = q.dequeue(JobKind::ExtractMetadata, Duration::ZERO).unwrap().unwrap();
        let second = q.dequeue(JobKind::ExtractMetadata, Duration::ZERO).unwrap().unwrap();
        assert_eq!(first.id, a);
        assert_eq!(second.id, b);
        assert!(q.dequeue(JobKind::ExtractMetadata, Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn test_dequeue_waits_for_enqueue() {
        let q = std::sync::Arc::new(queue());
        let producer = {
            let q = q.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                q.enqueue(JobKind::ExtractMetadata, payload(1)).unwrap()
            })
        };

        let job = q
            .dequeue(JobKind::ExtractMetadata, Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(job.id, producer.join().unwrap());
    }

    #[test]
    fn test_promote_only_due_entries() {
        let q = queue();
        let id = q.enqueue(JobKind::ExtractMetadata, payload(1)).unwrap();
        q.dequeue(JobKind::ExtractMetadata, Duration::ZERO).unwrap();
        let FailOutcome::Retry { at } = q.fail(&id, "boom").unwrap() else {
            panic!("expected retry");
        };

        assert_eq!(q.promote_due(JobKind::ExtractMetadata, at - chrono::Duration::milliseconds(1)).unwrap(), 0);
        assert_eq!(q.pending_count(JobKind::ExtractMetadata).unwrap(), 0);
        assert_eq!(q.promote_due(JobKind::ExtractMetadata, at).unwrap(), 1);
        assert_eq!(q.pending_count(JobKind::ExtractMetadata).unwrap(), 1);
    }

    #[test]
    fn test_recover_stale() {
        let q = queue();
        let id = q.enqueue(JobKind::ExtractMetadata, payload(1)).unwrap();
        q.dequeue(JobKind::ExtractMetadata, Duration::ZERO).unwrap();

        assert_eq!(q.recover_stale(JobKind::ExtractMetadata, Duration::from_secs(600)).unwrap(), 0);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(q.recover_stale(JobKind::ExtractMetadata, Duration::from_millis(1)).unwrap(), 1);
        assert_eq!(q.get(&id).unwrap().status, JobStatus::Pending);

        let stats = q.stats(JobKind::ExtractMetadata).unwrap();
        assert_eq!(stats.current_processing, 0);
        assert_eq!(stats.current_pending, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 0);
    }

    #[test]
    fn test_finished_jobs_expire() {
        let q = MemoryQueue::new(&QueueConfig {
            max_retries: 0,
            job_ttl_secs: 0,
            completed_ttl_secs: 0,
            ..Default::default()
        });
        let kind = JobKind::ExtractMetadata;

        for n in 0..1000 {
            let id = q.enqueue(kind, payload(n)).unwrap();
            q.dequeue(kind, Duration::ZERO).unwrap();
            q.complete(&id).unwrap();
        }
        assert!(q.lock().jobs.is_empty());

        let dead = q.enqueue(kind, payload(1)).unwrap();
        q.dequeue(kind, Duration::ZERO).unwrap();
        assert_eq!(q.fail(&dead, "boom").unwrap(), FailOutcome::DeadLettered);
        assert!(matches!(q.get(&dead), Err(QueueError::NotFound(_))));
        assert!(q.dead_letters(kind, 10).unwrap().is_empty());

        let stats = q.stats(kind).unwrap();
        assert_eq!(stats.completed, 1000);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.current_dead, 0);
    }

    #[test]
    fn test_unfinished_jobs_are_kept() {
        let q = MemoryQueue::new(&QueueConfig {
            job_ttl_secs: 0,
            ..Default::default()
        });
        let kind = JobKind::ExtractMetadata;

        let first = q.enqueue(kind, payload(1)).unwrap();
        let second = q.enqueue(kind, payload(2)).unwrap();
        assert_eq!(q.dequeue(kind, Duration::ZERO).unwrap().unwrap().id, first);
        q.complete(&first).unwrap();

        // completed retention is still the default
        assert_eq!(q.get(&first).unwrap().status, JobStatus::Completed);
        assert_eq!(q.get(&second).unwrap().status, JobStatus::Pending);
        assert_eq!(q.dequeue(kind, Duration::ZERO).unwrap().unwrap().id, second);
    }

    #[test]
    fn test_bury_dead_letters_immediately() {
        let q = queue();
        let id = q.enqueue(JobKind::ExtractMetadata, payload(1)).unwrap();
        q.dequeue(JobKind::ExtractMetadata, Duration::ZERO).unwrap();
        q.bury(&id, "invalid payload").unwrap();

        let job = q.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);

        let dead = q.dead_letters(JobKind::ExtractMetadata, 10).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);
        assert_eq!(q.stats(JobKind::ExtractMetadata).unwrap().failed, 1);
    }
}
