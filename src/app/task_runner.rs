use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::sleep,
    time::{Duration, Instant},
};

use chrono::Utc;
use serde::Serialize;

use crate::{
    app::{context::AppContext, errors::AppError, handler::JobOutcome},
    queue::JobKind,
};

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    last_job_ms: AtomicU64,
    total_job_ms: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub last_job_ms: u64,
    pub average_job_ms: u64,
}

impl WorkerStats {
    fn record(&self, outcome: &JobOutcome, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.last_job_ms.store(ms, Ordering::Relaxed);
        self.total_job_ms.fetch_add(ms, Ordering::Relaxed);

        match outcome {
            JobOutcome::Completed(_) => self.succeeded.fetch_add(1, Ordering::Relaxed),
            _ => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let total = self.total_job_ms.load(Ordering::Relaxed);

        WorkerStatsSnapshot {
            processed,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            last_job_ms: self.last_job_ms.load(Ordering::Relaxed),
            average_job_ms: if processed == 0 { 0 } else { total / processed },
        }
    }
}

/// Polls the queue on a fixed tick and processes jobs one at a time per
/// consumer thread.
pub struct Worker {
    ctx: Arc<AppContext>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
}

impl Worker {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            shutdown: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(WorkerStats::default()),
        }
    }

    /// Flag that stops the worker after its in-flight jobs.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Blocks until shutdown is requested.
    pub fn run(&self) {
        let worker_cfg = &self.ctx.config.worker;
        let stale_after = Duration::from_secs(worker_cfg.stale_after_secs);

        // jobs left in processing by a previous run
        for kind in JobKind::ALL {
            match self.ctx.queue.recover_stale(*kind, stale_after) {
                Ok(0) => {}
                Ok(n) => log::info!("requeued interrupted jobs kind={kind} count={n}"),
                Err(e) => log::error!("failed to recover stale jobs kind={kind} err={e}"),
            }
        }

        log::info!("worker started consumers={}", worker_cfg.consumers);

        let handles: Vec<_> = (0..worker_cfg.consumers)
            .map(|n| {
                let consumer = Consumer {
                    refreshes_platforms: n == 0,
                    ctx: self.ctx.clone(),
                    shutdown: self.shutdown.clone(),
                    stats: self.stats.clone(),
                };
                std::thread::Builder::new()
                    .name(format!("knok-consumer-{n}"))
                    .spawn(move || consumer.run())
            })
            .collect();

        for handle in handles {
            match handle {
                Ok(handle) => {
                    if let Err(err) = handle.join() {
                        log::error!("consumer thread panicked: {err:?}");
                    }
                }
                Err(e) => log::error!("failed to spawn consumer thread: {e}"),
            }
        }

        let stats = self.stats.snapshot();
        log::info!(
            "worker stopped processed={} succeeded={} failed={}",
            stats.processed,
            stats.succeeded,
            stats.failed
        );
    }
}

struct Consumer {
    /// One consumer owns the periodic platform reload
    refreshes_platforms: bool,
    ctx: Arc<AppContext>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
}

impl Consumer {
    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Sleeps for `duration` in short steps so shutdown stays responsive.
    fn pause(&self, duration: Duration) {
        let until = Instant::now() + duration;
        while !self.stopping() {
            let left = until.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            sleep(left.min(SHUTDOWN_POLL));
        }
    }

    fn run(&self) {
        let worker_cfg = &self.ctx.config.worker;
        let poll = Duration::from_secs(worker_cfg.poll_interval_secs);
        let backoff = Duration::from_secs(worker_cfg.unavailable_backoff_secs);
        let refresh_every = Duration::from_secs(worker_cfg.platform_refresh_secs);
        let mut last_refresh = Instant::now();

        while !self.stopping() {
            let mut unavailable = false;

            if self.refreshes_platforms
                && !refresh_every.is_zero()
                && last_refresh.elapsed() >= refresh_every
            {
                self.ctx.refresh_platforms();
                last_refresh = Instant::now();
                log::debug!("platforms refreshed count={}", self.ctx.registry.count());
            }

            for kind in JobKind::ALL {
                if let Err(e) = self.run_cycle(*kind) {
                    log::error!("job cycle failed kind={kind} err={e}");
                    unavailable |= e.is_unavailable();
                }
                if self.stopping() {
                    break;
                }
            }

            self.pause(if unavailable { backoff } else { poll });
        }
    }

    /// Promotes due retries, then handles up to `jobs_per_cycle` jobs.
    fn run_cycle(&self, kind: JobKind) -> Result<(), AppError> {
        let queue = &self.ctx.queue;
        let worker_cfg = &self.ctx.config.worker;

        queue.promote_due(kind, Utc::now())?;

        let pending = queue.pending_count(kind)?;
        if pending == 0 {
            return Ok(());
        }

        log::debug!("processing pending jobs kind={kind} count={pending}");

        let wait = Duration::from_secs(self.ctx.config.queue.dequeue_timeout_secs)
            .min(Duration::from_secs(worker_cfg.poll_interval_secs.max(1)));

        for _ in 0..pending.min(worker_cfg.jobs_per_cycle) {
            if self.stopping() {
                break;
            }

            let job = match queue.dequeue(kind, wait) {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e @ crate::queue::QueueError::Unavailable(_)) => return Err(e.into()),
                Err(e) => {
                    log::error!("failed to dequeue job kind={kind} err={e}");
                    continue;
                }
            };

            let span = tracing::info_span!("job", job_id = %job.id, kind = %kind);
            let _enter = span.enter();

            let started = Instant::now();
            let outcome = self.ctx.process_job(&job)?;
            let elapsed = started.elapsed();
            self.stats.record(&outcome, elapsed);

            log::info!(
                "job finished job_id={} outcome={outcome:?} duration_ms={}",
                job.id,
                elapsed.as_millis()
            );
        }

        Ok(())
    }
}
