use chrono::{DateTime, Utc};

use crate::{
    app::{context::AppContext, errors::AppError},
    items::{ExtractionRecord, ExtractionStatus, ItemUpdate, RepoError, StatusEvent},
    metadata::ExtractionMethod,
    queue::{job::ExtractMetadata, FailOutcome, Job, Task},
};

/// What happened to a dequeued job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(Option<ExtractionMethod>),
    Retrying { at: DateTime<Utc> },
    DeadLettered,
    /// Payload or target can never be processed
    Buried,
}

impl AppContext {
    /// Runs a dequeued job to completion and settles it with the queue.
    /// Only queue errors escape; task errors go through retry/dead-letter.
    pub fn process_job(&self, job: &Job) -> Result<JobOutcome, AppError> {
        let task = match Task::from_job(job) {
            Ok(task) => task,
            Err(e) => {
                log::error!("burying job with invalid payload job_id={} err={e}", job.id);
                self.queue.bury(&job.id, &e.to_string())?;
                return Ok(JobOutcome::Buried);
            }
        };

        let result = match &task {
            Task::ExtractMetadata(p) => self.extract_metadata(p),
        };

        match result {
            Ok(method) => {
                self.queue.complete(&job.id)?;
                Ok(JobOutcome::Completed(method))
            }
            Err(AppError::Repo(RepoError::NotFound(id))) => {
                let reason = format!("item {id} not found");
                log::error!("burying job job_id={} err={reason}", job.id);
                self.queue.bury(&job.id, &reason)?;
                Ok(JobOutcome::Buried)
            }
            Err(e) => {
                log::warn!("job failed job_id={} err={e}", job.id);
                let outcome = self.queue.fail(&job.id, &e.to_string())?;
                self.settle_item(&task, outcome);

                Ok(match outcome {
                    FailOutcome::Retry { at } => JobOutcome::Retrying { at },
                    FailOutcome::DeadLettered => JobOutcome::DeadLettered,
                })
            }
        }
    }

    /// Claims the item, runs the pipeline and writes the merged result back.
    /// `None` when the item was already finished by an earlier delivery.
    fn extract_metadata(&self, task: &ExtractMetadata) -> Result<Option<ExtractionMethod>, AppError> {
        match self
            .items
            .update_extraction_status(&task.item_id, StatusEvent::Claim)
        {
            Ok(_) => {}
            Err(RepoError::InvalidTransition {
                from: from @ (ExtractionStatus::Complete | ExtractionStatus::Failed),
                ..
            }) => {
                log::info!(
                    "item already settled, skipping item_id={} status={from}",
                    task.item_id
                );
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        log::info!(
            "processing metadata extraction item_id={} url={} platform={}",
            task.item_id,
            task.url,
            task.platform
        );

        let extraction = self.pipeline.extract(&task.url);
        let method = extraction.method;

        let item = self.items.update(
            &task.item_id,
            ItemUpdate {
                extraction: Some(ExtractionRecord {
                    metadata: extraction.metadata,
                    extraction_method: method,
                    extraction_time: Utc::now(),
                }),
                event: Some(StatusEvent::Succeed),
                ..Default::default()
            },
        )?;

        log::info!(
            "metadata extraction completed item_id={} method={method} title={:?}",
            item.id,
            item.title
        );

        Ok(Some(method))
    }

    fn settle_item(&self, task: &Task, outcome: FailOutcome) {
        let Task::ExtractMetadata(p) = task;
        let event = match outcome {
            FailOutcome::Retry { .. } => StatusEvent::Retry,
            FailOutcome::DeadLettered => StatusEvent::Exhaust,
        };

        if let Err(e) = self.items.update_extraction_status(&p.item_id, event) {
            log::warn!("failed to update item status item_id={} event={event} err={e}", p.item_id);
        }
    }
}
