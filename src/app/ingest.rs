use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    app::{context::AppContext, errors::AppError},
    config::UnknownPlatformMode,
    eid::Eid,
    items::{ExtractionStatus, Item, ItemCreate, RepoError, StatusEvent},
    platforms::PLATFORM_UNKNOWN,
    queue::{job::ExtractMetadata, Task},
};

/// A chat message as handed over by the chat client.
#[derive(Debug, Clone, Default)]
pub struct ChatMessage {
    pub server_id: String,
    pub channel_id: String,
    pub message_id: String,
    pub author_is_bot: bool,
    pub content: String,
    pub posted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedLink {
    pub item_id: Eid,
    pub job_id: Eid,
    pub url: String,
    pub platform: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedLink {
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub queued: Vec<QueuedLink>,
    pub skipped: Vec<SkippedLink>,
}

impl AppContext {
    /// Detects links in `message`, creates an item per new link and queues
    /// its extraction.
    pub fn ingest_message(&self, message: &ChatMessage) -> Result<IngestReport, AppError> {
        let mut report = IngestReport::default();

        if message.author_is_bot {
            log::debug!("ignoring bot message message_id={}", message.message_id);
            return Ok(report);
        }

        let mut seen = HashSet::new();
        for detected in self.detector.detect_urls(&message.content) {
            if !seen.insert(detected.url.clone()) {
                continue;
            }

            if detected.platform == PLATFORM_UNKNOWN
                && self.config.unknown_platform_mode == UnknownPlatformMode::Strict
            {
                log::info!("skipping unsupported link url={}", detected.url);
                report.skipped.push(SkippedLink {
                    url: detected.url,
                    reason: "unsupported platform".into(),
                });
                continue;
            }

            if let Some(existing) = self.items.get_by_url(&message.server_id, &detected.url)? {
                if existing.extraction_status == ExtractionStatus::Failed {
                    report.queued.push(self.resubmit(&existing.id)?);
                } else {
                    report.skipped.push(SkippedLink {
                        url: detected.url,
                        reason: format!("already tracked as {}", existing.id),
                    });
                }
                continue;
            }

            let created = self.items.create(ItemCreate {
                server_id: message.server_id.clone(),
                url: detected.url.clone(),
                platform: detected.platform.clone(),
                message_id: Some(message.message_id.clone()),
                channel_id: Some(message.channel_id.clone()),
                message_content: Some(message.content.clone()),
                posted_at: message.posted_at,
            });

            let item = match created {
                Ok(item) => item,
                // another message carrying the same link won the race
                Err(RepoError::AlreadyExists(id)) => {
                    report.skipped.push(SkippedLink {
                        url: detected.url,
                        reason: format!("already tracked as {id}"),
                    });
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            log::info!(
                "item created item_id={} url={} platform={}",
                item.id,
                item.url,
                item.platform
            );
            report.queued.push(self.queue_extraction(&item)?);
        }

        Ok(report)
    }

    /// Puts a failed or complete item back to pending and queues a new job.
    pub fn resubmit(&self, item_id: &Eid) -> Result<QueuedLink, AppError> {
        let item = self
            .items
            .update_extraction_status(item_id, StatusEvent::Resubmit)?;
        log::info!("item resubmitted item_id={item_id}");
        self.queue_extraction(&item)
    }

    fn queue_extraction(&self, item: &Item) -> Result<QueuedLink, AppError> {
        let task = Task::ExtractMetadata(ExtractMetadata {
            item_id: item.id.clone(),
            url: item.url.clone(),
            platform: item.platform.clone(),
            server_id: item.server_id.clone(),
            message_id: item.message_id.clone(),
            channel_id: item.channel_id.clone(),
        });

        match self.queue.submit(&task) {
            Ok(job_id) => Ok(QueuedLink {
                item_id: item.id.clone(),
                job_id,
                url: item.url.clone(),
                platform: item.platform.clone(),
            }),
            Err(e) => {
                // leave the item resubmittable instead of pending forever
                if let Err(repo_err) = self
                    .items
                    .update_extraction_status(&item.id, StatusEvent::Exhaust)
                {
                    log::error!("failed to mark item failed item_id={} err={repo_err}", item.id);
                }
                Err(e.into())
            }
        }
    }
}
