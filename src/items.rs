use std::fmt::Display;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eid::Eid;
use crate::metadata::{ExtractionMethod, Metadata};
use crate::storage::{BackendLocal, StorageManager};

const ITEMS_FILE: &str = "items.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    #[default]
    Pending,
    Processing,
    Complete,
    Failed,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStatus::Pending => "pending",
            ExtractionStatus::Processing => "processing",
            ExtractionStatus::Complete => "complete",
            ExtractionStatus::Failed => "failed",
        }
    }

    /// Next status for `event`, or `None` when the event doesn't apply.
    pub fn next(self, event: StatusEvent) -> Option<ExtractionStatus> {
        use ExtractionStatus::*;
        use StatusEvent::*;

        match (self, event) {
            // redelivered jobs may claim an item that is already processing
            (Pending | Processing, Claim) => Some(Processing),
            (Pending | Processing, Succeed) => Some(Complete),
            (Pending | Processing, Retry) => Some(Pending),
            (Pending | Processing, Exhaust) => Some(Failed),
            (Failed | Complete, Resubmit) => Some(Pending),
            _ => None,
        }
    }
}

impl Display for ExtractionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// A worker picked up the item's job
    Claim,
    Succeed,
    /// The job failed and was scheduled again
    Retry,
    /// The job was dead-lettered
    Exhaust,
    Resubmit,
}

impl Display for StatusEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("item {0} not found")]
    NotFound(Eid),

    #[error("item with this url already exists at id {0}")]
    AlreadyExists(Eid),

    #[error("item {id} is {from}, cannot apply {event}")]
    InvalidTransition {
        id: Eid,
        from: ExtractionStatus,
        event: StatusEvent,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

/// Stored result of an extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    #[serde(flatten)]
    pub metadata: Metadata,
    pub extraction_method: ExtractionMethod,
    pub extraction_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: Eid,
    pub server_id: String,
    pub url: String,
    pub platform: String,
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_content: Option<String>,

    #[serde(default)]
    pub metadata: Option<ExtractionRecord>,
    pub extraction_status: ExtractionStatus,

    pub posted_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ItemCreate {
    pub server_id: String,
    pub url: String,
    pub platform: String,
    pub message_id: Option<String>,
    pub channel_id: Option<String>,
    pub message_content: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
}

/// Partial change. Status moves only through `event`.
#[derive(Debug, Clone, Default)]
pub struct ItemUpdate {
    pub title: Option<String>,
    pub extraction: Option<ExtractionRecord>,
    pub event: Option<StatusEvent>,
}

#[derive(Debug, Clone, Default)]
pub struct ItemQuery {
    pub server_id: Option<String>,
    pub status: Option<ExtractionStatus>,
    pub platform: Option<String>,
    pub limit: Option<usize>,
}

impl Item {
    fn transition(&mut self, event: StatusEvent) -> Result<(), RepoError> {
        let next = self
            .extraction_status
            .next(event)
            .ok_or_else(|| RepoError::InvalidTransition {
                id: self.id.clone(),
                from: self.extraction_status,
                event,
            })?;
        self.extraction_status = next;
        Ok(())
    }

    /// Folds a new extraction into the stored one. A result from a tier at
    /// least as trusted as the stored one wins field by field; a lower tier
    /// only fills empty fields. The placeholder title and a description that
    /// is just the link never displace real values.
    pub fn record_extraction(&mut self, new: ExtractionRecord) {
        let merged = match self.metadata.take() {
            None => new,
            Some(stored) if new.extraction_method.rank() >= stored.extraction_method.rank() => {
                let mut merged = new;
                let stored_description = stored
                    .metadata
                    .description
                    .clone()
                    .filter(|d| *d != self.url);
                if merged.metadata.description.as_deref() == Some(self.url.as_str()) {
                    if let Some(d) = stored_description {
                        merged.metadata.description = Some(d);
                    }
                }
                merged.metadata.fill_missing(stored.metadata);
                merged
            }
            Some(mut stored) => {
                stored.metadata.fill_missing(new.metadata);
                stored.extraction_time = new.extraction_time;
                stored
            }
        };

        if merged.metadata.has_title() || !self.title.as_deref().is_some_and(|t| !t.is_empty()) {
            self.title = merged.metadata.title.clone();
        }
        self.metadata = Some(merged);
    }

    pub fn apply(&mut self, update: ItemUpdate, now: DateTime<Utc>) -> Result<(), RepoError> {
        if let Some(event) = update.event {
            self.transition(event)?;
        }
        if let Some(title) = update.title {
            self.title = Some(title);
        }
        if let Some(extraction) = update.extraction {
            self.record_extraction(extraction);
        }
        self.updated_at = Some(now);
        Ok(())
    }

    fn matches(&self, query: &ItemQuery) -> bool {
        query.server_id.as_ref().map_or(true, |s| *s == self.server_id)
            && query.status.map_or(true, |s| s == self.extraction_status)
            && query.platform.as_ref().map_or(true, |p| *p == self.platform)
    }
}

/// Item persistence. Implementations must be safe to call concurrently for
/// different item ids.
pub trait ItemRepository: Send + Sync {
    /// Item for `url` within `server_id`.
    fn get_by_url(&self, server_id: &str, url: &str) -> Result<Option<Item>, RepoError>;
    fn get_by_id(&self, id: &Eid) -> Result<Item, RepoError>;
    /// Fails with [`RepoError::AlreadyExists`] when `(server_id, url)` is taken.
    fn create(&self, item: ItemCreate) -> Result<Item, RepoError>;
    fn update(&self, id: &Eid, update: ItemUpdate) -> Result<Item, RepoError>;
    fn update_extraction_status(&self, id: &Eid, event: StatusEvent) -> Result<Item, RepoError> {
        self.update(
            id,
            ItemUpdate {
                event: Some(event),
                ..Default::default()
            },
        )
    }
    fn list(&self, query: ItemQuery) -> Result<Vec<Item>, RepoError>;
}

/// Items kept in memory, optionally mirrored to `items.json`.
pub struct BackendJson {
    list: RwLock<Vec<Item>>,
    store: Option<BackendLocal>,
}

impl BackendJson {
    pub fn in_memory() -> Self {
        Self {
            list: RwLock::new(vec![]),
            store: None,
        }
    }

    pub fn load(store: BackendLocal) -> anyhow::Result<Self> {
        let items: Vec<Item> = if store.exists(ITEMS_FILE) {
            serde_json::from_slice(&store.read(ITEMS_FILE)?)?
        } else {
            log::info!("creating new item store at {:?}", store.base_dir.join(ITEMS_FILE));
            vec![]
        };

        log::debug!("loaded items count={}", items.len());

        Ok(Self {
            list: RwLock::new(items),
            store: Some(store),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Item>> {
        self.list.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Item>> {
        self.list.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Persists while the write guard is held so file order matches memory.
    fn save(&self, items: &[Item]) -> Result<(), RepoError> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let data = serde_json::to_vec_pretty(items).map_err(|e| RepoError::Storage(e.to_string()))?;
        store
            .write(ITEMS_FILE, &data)
            .map_err(|e| RepoError::Storage(e.to_string()))
    }
}

impl ItemRepository for BackendJson {
    fn get_by_url(&self, server_id: &str, url: &str) -> Result<Option<Item>, RepoError> {
        Ok(self
            .read()
            .iter()
            .find(|i| i.server_id == server_id && i.url == url)
            .cloned())
    }

    fn get_by_id(&self, id: &Eid) -> Result<Item, RepoError> {
        self.read()
            .iter()
            .find(|i| i.id == *id)
            .cloned()
            .ok_or_else(|| RepoError::NotFound(id.clone()))
    }

    fn create(&self, create: ItemCreate) -> Result<Item, RepoError> {
        let mut items = self.write();

        if let Some(existing) = items
            .iter()
            .find(|i| i.server_id == create.server_id && i.url == create.url)
        {
            return Err(RepoError::AlreadyExists(existing.id.clone()));
        }

        let now = Utc::now();
        let item = Item {
            id: Eid::new(),
            server_id: create.server_id,
            url: create.url,
            platform: create.platform,
            title: None,
            message_id: create.message_id,
            channel_id: create.channel_id,
            message_content: create.message_content,
            metadata: None,
            extraction_status: ExtractionStatus::Pending,
            posted_at: create.posted_at.unwrap_or(now),
            created_at: now,
            updated_at: None,
        };

        items.push(item.clone());
        self.save(&items)?;

        Ok(item)
    }

    fn update(&self, id: &Eid, update: ItemUpdate) -> Result<Item, RepoError> {
        let mut items = self.write();

        let item = items
            .iter_mut()
            .find(|i| i.id == *id)
            .ok_or_else(|| RepoError::NotFound(id.clone()))?;

        let mut updated = item.clone();
        updated.apply(update, Utc::now())?;
        *item = updated.clone();

        self.save(&items)?;

        Ok(updated)
    }

    fn list(&self, query: ItemQuery) -> Result<Vec<Item>, RepoError> {
        let items = self.read();
        let iter = items.iter().filter(|i| i.matches(&query)).cloned();

        Ok(match query.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(url: &str) -> ItemCreate {
        ItemCreate {
            server_id: "guild".into(),
            url: url.into(),
            platform: "youtube".into(),
            ..Default::default()
        }
    }

    fn record(method: ExtractionMethod, title: &str, description: Option<&str>) -> ExtractionRecord {
        ExtractionRecord {
            metadata: Metadata {
                title: Some(title.into()),
                description: description.map(String::from),
                ..Default::default()
            },
            extraction_method: method,
            extraction_time: Utc::now(),
        }
    }

    #[test]
    fn test_status_transitions() {
        use ExtractionStatus::*;
        use StatusEvent::*;

        assert_eq!(Pending.next(Claim), Some(Processing));
        assert_eq!(Processing.next(Claim), Some(Processing));
        assert_eq!(Processing.next(Succeed), Some(Complete));
        assert_eq!(Processing.next(Retry), Some(Pending));
        assert_eq!(Processing.next(Exhaust), Some(Failed));
        assert_eq!(Failed.next(Resubmit), Some(Pending));
        assert_eq!(Complete.next(Resubmit), Some(Pending));

        assert_eq!(Complete.next(Claim), None);
        assert_eq!(Failed.next(Succeed), None);
        assert_eq!(Pending.next(Resubmit), None);
    }

    #[test]
    fn test_unique_url_per_server() {
        let repo = BackendJson::in_memory();
        let item = repo.create(create("https://youtube.com/watch?v=1")).unwrap();

        match repo.create(create("https://youtube.com/watch?v=1")) {
            Err(RepoError::AlreadyExists(id)) => assert_eq!(id, item.id),
            other => panic!("unexpected {other:?}"),
        }

        let mut other_server = create("https://youtube.com/watch?v=1");
        other_server.server_id = "other".into();
        assert!(repo.create(other_server).is_ok());
    }

    #[test]
    fn test_invalid_transition_leaves_item_untouched() {
        let repo = BackendJson::in_memory();
        let item = repo.create(create("https://a.com/")).unwrap();

        let err = repo
            .update(
                &item.id,
                ItemUpdate {
                    title: Some("x".into()),
                    event: Some(StatusEvent::Resubmit),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, RepoError::InvalidTransition { .. }));

        let stored = repo.get_by_id(&item.id).unwrap();
        assert_eq!(stored.title, None);
        assert_eq!(stored.extraction_status, ExtractionStatus::Pending);
    }

    #[test]
    fn test_lower_tier_only_fills_gaps() {
        let mut item = BackendJson::in_memory().create(create("https://a.com/x")).unwrap();

        item.record_extraction(record(ExtractionMethod::Oembed, "Real", Some("By Artist")));
        item.record_extraction(record(ExtractionMethod::TitleFallback, "Unknown Title", Some("https://a.com/x")));

        let stored = item.metadata.as_ref().unwrap();
        assert_eq!(stored.extraction_method, ExtractionMethod::Oembed);
        assert_eq!(stored.metadata.title.as_deref(), Some("Real"));
        assert_eq!(stored.metadata.description.as_deref(), Some("By Artist"));
        assert_eq!(item.title.as_deref(), Some("Real"));
    }

    #[test]
    fn test_higher_tier_replaces() {
        let mut item = BackendJson::in_memory().create(create("https://a.com/x")).unwrap();

        item.record_extraction(record(ExtractionMethod::TitleFallback, "Unknown Title", Some("https://a.com/x")));
        assert_eq!(item.title.as_deref(), Some("Unknown Title"));

        item.record_extraction(record(ExtractionMethod::HttpStatic, "Page", Some("https://a.com/x")));
        let stored = item.metadata.as_ref().unwrap();
        assert_eq!(stored.extraction_method, ExtractionMethod::HttpStatic);
        assert_eq!(item.title.as_deref(), Some("Page"));

        item.record_extraction(record(ExtractionMethod::HttpStatic, "Page 2", Some("https://a.com/x")));
        assert_eq!(item.title.as_deref(), Some("Page 2"));
    }

    #[test]
    fn test_synthesized_description_keeps_real_one() {
        let mut item = BackendJson::in_memory().create(create("https://a.com/x")).unwrap();

        item.record_extraction(record(ExtractionMethod::HttpStatic, "Page", Some("Real description")));
        item.record_extraction(record(ExtractionMethod::Oembed, "Page", Some("https://a.com/x")));

        let stored = item.metadata.as_ref().unwrap();
        assert_eq!(stored.extraction_method, ExtractionMethod::Oembed);
        assert_eq!(stored.metadata.description.as_deref(), Some("Real description"));
    }

    #[test]
    fn test_file_backend_persists() {
        let dir = tempfile::tempdir().unwrap();

        let id = {
            let repo = BackendJson::load(BackendLocal::new(dir.path()).unwrap()).unwrap();
            let item = repo.create(create("https://a.com/x")).unwrap();
            repo.update_extraction_status(&item.id, StatusEvent::Claim).unwrap();
            item.id
        };

        let repo = BackendJson::load(BackendLocal::new(dir.path()).unwrap()).unwrap();
        let item = repo.get_by_id(&id).unwrap();
        assert_eq!(item.extraction_status, ExtractionStatus::Processing);
        assert!(repo.get_by_url("guild", "https://a.com/x").unwrap().is_some());
        assert_eq!(
            repo.list(ItemQuery {
                status: Some(ExtractionStatus::Processing),
                ..Default::default()
            })
            .unwrap()
            .len(),
            1
        );
    }
}
