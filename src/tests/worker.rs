use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::app::handler::JobOutcome;
use crate::app::ingest::ChatMessage;
use crate::app::task_runner::Worker;
use crate::app::AppContext;
use crate::config::Config;
use crate::eid::Eid;
use crate::items::{
    BackendJson, ExtractionStatus, Item, ItemCreate, ItemQuery, ItemRepository, ItemUpdate,
    RepoError,
};
use crate::metadata::ExtractionMethod;
use crate::queue::job::ExtractMetadata;
use crate::queue::memory::MemoryQueue;
use crate::queue::{Job, JobKind, JobStatus, Payload, Task};
use crate::tests::http_stub::{Route, StubServer};
use crate::tests::{loaded_registry, memory_context, test_config};

const OG_PAGE: &str = r#"<html><head>
    <title>ignored</title>
    <meta property="og:title" content="Boiler Room: Someone">
    <meta property="og:description" content="Live from somewhere">
    <meta property="og:image" content="https://img.example/cover.jpg">
</head></html>"#;

fn next_job(ctx: &AppContext) -> Job {
    ctx.queue
        .dequeue(JobKind::ExtractMetadata, Duration::ZERO)
        .unwrap()
        .expect("a job should be pending")
}

fn ingest_one(ctx: &AppContext, url: &str) -> Eid {
    let report = ctx
        .ingest_message(&ChatMessage {
            server_id: "guild".into(),
            channel_id: "chan".into(),
            message_id: "msg".into(),
            content: format!("check {url}"),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(report.queued.len(), 1, "{report:?}");
    report.queued[0].item_id.clone()
}

#[test]
fn test_job_extracts_and_completes_item() {
    let server = StubServer::start(vec![("/set", Route::html(OG_PAGE))]);
    let ctx = memory_context(test_config());
    let item_id = ingest_one(&ctx, &server.url("/set"));

    let job = next_job(&ctx);
    let outcome = ctx.process_job(&job).unwrap();
    assert_eq!(outcome, JobOutcome::Completed(Some(ExtractionMethod::HttpStatic)));

    let item = ctx.items.get_by_id(&item_id).unwrap();
    assert_eq!(item.extraction_status, ExtractionStatus::Complete);
    assert_eq!(item.title.as_deref(), Some("Boiler Room: Someone"));

    let record = item.metadata.unwrap();
    assert_eq!(record.extraction_method, ExtractionMethod::HttpStatic);
    assert_eq!(record.metadata.description.as_deref(), Some("Live from somewhere"));
    assert_eq!(record.metadata.image.as_deref(), Some("https://img.example/cover.jpg"));

    assert_eq!(ctx.queue.get(&job.id).unwrap().status, JobStatus::Completed);
}

#[test]
fn test_unreachable_link_still_completes_with_placeholder() {
    let server = StubServer::start(vec![]);
    let ctx = memory_context(test_config());
    let url = server.url("/missing");
    let item_id = ingest_one(&ctx, &url);

    let outcome = ctx.process_job(&next_job(&ctx)).unwrap();
    assert_eq!(outcome, JobOutcome::Completed(Some(ExtractionMethod::TitleFallback)));

    let item = ctx.items.get_by_id(&item_id).unwrap();
    assert_eq!(item.extraction_status, ExtractionStatus::Complete);
    assert_eq!(item.metadata.unwrap().metadata.description, Some(url));
}

#[test]
fn test_invalid_payload_is_buried() {
    let ctx = memory_context(test_config());
    let mut payload = Payload::new();
    payload.insert("url".into(), "https://youtube.com/watch?v=1".into());
    let id = ctx.queue.enqueue(JobKind::ExtractMetadata, payload).unwrap();

    let outcome = ctx.process_job(&next_job(&ctx)).unwrap();
    assert_eq!(outcome, JobOutcome::Buried);

    let job = ctx.queue.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
    assert_eq!(ctx.queue.dead_letters(JobKind::ExtractMetadata, 10).unwrap()[0].id, id);
}

#[test]
fn test_job_for_missing_item_is_buried() {
    let ctx = memory_context(test_config());
    ctx.queue
        .submit(&Task::ExtractMetadata(ExtractMetadata {
            item_id: Eid::new(),
            url: "https://youtube.com/watch?v=1".into(),
            platform: "youtube".into(),
            server_id: "guild".into(),
            message_id: None,
            channel_id: None,
        }))
        .unwrap();

    let job = next_job(&ctx);
    assert_eq!(ctx.process_job(&job).unwrap(), JobOutcome::Buried);
    assert!(ctx.queue.get(&job.id).unwrap().last_error.unwrap().contains("not found"));
}

#[test]
fn test_redelivered_job_for_settled_item_is_a_noop() {
    let server = StubServer::start(vec![("/set", Route::html(OG_PAGE))]);
    let ctx = memory_context(test_config());
    let item_id = ingest_one(&ctx, &server.url("/set"));

    let job = next_job(&ctx);
    ctx.process_job(&job).unwrap();
    let first = ctx.items.get_by_id(&item_id).unwrap();

    // the same payload delivered a second time
    let id = ctx
        .queue
        .enqueue(JobKind::ExtractMetadata, job.payload.clone())
        .unwrap();
    let outcome = ctx.process_job(&next_job(&ctx)).unwrap();

    assert_eq!(outcome, JobOutcome::Completed(None));
    assert_eq!(server.hits("/set"), 1);
    assert_eq!(ctx.items.get_by_id(&item_id).unwrap(), first);
    assert_eq!(ctx.queue.get(&id).unwrap().status, JobStatus::Completed);
}

/// Item store whose extraction write-back always fails.
struct BrokenWriteBack(BackendJson);

impl ItemRepository for BrokenWriteBack {
    fn get_by_url(&self, server_id: &str, url: &str) -> Result<Option<Item>, RepoError> {
        self.0.get_by_url(server_id, url)
    }

    fn get_by_id(&self, id: &Eid) -> Result<Item, RepoError> {
        self.0.get_by_id(id)
    }

    fn create(&self, item: ItemCreate) -> Result<Item, RepoError> {
        self.0.create(item)
    }

    fn update(&self, id: &Eid, update: ItemUpdate) -> Result<Item, RepoError> {
        if update.extraction.is_some() {
            return Err(RepoError::Storage("disk full".into()));
        }
        self.0.update(id, update)
    }

    fn list(&self, query: ItemQuery) -> Result<Vec<Item>, RepoError> {
        self.0.list(query)
    }
}

fn broken_context(max_retries: u32) -> AppContext {
    let mut config: Config = test_config();
    config.queue.max_retries = max_retries;
    let queue = Arc::new(MemoryQueue::new(&config.queue));
    AppContext::with_parts(
        config,
        loaded_registry(),
        queue,
        Arc::new(BrokenWriteBack(BackendJson::in_memory())),
    )
    .unwrap()
}

#[test]
fn test_failed_job_retries_then_fails_item() {
    let server = StubServer::start(vec![("/set", Route::html(OG_PAGE))]);
    let ctx = broken_context(1);
    let item_id = ingest_one(&ctx, &server.url("/set"));

    let job = next_job(&ctx);
    let outcome = ctx.process_job(&job).unwrap();
    assert!(matches!(outcome, JobOutcome::Retrying { .. }));
    assert_eq!(
        ctx.items.get_by_id(&item_id).unwrap().extraction_status,
        ExtractionStatus::Pending
    );

    let far_future = chrono::Utc::now() + chrono::Duration::days(1);
    ctx.queue.promote_due(JobKind::ExtractMetadata, far_future).unwrap();

    let outcome = ctx.process_job(&next_job(&ctx)).unwrap();
    assert_eq!(outcome, JobOutcome::DeadLettered);
    assert_eq!(
        ctx.items.get_by_id(&item_id).unwrap().extraction_status,
        ExtractionStatus::Failed
    );

    let job = ctx.queue.get(&job.id).unwrap();
    assert_eq!(job.retry_count, 2);
    assert!(job.last_error.unwrap().contains("disk full"));
}

#[test]
fn test_worker_drains_queue_and_stops() {
    let server = StubServer::start(vec![("/a", Route::html(OG_PAGE)), ("/b", Route::html(OG_PAGE))]);
    let ctx = Arc::new(memory_context(test_config()));
    let a = ingest_one(&ctx, &server.url("/a"));
    let b = ingest_one(&ctx, &server.url("/b"));

    let worker = Arc::new(Worker::new(ctx.clone()));
    let shutdown = worker.shutdown_handle();
    let handle = std::thread::spawn({
        let worker = worker.clone();
        move || worker.run()
    });

    let until = Instant::now() + Duration::from_secs(20);
    while worker.stats().processed < 2 && Instant::now() < until {
        std::thread::sleep(Duration::from_millis(50));
    }
    shutdown.store(true, Ordering::Relaxed);
    handle.join().unwrap();

    let stats = worker.stats();
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.succeeded, 2);
    for id in [a, b] {
        assert_eq!(
            ctx.items.get_by_id(&id).unwrap().extraction_status,
            ExtractionStatus::Complete
        );
    }
}
