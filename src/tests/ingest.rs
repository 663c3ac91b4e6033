use std::time::Duration;

use crate::app::ingest::ChatMessage;
use crate::config::UnknownPlatformMode;
use crate::eid::Eid;
use crate::items::{ExtractionStatus, ItemQuery, StatusEvent};
use crate::queue::{JobKind, Task};
use crate::tests::{memory_context, test_config};

fn message(content: &str) -> ChatMessage {
    ChatMessage {
        server_id: "guild-1".into(),
        channel_id: "chan-1".into(),
        message_id: "msg-1".into(),
        content: content.into(),
        ..Default::default()
    }
}

#[test]
fn test_links_become_items_and_jobs() {
    let ctx = memory_context(test_config());

    let report = ctx
        .ingest_message(&message(
            "tonight: https://www.youtube.com/watch?v=abc&utm_source=x and <https://open.spotify.com/track/1>",
        ))
        .unwrap();

    assert_eq!(report.queued.len(), 2);
    assert!(report.skipped.is_empty());
    // suppressed embeds are picked up before plain links
    assert_eq!(report.queued[0].platform, "spotify");
    assert_eq!(report.queued[1].url, "https://youtube.com/watch?v=abc");
    assert_eq!(report.queued[1].platform, "youtube");

    let item = ctx.items.get_by_id(&report.queued[1].item_id).unwrap();
    assert_eq!(item.extraction_status, ExtractionStatus::Pending);
    assert_eq!(item.server_id, "guild-1");
    assert_eq!(item.message_id.as_deref(), Some("msg-1"));
    assert_eq!(item.channel_id.as_deref(), Some("chan-1"));
    assert!(item.metadata.is_none());

    assert_eq!(ctx.queue.pending_count(JobKind::ExtractMetadata).unwrap(), 2);
}

#[test]
fn test_job_payload_carries_item() {
    let ctx = memory_context(test_config());
    let report = ctx
        .ingest_message(&message("https://soundcloud.com/artist/track"))
        .unwrap();
    let queued = &report.queued[0];

    let job = ctx
        .queue
        .dequeue(JobKind::ExtractMetadata, Duration::ZERO)
        .unwrap()
        .unwrap();
    assert_eq!(job.id, queued.job_id);

    let Task::ExtractMetadata(p) = Task::from_job(&job).unwrap();
    assert_eq!(p.item_id, queued.item_id);
    assert_eq!(p.url, "https://soundcloud.com/artist/track");
    assert_eq!(p.platform, "soundcloud");
    assert_eq!(p.server_id, "guild-1");
    assert_eq!(p.message_id.as_deref(), Some("msg-1"));
    assert_eq!(p.channel_id.as_deref(), Some("chan-1"));
}

#[test]
fn test_bot_messages_ignored() {
    let ctx = memory_context(test_config());
    let report = ctx
        .ingest_message(&ChatMessage {
            author_is_bot: true,
            ..message("https://youtube.com/watch?v=abc")
        })
        .unwrap();

    assert!(report.queued.is_empty());
    assert!(report.skipped.is_empty());
    assert!(ctx.items.list(ItemQuery::default()).unwrap().is_empty());
}

#[test]
fn test_unknown_platforms_follow_mode() {
    let ctx = memory_context(test_config());
    let report = ctx.ingest_message(&message("https://example.com/post")).unwrap();
    assert_eq!(report.queued.len(), 1);
    assert_eq!(report.queued[0].platform, "unknown");

    let mut config = test_config();
    config.unknown_platform_mode = UnknownPlatformMode::Strict;
    let ctx = memory_context(config);
    let report = ctx
        .ingest_message(&message("https://example.com/post https://youtu.be/xyz"))
        .unwrap();

    assert_eq!(report.queued.len(), 1);
    assert_eq!(report.queued[0].platform, "youtube");
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].url, "https://example.com/post");
}

#[test]
fn test_repeat_link_skipped_per_server() {
    let ctx = memory_context(test_config());
    let first = ctx
        .ingest_message(&message("https://bandcamp.com/album/x"))
        .unwrap();
    assert_eq!(first.queued.len(), 1);

    let again = ctx
        .ingest_message(&message("again https://www.bandcamp.com/album/x"))
        .unwrap();
    assert!(again.queued.is_empty());
    assert_eq!(again.skipped.len(), 1);
    assert_eq!(ctx.queue.pending_count(JobKind::ExtractMetadata).unwrap(), 1);

    // a different server tracks its own copy
    let other = ctx
        .ingest_message(&ChatMessage {
            server_id: "guild-2".into(),
            ..message("https://bandcamp.com/album/x")
        })
        .unwrap();
    assert_eq!(other.queued.len(), 1);
}

#[test]
fn test_failed_item_resubmitted_on_repost() {
    let ctx = memory_context(test_config());
    let first = ctx
        .ingest_message(&message("https://mixcloud.com/dj/set/"))
        .unwrap();
    let item_id = first.queued[0].item_id.clone();

    ctx.items
        .update_extraction_status(&item_id, StatusEvent::Claim)
        .unwrap();
    ctx.items
        .update_extraction_status(&item_id, StatusEvent::Exhaust)
        .unwrap();

    let again = ctx
        .ingest_message(&message("https://mixcloud.com/dj/set/"))
        .unwrap();
    assert_eq!(again.queued.len(), 1);
    assert_eq!(again.queued[0].item_id, item_id);
    assert_ne!(again.queued[0].job_id, first.queued[0].job_id);
    assert_eq!(
        ctx.items.get_by_id(&item_id).unwrap().extraction_status,
        ExtractionStatus::Pending
    );
}

#[test]
fn test_resubmit() {
    let ctx = memory_context(test_config());
    let report = ctx
        .ingest_message(&message("https://open.spotify.com/album/1"))
        .unwrap();
    let item_id = report.queued[0].item_id.clone();

    // pending items are already on their way
    assert!(ctx.resubmit(&item_id).is_err());

    ctx.items
        .update_extraction_status(&item_id, StatusEvent::Claim)
        .unwrap();
    ctx.items
        .update_extraction_status(&item_id, StatusEvent::Succeed)
        .unwrap();

    let queued = ctx.resubmit(&item_id).unwrap();
    assert_eq!(queued.item_id, item_id);
    assert_eq!(ctx.queue.pending_count(JobKind::ExtractMetadata).unwrap(), 2);

    assert!(ctx.resubmit(&Eid::new()).is_err());
}
