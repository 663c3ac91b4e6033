mod ingest;
mod worker;

use std::sync::Arc;

use crate::app::AppContext;
use crate::config::{Config, ScrapeConfig};
use crate::items::BackendJson;
use crate::platforms::{default_platforms, PlatformRegistry, StaticPlatformSource};
use crate::queue::memory::MemoryQueue;

/// Fetch policy that allows the loopback stub server and never renders.
pub fn loopback_scrape_config() -> ScrapeConfig {
    ScrapeConfig {
        block_private_ips: false,
        headless: false,
        oembed_timeout_secs: 2,
        redirect_timeout_secs: 2,
        static_timeout_secs: 2,
        title_timeout_secs: 2,
        ..Default::default()
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.scrape = loopback_scrape_config();
    config.worker.poll_interval_secs = 1;
    config.worker.job_timeout_secs = 10;
    config
}

pub fn loaded_registry() -> Arc<PlatformRegistry> {
    let registry = Arc::new(PlatformRegistry::new(Box::new(StaticPlatformSource(
        default_platforms(),
    ))));
    registry.load();
    registry
}

/// In-memory queue and items with the built-in platforms.
pub fn memory_context(config: Config) -> AppContext {
    let queue = Arc::new(MemoryQueue::new(&config.queue));
    AppContext::with_parts(
        config,
        loaded_registry(),
        queue,
        Arc::new(BackendJson::in_memory()),
    )
    .expect("failed to build test context")
}
