use std::sync::Arc;

use anyhow::{Context, Result};

use crate::{
    config::Config,
    detector::Detector,
    items::{BackendJson, ItemRepository},
    metadata::{OembedRegistry, Pipeline},
    platforms::{PlatformRegistry, YamlPlatformSource},
    queue::{memory::MemoryQueue, redis_queue::RedisQueue, JobQueue},
    storage::BackendLocal,
};

/// Shared services, built once per process and handed to the worker and CLI.
pub struct AppContext {
    pub config: Arc<Config>,
    pub registry: Arc<PlatformRegistry>,
    pub detector: Arc<Detector>,
    pub queue: Arc<dyn JobQueue>,
    pub items: Arc<dyn ItemRepository>,
    pub pipeline: Arc<Pipeline>,
}

impl AppContext {
    /// Production wiring: Redis queue, item file and `platforms.yaml` under
    /// the base path. `memory` swaps both stores for in-process ones.
    pub fn build(config: Config, memory: bool) -> Result<Self> {
        let store = BackendLocal::new(config.base_path())
            .with_context(|| format!("failed to open {:?}", config.base_path()))?;

        let (queue, items): (Arc<dyn JobQueue>, Arc<dyn ItemRepository>) = if memory {
            log::info!("using in-memory queue and item store");
            (
                Arc::new(MemoryQueue::new(&config.queue)),
                Arc::new(BackendJson::in_memory()),
            )
        } else {
            let queue = RedisQueue::connect(&config.redis_url, &config.queue)
                .context("failed to connect to the queue")?;
            let items = BackendJson::load(store.clone()).context("failed to load items")?;
            (Arc::new(queue), Arc::new(items))
        };

        let registry = Arc::new(PlatformRegistry::new(Box::new(YamlPlatformSource::new(store))));
        registry.load();

        Self::with_parts(config, registry, queue, items)
    }

    pub fn with_parts(
        config: Config,
        registry: Arc<PlatformRegistry>,
        queue: Arc<dyn JobQueue>,
        items: Arc<dyn ItemRepository>,
    ) -> Result<Self> {
        let oembed = Arc::new(OembedRegistry::bundled().context("failed to load oembed providers")?);
        log::info!("loaded oembed providers count={}", oembed.provider_count());

        let pipeline = Arc::new(Pipeline::from_config(&config, oembed));
        let detector = Arc::new(Detector::new(registry.clone()));

        Ok(Self {
            config: Arc::new(config),
            registry,
            detector,
            queue,
            items,
            pipeline,
        })
    }

    /// Reloads platforms from their source and recompiles detection patterns.
    pub fn refresh_platforms(&self) {
        self.registry.refresh();
        self.detector.refresh();
    }
}
