use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use homedir::my_home;
use serde::{Deserialize, Serialize};

use crate::storage::{BackendLocal, StorageManager};

const CONFIG_FILE: &str = "config.yaml";
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_CHROME_PATH: &str = "chromium";
const USER_AGENT_DEFAULT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Retry and retention policy of the job queue.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Retention of a job record from enqueue onwards
    #[serde(default = "default_job_ttl_secs")]
    pub job_ttl_secs: u64,
    /// Retention once a job completed
    #[serde(default = "default_completed_ttl_secs")]
    pub completed_ttl_secs: u64,
    /// How long a blocking dequeue waits before reporting "no job"
    #[serde(default = "default_dequeue_timeout_secs")]
    pub dequeue_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_secs: default_initial_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            job_ttl_secs: default_job_ttl_secs(),
            completed_ttl_secs: default_completed_ttl_secs(),
            dequeue_timeout_secs: default_dequeue_timeout_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff_secs() -> u64 {
    1
}
fn default_max_backoff_secs() -> u64 {
    300
}
fn default_job_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_completed_ttl_secs() -> u64 {
    6 * 60 * 60
}
fn default_dequeue_timeout_secs() -> u64 {
    30
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Upper bound of jobs pulled per kind per cycle
    #[serde(default = "default_jobs_per_cycle")]
    pub jobs_per_cycle: usize,
    /// End-to-end budget for one extraction job
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Number of consumer threads polling the queue
    #[serde(default = "default_consumers")]
    pub consumers: usize,
    /// Jobs left in the processing set longer than this are considered orphaned
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_unavailable_backoff_secs")]
    pub unavailable_backoff_secs: u64,
    /// How often the worker reloads `platforms.yaml`; 0 disables
    #[serde(default = "default_platform_refresh_secs")]
    pub platform_refresh_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            jobs_per_cycle: default_jobs_per_cycle(),
            job_timeout_secs: default_job_timeout_secs(),
            consumers: default_consumers(),
            stale_after_secs: default_stale_after_secs(),
            unavailable_backoff_secs: default_unavailable_backoff_secs(),
            platform_refresh_secs: default_platform_refresh_secs(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    5
}
fn default_jobs_per_cycle() -> usize {
    10
}
fn default_job_timeout_secs() -> u64 {
    60
}
fn default_consumers() -> usize {
    1
}
fn default_stale_after_secs() -> u64 {
    600
}
fn default_unavailable_backoff_secs() -> u64 {
    10
}
fn default_platform_refresh_secs() -> u64 {
    300
}

/// Outbound fetch policy shared by every extraction tier.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScrapeConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_oembed_timeout_secs")]
    pub oembed_timeout_secs: u64,
    #[serde(default = "default_redirect_timeout_secs")]
    pub redirect_timeout_secs: u64,
    #[serde(default = "default_static_timeout_secs")]
    pub static_timeout_secs: u64,
    #[serde(default = "default_title_timeout_secs")]
    pub title_timeout_secs: u64,
    /// Response bodies are truncated at this size before parsing
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,

    /// Enables the rendered-page tier
    #[serde(default = "default_headless")]
    pub headless: bool,
    #[serde(default = "default_chrome_path")]
    pub chrome_path: String,
    #[serde(default = "default_render_timeout_secs")]
    pub render_timeout_secs: u64,
    #[serde(default = "default_navigation_timeout_secs")]
    pub navigation_timeout_secs: u64,
    /// Fixed wait after load for script-driven content
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    #[serde(default = "default_allowed_schemes")]
    pub allowed_schemes: Vec<String>,
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
    #[serde(default = "default_block_private_ips")]
    pub block_private_ips: bool,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            oembed_timeout_secs: default_oembed_timeout_secs(),
            redirect_timeout_secs: default_redirect_timeout_secs(),
            static_timeout_secs: default_static_timeout_secs(),
            title_timeout_secs: default_title_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
            headless: default_headless(),
            chrome_path: default_chrome_path(),
            render_timeout_secs: default_render_timeout_secs(),
            navigation_timeout_secs: default_navigation_timeout_secs(),
            settle_ms: default_settle_ms(),
            allowed_schemes: default_allowed_schemes(),
            blocked_hosts: Vec::new(),
            block_private_ips: default_block_private_ips(),
            accept_invalid_certs: false,
        }
    }
}

impl ScrapeConfig {
    pub fn oembed_timeout(&self) -> Duration {
        Duration::from_secs(self.oembed_timeout_secs)
    }

    pub fn redirect_timeout(&self) -> Duration {
        Duration::from_secs(self.redirect_timeout_secs)
    }

    pub fn static_timeout(&self) -> Duration {
        Duration::from_secs(self.static_timeout_secs)
    }

    pub fn title_timeout(&self) -> Duration {
        Duration::from_secs(self.title_timeout_secs)
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

fn default_user_agent() -> String {
    USER_AGENT_DEFAULT.to_string()
}
fn default_oembed_timeout_secs() -> u64 {
    10
}
fn default_redirect_timeout_secs() -> u64 {
    5
}
fn default_static_timeout_secs() -> u64 {
    10
}
fn default_title_timeout_secs() -> u64 {
    5
}
fn default_max_body_bytes() -> u64 {
    1024 * 1024
}
fn default_headless() -> bool {
    true
}
fn default_chrome_path() -> String {
    DEFAULT_CHROME_PATH.to_string()
}
fn default_render_timeout_secs() -> u64 {
    30
}
fn default_navigation_timeout_secs() -> u64 {
    15
}
fn default_settle_ms() -> u64 {
    3000
}
fn default_allowed_schemes() -> Vec<String> {
    vec!["http".to_string(), "https".to_string()]
}
fn default_block_private_ips() -> bool {
    true
}

/// What to do with links no registered platform claims.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UnknownPlatformMode {
    #[default]
    Permissive,
    Strict,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub scrape: ScrapeConfig,
    #[serde(default)]
    pub unknown_platform_mode: UnknownPlatformMode,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            scrape: ScrapeConfig::default(),
            unknown_platform_mode: UnknownPlatformMode::default(),
            base_path: PathBuf::new(),
        }
    }
}

fn default_redis_url() -> String {
    DEFAULT_REDIS_URL.to_string()
}

/// Resolves the state directory: `KNOK_BASE_PATH` or `~/.local/share/knok`.
pub fn base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("KNOK_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = my_home()
        .context("couldn't resolve home dir")?
        .context("home dir is not set")?;
    Ok(home.join(".local/share/knok"))
}

impl Config {
    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.queue.initial_backoff_secs == 0 {
            bail!("queue.initial_backoff_secs must be greater than 0");
        }
        if self.queue.max_backoff_secs < self.queue.initial_backoff_secs {
            bail!(
                "queue.max_backoff_secs ({}) must not be smaller than queue.initial_backoff_secs ({})",
                self.queue.max_backoff_secs,
                self.queue.initial_backoff_secs
            );
        }
        if self.queue.dequeue_timeout_secs == 0 {
            bail!("queue.dequeue_timeout_secs must be greater than 0");
        }
        if self.worker.jobs_per_cycle == 0 {
            bail!("worker.jobs_per_cycle must be greater than 0");
        }
        if self.worker.consumers == 0 {
            bail!("worker.consumers must be greater than 0");
        }
        if self.worker.job_timeout_secs == 0 {
            bail!("worker.job_timeout_secs must be greater than 0");
        }
        if self.scrape.max_body_bytes == 0 {
            bail!("scrape.max_body_bytes must be greater than 0");
        }
        if self.scrape.allowed_schemes.is_empty() {
            bail!("scrape.allowed_schemes must not be empty");
        }

        Ok(())
    }

    /// Environment overrides win over the file so containers can be configured
    /// without touching `config.yaml`.
    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.is_empty() {
                self.redis_url = url;
            }
        }
        if let Ok(path) = std::env::var("CHROME_PATH") {
            if !path.is_empty() {
                self.scrape.chrome_path = path;
            }
        }
    }

    pub fn load() -> anyhow::Result<Self> {
        Self::load_with(base_path()?)
    }

    pub fn load_with(base_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let base_path = base_path.into();
        let store = BackendLocal::new(&base_path)
            .with_context(|| format!("couldn't create {}", base_path.display()))?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(
                CONFIG_FILE,
                serde_yml::to_string(&Self::default())?.as_bytes(),
            )?;
        }

        let config_str =
            String::from_utf8(store.read(CONFIG_FILE)?).context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path;

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        config.apply_env();

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_creates_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_with(dir.path()).unwrap();

        assert!(dir.path().join(CONFIG_FILE).exists());
        assert_eq!(config.queue, QueueConfig::default());
        assert_eq!(config.worker.jobs_per_cycle, 10);
        assert_eq!(config.unknown_platform_mode, UnknownPlatformMode::Permissive);
    }

    #[test]
    fn test_partial_config_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "queue:\n  max_retries: 2\nunknown_platform_mode: strict\n",
        )
        .unwrap();

        let config = Config::load_with(dir.path()).unwrap();
        assert_eq!(config.queue.max_retries, 2);
        assert_eq!(config.queue.max_backoff_secs, 300);
        assert_eq!(config.unknown_platform_mode, UnknownPlatformMode::Strict);

        // the file was upgraded with the missing fields
        let saved = std::fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap();
        assert!(saved.contains("max_backoff_secs"));
    }

    #[test]
    fn test_invalid_backoff_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "queue:\n  initial_backoff_secs: 10\n  max_backoff_secs: 5\n",
        )
        .unwrap();

        let err = Config::load_with(dir.path()).unwrap_err();
        assert!(err.to_string().contains("max_backoff_secs"));
    }
}
