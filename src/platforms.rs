use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{BackendLocal, StorageManager};

pub const PLATFORM_UNKNOWN: &str = "unknown";
pub const PLATFORMS_FILE: &str = "platforms.yaml";

/// A recognized content source, identified by host patterns.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Platform {
    pub id: String,
    pub name: String,
    pub url_patterns: Vec<String>,
    /// Higher wins when several platforms match the same link
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Platform {
    fn builtin(id: &str, name: &str, url_patterns: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            url_patterns: url_patterns.iter().map(|p| p.to_string()).collect(),
            priority: 0,
            enabled: true,
        }
    }
}

/// Platforms used whenever the configured source can't be read.
pub fn default_platforms() -> Vec<Platform> {
    vec![
        Platform::builtin(
            "youtube",
            "YouTube",
            &["youtube.com", "youtu.be", "m.youtube.com", "music.youtube.com"],
        ),
        Platform::builtin(
            "soundcloud",
            "SoundCloud",
            &["soundcloud.com", "on.soundcloud.com", "m.soundcloud.com"],
        ),
        Platform::builtin("mixcloud", "Mixcloud", &["mixcloud.com"]),
        Platform::builtin("bandcamp", "Bandcamp", &["bandcamp.com"]),
        Platform::builtin(
            "spotify",
            "Spotify",
            &[
                "spotify.com",
                "open.spotify.com",
                "play.spotify.com",
                "link.tospotify.com",
            ],
        ),
        Platform::builtin(
            "apple_music",
            "Apple Music",
            &["music.apple.com", "itunes.apple.com"],
        ),
        Platform::builtin("nts", "NTS Radio", &["nts.live"]),
        Platform::builtin("dublab", "Dublab", &["dublab.com"]),
        Platform::builtin("noods", "Noods Radio", &["noodsradio.com"]),
        Platform::builtin("rinse_fm", "Rinse FM", &["rinse.fm", "www.rinse.fm"]),
        Platform::builtin("tidal", "Tidal", &["tidal.com", "listen.tidal.com"]),
        Platform::builtin("deezer", "Deezer", &["deezer.com", "deezer.page.link"]),
    ]
}

/// Backing store for platform definitions.
pub trait PlatformSource: Send + Sync {
    fn get_all_platforms(&self) -> anyhow::Result<Vec<Platform>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PlatformsFile {
    #[serde(default)]
    platforms: Vec<Platform>,
}

/// Reads `platforms.yaml` from the base directory.
pub struct YamlPlatformSource {
    store: BackendLocal,
}

impl YamlPlatformSource {
    pub fn new(store: BackendLocal) -> Self {
        Self { store }
    }
}

impl PlatformSource for YamlPlatformSource {
    fn get_all_platforms(&self) -> anyhow::Result<Vec<Platform>> {
        if !self.store.exists(PLATFORMS_FILE) {
            anyhow::bail!("{PLATFORMS_FILE} not found");
        }

        let data = self.store.read(PLATFORMS_FILE)?;
        let file: PlatformsFile = serde_yml::from_str(std::str::from_utf8(&data)?)?;
        Ok(file.platforms)
    }
}

/// Fixed list, mostly useful for tests and for running without a base dir.
pub struct StaticPlatformSource(pub Vec<Platform>);

impl PlatformSource for StaticPlatformSource {
    fn get_all_platforms(&self) -> anyhow::Result<Vec<Platform>> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("platforms not loaded yet")]
    NotLoaded,
    #[error("platform not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOrigin {
    Source,
    Defaults,
}

#[derive(Default)]
struct RegistryState {
    /// Enabled platforms in registration order
    platforms: Vec<Platform>,
    loaded: bool,
}

/// In-memory cache of platform definitions with an explicit load/refresh lifecycle.
pub struct PlatformRegistry {
    source: Box<dyn PlatformSource>,
    state: RwLock<RegistryState>,
}

impl PlatformRegistry {
    pub fn new(source: Box<dyn PlatformSource>) -> Self {
        Self {
            source,
            state: RwLock::new(RegistryState::default()),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Fetches platforms from the source, falling back to the built-in set when
    /// the source is unavailable.
    pub fn load(&self) -> LoadOrigin {
        let (platforms, origin) = match self.source.get_all_platforms() {
            Ok(platforms) => {
                log::info!("platforms loaded from source total={}", platforms.len());
                (platforms, LoadOrigin::Source)
            }
            Err(e) => {
                log::warn!("failed to load platforms, using built-in defaults err={e}");
                (default_platforms(), LoadOrigin::Defaults)
            }
        };

        let enabled: Vec<Platform> = platforms.into_iter().filter(|p| p.enabled).collect();
        log::debug!("platforms enabled={}", enabled.len());

        let mut state = self.write_state();
        state.platforms = enabled;
        state.loaded = true;

        origin
    }

    pub fn refresh(&self) -> LoadOrigin {
        log::info!("refreshing platform configuration");
        self.load()
    }

    pub fn is_loaded(&self) -> bool {
        self.read_state().loaded
    }

    /// Enabled platforms, highest priority first. Equal priorities keep
    /// registration order.
    pub fn get_all_by_priority(&self) -> Result<Vec<Platform>, PlatformError> {
        let state = self.read_state();
        if !state.loaded {
            return Err(PlatformError::NotLoaded);
        }

        let mut platforms = state.platforms.clone();
        platforms.sort_by_key(|p| std::cmp::Reverse(p.priority));
        Ok(platforms)
    }

    pub fn get(&self, id: &str) -> Result<Platform, PlatformError> {
        let state = self.read_state();
        if !state.loaded {
            return Err(PlatformError::NotLoaded);
        }
        state
            .platforms
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(id.to_string()))
    }

    pub fn count(&self) -> usize {
        self.read_state().platforms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenSource;

    impl PlatformSource for BrokenSource {
        fn get_all_platforms(&self) -> anyhow::Result<Vec<Platform>> {
            anyhow::bail!("connection refused")
        }
    }

    fn platform(id: &str, priority: i32, enabled: bool) -> Platform {
        Platform {
            id: id.to_string(),
            name: id.to_string(),
            url_patterns: vec![format!("{id}.com")],
            priority,
            enabled,
        }
    }

    #[test]
    fn test_not_loaded_until_load() {
        let registry = PlatformRegistry::new(Box::new(StaticPlatformSource(vec![])));
        assert!(!registry.is_loaded());
        assert_eq!(registry.get_all_by_priority(), Err(PlatformError::NotLoaded));

        registry.load();
        assert!(registry.is_loaded());
        assert_eq!(registry.get_all_by_priority().unwrap(), vec![]);
    }

    #[test]
    fn test_falls_back_to_defaults() {
        let registry = PlatformRegistry::new(Box::new(BrokenSource));
        assert_eq!(registry.load(), LoadOrigin::Defaults);
        assert_eq!(registry.count(), default_platforms().len());
        assert_eq!(registry.get("spotify").unwrap().name, "Spotify");
    }

    #[test]
    fn test_priority_order_is_stable() {
        let registry = PlatformRegistry::new(Box::new(StaticPlatformSource(vec![
            platform("a", 0, true),
            platform("b", 5, true),
            platform("c", 0, true),
            platform("d", 9, false),
            platform("e", 5, true),
        ])));
        registry.load();

        let ids: Vec<String> = registry
            .get_all_by_priority()
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["b", "e", "a", "c"]);
    }

    #[test]
    fn test_yaml_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackendLocal::new(dir.path()).unwrap();
        let source = YamlPlatformSource::new(store.clone());
        assert!(source.get_all_platforms().is_err());

        store
            .write(
                PLATFORMS_FILE,
                br#"
platforms:
  - id: nts
    name: NTS Radio
    url_patterns: [nts.live]
    priority: 3
  - id: old
    name: Old
    url_patterns: [old.example]
    enabled: false
"#,
            )
            .unwrap();

        let registry = PlatformRegistry::new(Box::new(source));
        assert_eq!(registry.load(), LoadOrigin::Source);
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get("nts").unwrap().priority, 3);
    }
}
