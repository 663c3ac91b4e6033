use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scrape::ScrapeError;

/// Label used when not even a document title could be obtained.
pub const TITLE_PLACEHOLDER: &str = "Unknown Title";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub site_name: Option<String>,
}

fn present(field: &Option<String>) -> bool {
    field.as_deref().is_some_and(|v| !v.trim().is_empty())
}

impl Metadata {
    pub fn has_title(&self) -> bool {
        present(&self.title) && self.title.as_deref() != Some(TITLE_PLACEHOLDER)
    }

    /// A title plus either a description or an image.
    pub fn is_sufficient(&self) -> bool {
        self.has_title() && (present(&self.description) || present(&self.image))
    }

    pub fn has_any_data(&self) -> bool {
        self.has_title()
            || present(&self.description)
            || present(&self.image)
            || present(&self.site_name)
    }

    /// Fills fields that are still empty from `other`. Never overwrites.
    pub fn fill_missing(&mut self, other: Metadata) {
        if !self.has_title() && present(&other.title) {
            self.title = other.title;
        }
        if !present(&self.description) && present(&other.description) {
            self.description = other.description;
        }
        if !present(&self.image) && present(&other.image) {
            self.image = other.image;
        }
        if !present(&self.site_name) && present(&other.site_name) {
            self.site_name = other.site_name;
        }
    }

    /// Field names present, for logging.
    pub fn describe_fields(&self) -> String {
        [
            ("title", self.has_title()),
            ("description", present(&self.description)),
            ("image", present(&self.image)),
            ("site_name", present(&self.site_name)),
        ]
        .iter()
        .filter(|(_, set)| *set)
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(",")
    }
}

/// Which tier produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Oembed,
    HttpStatic,
    HeadlessBrowser,
    TitleFallback,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::Oembed => "oembed",
            ExtractionMethod::HttpStatic => "http_static",
            ExtractionMethod::HeadlessBrowser => "headless_browser",
            ExtractionMethod::TitleFallback => "title_fallback",
        }
    }

    /// Trust ordering used when a new result meets stored metadata.
    pub fn rank(&self) -> u8 {
        match self {
            ExtractionMethod::Oembed => 3,
            ExtractionMethod::HttpStatic => 2,
            ExtractionMethod::HeadlessBrowser => 1,
            ExtractionMethod::TitleFallback => 0,
        }
    }
}

impl std::fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tier-local failures. None of them aborts an extraction.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("provider fetch failed ({provider}): {source}")]
    ProviderFetchFailed {
        provider: String,
        #[source]
        source: ScrapeError,
    },
    #[error("static fetch failed: {0}")]
    StaticFetchFailed(#[source] ScrapeError),
    #[error("render failed: {0}")]
    RenderFailed(#[source] ScrapeError),
    #[error("title fetch failed: {0}")]
    TitleFetchFailed(String),
    #[error("blocked: {0}")]
    Blocked(String),
    #[error("timed out")]
    Timeout,
}

impl ExtractError {
    /// Maps a fetch failure into the tier's error, keeping policy and timeout
    /// failures distinguishable.
    pub fn from_scrape(err: ScrapeError, wrap: impl FnOnce(ScrapeError) -> ExtractError) -> Self {
        match err {
            ScrapeError::Blocked(reason) => ExtractError::Blocked(reason),
            ScrapeError::Timeout => ExtractError::Timeout,
            other => wrap(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TierStatus {
    Success,
    Skip(String),
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierReport {
    pub tier: ExtractionMethod,
    pub status: TierStatus,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub tiers: Vec<TierReport>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    pub metadata: Metadata,
    pub method: ExtractionMethod,
    pub report: ExtractionReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(title: Option<&str>, description: Option<&str>, image: Option<&str>) -> Metadata {
        Metadata {
            title: title.map(String::from),
            description: description.map(String::from),
            image: image.map(String::from),
            site_name: None,
        }
    }

    #[test]
    fn test_sufficiency() {
        assert!(meta(Some("T"), Some("D"), None).is_sufficient());
        assert!(meta(Some("T"), None, Some("I")).is_sufficient());
        assert!(!meta(Some("T"), None, None).is_sufficient());
        assert!(!meta(None, Some("D"), Some("I")).is_sufficient());
        assert!(!meta(Some(TITLE_PLACEHOLDER), Some("D"), None).is_sufficient());
        assert!(!meta(Some("   "), Some("D"), None).is_sufficient());
    }

    #[test]
    fn test_fill_missing_never_overwrites() {
        let mut base = meta(Some("Base"), None, Some("base.png"));
        base.fill_missing(meta(Some("Other"), Some("Desc"), Some("other.png")));
        assert_eq!(base, meta(Some("Base"), Some("Desc"), Some("base.png")));
    }

    #[test]
    fn test_placeholder_title_is_replaceable() {
        let mut base = meta(Some(TITLE_PLACEHOLDER), None, None);
        base.fill_missing(meta(Some("Real"), None, None));
        assert_eq!(base.title.as_deref(), Some("Real"));
    }

    #[test]
    fn test_method_names() {
        for method in [
            ExtractionMethod::Oembed,
            ExtractionMethod::HttpStatic,
            ExtractionMethod::HeadlessBrowser,
            ExtractionMethod::TitleFallback,
        ] {
            assert_eq!(
                serde_json::to_value(method).unwrap(),
                serde_json::Value::String(method.as_str().to_string())
            );
        }
    }
}
