use std::sync::Arc;

use reqwest::Url;
use serde::Deserialize;

use crate::config::ScrapeConfig;
use crate::metadata::fetchers::{tier_timeout, FetchOutcome, MetadataFetcher};
use crate::metadata::oembed::OembedRegistry;
use crate::metadata::types::{ExtractError, ExtractionMethod, Metadata};
use crate::metadata::Deadline;
use crate::scrape::{self, ScrapeError};

/// Hosts whose links only redirect to the real resource.
pub const SHORT_LINK_DOMAINS: &[&str] = &[
    "on.soundcloud.com",
    "spotify.link",
    "youtu.be",
    "spoti.fi",
    "amzn.to",
    "band.link",
];

#[derive(Debug, Deserialize)]
struct OembedResponse {
    #[serde(rename = "type")]
    oembed_type: Option<String>,
    title: Option<String>,
    author_name: Option<String>,
    provider_name: Option<String>,
    thumbnail_url: Option<String>,
    description: Option<String>,
}

pub struct OembedFetcher {
    registry: Arc<OembedRegistry>,
    config: ScrapeConfig,
    short_link_domains: Vec<String>,
}

impl OembedFetcher {
    pub fn new(registry: Arc<OembedRegistry>, config: ScrapeConfig) -> Self {
        Self {
            registry,
            config,
            short_link_domains: SHORT_LINK_DOMAINS.iter().map(|d| d.to_string()).collect(),
        }
    }

    pub fn with_short_link_domains(mut self, domains: Vec<String>) -> Self {
        self.short_link_domains = domains;
        self
    }

    fn is_short_link(&self, url: &str) -> bool {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
            .is_some_and(|host| self.short_link_domains.iter().any(|d| *d == host))
    }

    /// Short links are resolved one hop so they can match a provider scheme.
    /// Resolution failures keep the original link.
    fn resolve_short_link(&self, url: &str, deadline: &Deadline) -> String {
        if !self.is_short_link(url) {
            return url.to_string();
        }

        let Some(timeout) = deadline.clamp(self.config.redirect_timeout()) else {
            return url.to_string();
        };

        match scrape::resolve_redirect(url, &self.config, timeout) {
            Ok(resolved) => {
                if resolved != url {
                    log::info!("resolved short link short_url={url} canonical_url={resolved}");
                }
                resolved
            }
            Err(e) => {
                log::debug!("failed to resolve short link url={url} err={e}");
                url.to_string()
            }
        }
    }
}

/// Endpoint URL with `{format}` substituted and `url`/`format` query params set.
fn build_endpoint_url(endpoint: &str, resource_url: &str) -> Result<String, ScrapeError> {
    let endpoint = endpoint.replace("{format}", "json");
    let mut parsed = Url::parse(&endpoint)
        .map_err(|e| ScrapeError::InvalidUrl(format!("{endpoint}: {e}")))?;

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| k != "url" && k != "format")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    parsed
        .query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("format", "json")
        .append_pair("url", resource_url);

    Ok(parsed.to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn oembed_to_metadata(resp: OembedResponse, original_url: &str) -> Metadata {
    let author = non_empty(resp.author_name);
    let provider = non_empty(resp.provider_name);

    let description = non_empty(resp.description)
        .or_else(|| author.as_ref().map(|a| format!("By {a}")))
        .or_else(|| Some(original_url.to_string()));

    Metadata {
        title: non_empty(resp.title),
        description,
        image: non_empty(resp.thumbnail_url),
        site_name: provider.or(author),
    }
}

impl MetadataFetcher for OembedFetcher {
    fn try_extract(&self, url: &str, deadline: &Deadline) -> Result<FetchOutcome, ExtractError> {
        let resolved = self.resolve_short_link(url, deadline);

        let provider = match self.registry.match_url(&resolved) {
            Some(p) => p,
            None => return Ok(FetchOutcome::Skip("no matching oembed provider".into())),
        };

        let provider_err = |source: ScrapeError| ExtractError::ProviderFetchFailed {
            provider: provider.name.clone(),
            source,
        };

        let endpoint_url = build_endpoint_url(&provider.endpoint, &resolved).map_err(provider_err)?;
        log::debug!("oembed request provider={} endpoint={endpoint_url}", provider.name);

        let timeout = tier_timeout(deadline, self.config.oembed_timeout())?;
        let resp: OembedResponse = scrape::fetch_json(&endpoint_url, &self.config, timeout)
            .map_err(|e| ExtractError::from_scrape(e, provider_err))?;

        if let Some(kind) = &resp.oembed_type {
            log::debug!("oembed response provider={} type={kind}", provider.name);
        }

        Ok(FetchOutcome::Data(oembed_to_metadata(resp, url)))
    }

    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Oembed
    }
}
