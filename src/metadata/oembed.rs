use regex::Regex;
use serde::Deserialize;

/// Provider catalog in the oembed.com `providers.json` shape, pinned at build time.
const BUNDLED_PROVIDERS: &str = include_str!("providers.json");

/// Extra scheme for plain `youtube.com/watch` links, which the public catalog
/// only lists with a subdomain.
const YOUTUBE_EXTRA_SCHEME: &str = "https://youtube.com/watch*";

#[derive(Debug, Deserialize)]
struct RawProvider {
    provider_name: String,
    #[serde(default)]
    endpoints: Vec<RawEndpoint>,
}

#[derive(Debug, Deserialize)]
struct RawEndpoint {
    #[serde(default)]
    schemes: Vec<String>,
    #[serde(default)]
    url: String,
}

#[derive(Debug, Clone)]
pub struct OembedProvider {
    pub name: String,
    /// Endpoint template, may contain `{format}`
    pub endpoint: String,
    schemes: Vec<Regex>,
}

impl OembedProvider {
    pub fn matches(&self, url: &str) -> bool {
        self.schemes.iter().any(|s| s.is_match(url))
    }

    pub fn scheme_count(&self) -> usize {
        self.schemes.len()
    }
}

/// Compiled provider catalog. Immutable after construction.
#[derive(Debug, Clone)]
pub struct OembedRegistry {
    providers: Vec<OembedProvider>,
}

/// `*` matches any run of characters, `?` any single character; everything
/// else is literal. The result is anchored on both ends.
pub fn scheme_to_regex(scheme: &str) -> String {
    let pattern = regex::escape(scheme)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");
    format!("^{pattern}$")
}

impl OembedRegistry {
    pub fn bundled() -> Result<Self, serde_json::Error> {
        Self::from_json(BUNDLED_PROVIDERS)
    }

    /// Builds the registry from a provider catalog. Only the first endpoint of
    /// each provider is used; providers without a usable scheme are dropped.
    pub fn from_json(catalog: &str) -> Result<Self, serde_json::Error> {
        let raw: Vec<RawProvider> = serde_json::from_str(catalog)?;
        let mut providers = Vec::with_capacity(raw.len());

        for provider in raw {
            let Some(endpoint) = provider.endpoints.into_iter().next() else {
                continue;
            };
            if endpoint.url.is_empty() {
                continue;
            }

            let mut schemes = endpoint.schemes;
            if provider.provider_name == "YouTube" {
                schemes.push(YOUTUBE_EXTRA_SCHEME.to_string());
            }

            let compiled: Vec<Regex> = schemes
                .iter()
                .filter_map(|s| match Regex::new(&scheme_to_regex(s)) {
                    Ok(r) => Some(r),
                    Err(e) => {
                        log::debug!("skipping oembed scheme provider={} scheme={s} err={e}", provider.provider_name);
                        None
                    }
                })
                .collect();

            if compiled.is_empty() {
                continue;
            }

            providers.push(OembedProvider {
                name: provider.provider_name,
                endpoint: endpoint.url,
                schemes: compiled,
            });
        }

        Ok(Self { providers })
    }

    /// First provider, in catalog order, with a scheme matching `url`.
    pub fn match_url(&self, url: &str) -> Option<&OembedProvider> {
        self.providers.iter().find(|p| p.matches(url))
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub fn provider(&self, name: &str) -> Option<&OembedProvider> {
        self.providers.iter().find(|p| p.name == name)
    }
}
