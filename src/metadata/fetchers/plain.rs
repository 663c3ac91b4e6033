use crate::config::ScrapeConfig;
use crate::metadata::fetchers::{tier_timeout, FetchOutcome, MetadataFetcher};
use crate::metadata::types::{ExtractError, ExtractionMethod};
use crate::metadata::Deadline;
use crate::scrape;

/// Static document fetch plus Open Graph / Twitter Card parsing.
pub struct PlainFetcher {
    config: ScrapeConfig,
}

impl PlainFetcher {
    pub fn new(config: ScrapeConfig) -> Self {
        Self { config }
    }
}

impl MetadataFetcher for PlainFetcher {
    fn try_extract(&self, url: &str, deadline: &Deadline) -> Result<FetchOutcome, ExtractError> {
        let timeout = tier_timeout(deadline, self.config.static_timeout())?;
        let html = scrape::fetch_document(url, &self.config, timeout)
            .map_err(|e| ExtractError::from_scrape(e, ExtractError::StaticFetchFailed))?;

        if scrape::looks_like_challenge(&html) {
            return Err(ExtractError::Blocked("anti-bot challenge page".into()));
        }

        let meta = scrape::parse_open_graph(&html, url);
        if !meta.has_any_data() {
            return Ok(FetchOutcome::Skip("no open graph tags".into()));
        }

        Ok(FetchOutcome::Data(meta))
    }

    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::HttpStatic
    }
}
