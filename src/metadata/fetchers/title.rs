use crate::config::ScrapeConfig;
use crate::metadata::fetchers::{tier_timeout, FetchOutcome, MetadataFetcher};
use crate::metadata::types::{ExtractError, ExtractionMethod, Metadata};
use crate::metadata::Deadline;
use crate::scrape;

/// Last resort: just the document `<title>`.
pub struct TitleFetcher {
    config: ScrapeConfig,
}

impl TitleFetcher {
    pub fn new(config: ScrapeConfig) -> Self {
        Self { config }
    }
}

impl MetadataFetcher for TitleFetcher {
    fn try_extract(&self, url: &str, deadline: &Deadline) -> Result<FetchOutcome, ExtractError> {
        let timeout = tier_timeout(deadline, self.config.title_timeout())?;
        let html = scrape::fetch_document(url, &self.config, timeout)
            .map_err(|e| ExtractError::from_scrape(e, |e| ExtractError::TitleFetchFailed(e.to_string())))?;

        // the interstitial's own title says nothing about the page
        if scrape::looks_like_challenge(&html) {
            return Err(ExtractError::Blocked("anti-bot challenge page".into()));
        }

        let title = scrape::parse_title(&html)
            .ok_or_else(|| ExtractError::TitleFetchFailed("no title tag found".into()))?;

        Ok(FetchOutcome::Data(Metadata {
            title: Some(title),
            ..Default::default()
        }))
    }

    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::TitleFallback
    }
}
