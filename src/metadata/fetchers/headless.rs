use crate::config::ScrapeConfig;
use crate::metadata::fetchers::{FetchOutcome, MetadataFetcher};
use crate::metadata::types::{ExtractError, ExtractionMethod};
use crate::metadata::Deadline;

/// Renders the page in a headless browser and re-runs the Open Graph parser on
/// the rendered document.
pub struct HeadlessFetcher {
    #[cfg_attr(not(feature = "headless"), allow(dead_code))]
    config: ScrapeConfig,
}

impl HeadlessFetcher {
    pub fn new(config: ScrapeConfig) -> Self {
        Self { config }
    }
}

impl MetadataFetcher for HeadlessFetcher {
    #[cfg(feature = "headless")]
    fn try_extract(&self, url: &str, deadline: &Deadline) -> Result<FetchOutcome, ExtractError> {
        use crate::metadata::fetchers::tier_timeout;
        use crate::scrape;

        let budget = tier_timeout(deadline, self.config.render_timeout())?;
        let html = scrape::headless::render_page(url, &self.config, budget)
            .map_err(|e| ExtractError::from_scrape(e, ExtractError::RenderFailed))?;

        if scrape::looks_like_challenge(&html) {
            return Err(ExtractError::Blocked("anti-bot challenge page".into()));
        }

        let meta = scrape::parse_open_graph(&html, url);
        if !meta.has_any_data() {
            return Ok(FetchOutcome::Skip("no open graph tags after render".into()));
        }

        Ok(FetchOutcome::Data(meta))
    }

    #[cfg(not(feature = "headless"))]
    fn try_extract(&self, _url: &str, _deadline: &Deadline) -> Result<FetchOutcome, ExtractError> {
        Ok(FetchOutcome::Skip("built without headless support".into()))
    }

    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::HeadlessBrowser
    }
}
