pub mod fetchers;
pub mod oembed;
pub mod types;

use std::sync::Arc;
use std::time::{Duration, Instant};

pub use oembed::OembedRegistry;
pub use types::{
    ExtractError, Extraction, ExtractionMethod, ExtractionReport, Metadata, TierReport,
    TierStatus, TITLE_PLACEHOLDER,
};

use crate::config::Config;
use fetchers::{FetchOutcome, MetadataFetcher};

/// Point in time after which no new network work is started for a job.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// `timeout` limited to the remaining budget; `None` once expired.
    pub fn clamp(&self, timeout: Duration) -> Option<Duration> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            None
        } else {
            Some(timeout.min(remaining))
        }
    }
}

/// Ordered extraction tiers plus the label fallback that always answers.
pub struct Pipeline {
    tiers: Vec<Box<dyn MetadataFetcher>>,
    fallback: Box<dyn MetadataFetcher>,
    job_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        tiers: Vec<Box<dyn MetadataFetcher>>,
        fallback: Box<dyn MetadataFetcher>,
        job_timeout: Duration,
    ) -> Self {
        Self {
            tiers,
            fallback,
            job_timeout,
        }
    }

    /// oEmbed, static parse, rendered parse (when enabled), then `<title>`.
    pub fn from_config(config: &Config, registry: Arc<OembedRegistry>) -> Self {
        let scrape = &config.scrape;

        let mut tiers: Vec<Box<dyn MetadataFetcher>> = vec![
            Box::new(fetchers::oembed::OembedFetcher::new(registry, scrape.clone())),
            Box::new(fetchers::plain::PlainFetcher::new(scrape.clone())),
        ];
        if scrape.headless {
            tiers.push(Box::new(fetchers::headless::HeadlessFetcher::new(
                scrape.clone(),
            )));
        }

        Self::new(
            tiers,
            Box::new(fetchers::title::TitleFetcher::new(scrape.clone())),
            Duration::from_secs(config.worker.job_timeout_secs),
        )
    }

    pub fn extract(&self, url: &str) -> Extraction {
        self.extract_with_deadline(url, Deadline::after(self.job_timeout))
    }

    /// Runs the tiers in order until the merged result is sufficient. Never
    /// fails: the worst case is the placeholder title with the link as
    /// description.
    pub fn extract_with_deadline(&self, url: &str, deadline: Deadline) -> Extraction {
        let started = Instant::now();
        let mut report = ExtractionReport::default();
        let mut merged = Metadata::default();

        for tier in &self.tiers {
            let method = tier.method();

            if deadline.is_expired() {
                log::info!("tier={method} outcome=skip reason=budget_exhausted");
                report.tiers.push(TierReport {
                    tier: method,
                    status: TierStatus::Skip("job budget exhausted".into()),
                    duration_ms: 0,
                });
                continue;
            }

            if let Some(meta) = run_tier(tier.as_ref(), url, &deadline, &mut report) {
                merged.fill_missing(meta);

                if merged.has_title() && merged.description.is_none() {
                    merged.description = Some(url.to_string());
                }

                if merged.is_sufficient() {
                    report.duration_ms = started.elapsed().as_millis() as u64;
                    log::info!(
                        "extraction complete url={url} method={method} duration_ms={}",
                        report.duration_ms
                    );
                    return Extraction {
                        metadata: merged,
                        method,
                        report,
                    };
                }
            }
        }

        if deadline.is_expired() {
            report.tiers.push(TierReport {
                tier: self.fallback.method(),
                status: TierStatus::Skip("job budget exhausted".into()),
                duration_ms: 0,
            });
        } else if let Some(meta) = run_tier(self.fallback.as_ref(), url, &deadline, &mut report) {
            merged.fill_missing(meta);
        }

        if !merged.has_title() {
            merged.title = Some(TITLE_PLACEHOLDER.to_string());
        }
        if merged.description.is_none() {
            merged.description = Some(url.to_string());
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        log::info!(
            "extraction complete url={url} method={} duration_ms={}",
            ExtractionMethod::TitleFallback,
            report.duration_ms
        );

        Extraction {
            metadata: merged,
            method: ExtractionMethod::TitleFallback,
            report,
        }
    }
}

fn run_tier(
    tier: &dyn MetadataFetcher,
    url: &str,
    deadline: &Deadline,
    report: &mut ExtractionReport,
) -> Option<Metadata> {
    let method = tier.method();
    let started = Instant::now();
    let outcome = tier.try_extract(url, deadline);
    let duration_ms = started.elapsed().as_millis() as u64;

    let (status, meta) = match outcome {
        Ok(FetchOutcome::Data(m)) => {
            log::info!(
                "tier={method} outcome=success fields=[{}] duration_ms={duration_ms}",
                m.describe_fields()
            );
            (TierStatus::Success, Some(m))
        }
        Ok(FetchOutcome::Skip(reason)) => {
            log::info!("tier={method} outcome=skip reason=\"{reason}\" duration_ms={duration_ms}");
            (TierStatus::Skip(reason), None)
        }
        Err(e) => {
            log::warn!("tier={method} outcome=error err={e} duration_ms={duration_ms}");
            (TierStatus::Error(e.to_string()), None)
        }
    };

    report.tiers.push(TierReport {
        tier: method,
        status,
        duration_ms,
    });

    meta
}
