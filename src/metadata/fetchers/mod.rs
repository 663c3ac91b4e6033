pub mod headless;
pub mod oembed;
pub mod plain;
pub mod title;

use std::time::Duration;

use crate::metadata::types::{ExtractError, ExtractionMethod, Metadata};
use crate::metadata::Deadline;

pub enum FetchOutcome {
    Data(Metadata),
    /// The tier doesn't apply to this link; not a failure
    Skip(String),
}

/// One strategy in the extraction fallback chain.
pub trait MetadataFetcher: Send + Sync {
    /// Attempt to fetch metadata for `url` without outliving `deadline`.
    fn try_extract(&self, url: &str, deadline: &Deadline) -> Result<FetchOutcome, ExtractError>;

    /// Tier this fetcher implements, for logging and the extraction report.
    fn method(&self) -> ExtractionMethod;
}

/// The tier's own timeout, cut down to what's left of the job budget.
pub(crate) fn tier_timeout(deadline: &Deadline, own: Duration) -> Result<Duration, ExtractError> {
    deadline.clamp(own).ok_or(ExtractError::Timeout)
}
