use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl NormalizeError {
    fn invalid(url: &str, reason: impl ToString) -> Self {
        NormalizeError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Query parameters that only carry attribution and never change the resource.
/// Every `utm_*` key is dropped as well.
const TRACKING_PARAMS: &[&str] = &[
    "si", "fbclid", "gclid", "ref", "source", "msclkid", "igshid",
];

fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key)
}

/// Canonical form of a link used for deduplication and platform matching.
///
/// - adds `https://` when the scheme is missing and the input looks like a domain
/// - lowercases the host and strips a leading `www.`
/// - removes tracking parameters
/// - re-encodes the remaining query sorted by key
pub fn normalize_url(raw: &str) -> Result<String, NormalizeError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(NormalizeError::invalid(raw, "empty url"));
    }

    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else if raw.contains('.') {
        format!("https://{raw}")
    } else {
        return Err(NormalizeError::invalid(raw, "no domain found"));
    };

    let mut url = Url::parse(&with_scheme).map_err(|e| NormalizeError::invalid(raw, e))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(NormalizeError::invalid(
            raw,
            format!("unsupported scheme '{}'", url.scheme()),
        ));
    }

    let host = match url.host_str() {
        Some(h) if !h.is_empty() => h.to_lowercase(),
        _ => return Err(NormalizeError::invalid(raw, "no host found")),
    };

    if let Some(stripped) = host.strip_prefix("www.") {
        if stripped.is_empty() {
            return Err(NormalizeError::invalid(raw, "no host found"));
        }
        url.set_host(Some(stripped))
            .map_err(|e| NormalizeError::invalid(raw, e))?;
    }

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    // stable: repeated keys keep their relative order
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter())
            .finish();
        url.set_query(Some(&query));
    }

    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adds_scheme_and_lowercases_host() {
        assert_eq!(
            normalize_url("YOUTUBE.com/watch?v=1&utm_source=x").unwrap(),
            "https://youtube.com/watch?v=1"
        );
    }

    #[test]
    fn test_strips_www() {
        assert_eq!(
            normalize_url("https://www.mixcloud.com/nts/show/").unwrap(),
            "https://mixcloud.com/nts/show/"
        );
    }

    #[test]
    fn test_tracking_params_do_not_change_identity() {
        let a = normalize_url("https://open.spotify.com/track/xyz?si=abc&utm_medium=share").unwrap();
        let b = normalize_url("https://open.spotify.com/track/xyz?fbclid=1&gclid=2&ref=3").unwrap();
        let c = normalize_url("https://open.spotify.com/track/xyz").unwrap();
        assert_eq!(a, c);
        assert_eq!(b, c);
    }

    #[test]
    fn test_query_order_is_stable() {
        let a = normalize_url("https://example.com/p?b=2&a=1").unwrap();
        let b = normalize_url("https://example.com/p?a=1&b=2&utm_campaign=x").unwrap();
        assert_eq!(a, "https://example.com/p?a=1&b=2");
        assert_eq!(a, b);
    }

    #[test]
    fn test_keeps_path_case_and_fragment() {
        assert_eq!(
            normalize_url("https://Example.com/Wiki/Page_(x)#Top").unwrap(),
            "https://example.com/Wiki/Page_(x)#Top"
        );
    }

    #[test]
    fn test_rejects_invalid_input() {
        assert!(normalize_url("   ").is_err());
        assert!(normalize_url("nodots").is_err());
        assert!(normalize_url("ftp://example.com/file").is_err());
        assert!(matches!(
            normalize_url(""),
            Err(NormalizeError::InvalidUrl { .. })
        ));
    }
}
