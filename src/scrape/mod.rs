#[cfg(feature = "headless")]
pub mod headless;

use std::error::Error;
use std::io::Read;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::{Client, Response};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::redirect::Policy;
use reqwest::{StatusCode, Url};
use scraper::{Html, Selector};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::config::ScrapeConfig;
use crate::metadata::Metadata;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static META_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("meta").expect("meta selector"));
static TITLE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("title").expect("title selector"));

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("blocked by fetch policy: {0}")]
    Blocked(String),
    #[error("timed out")]
    Timeout,
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("request failed: {0}")]
    Request(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("browser failed: {0}")]
    Browser(String),
}

impl From<reqwest::Error> for ScrapeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ScrapeError::Timeout
        } else {
            ScrapeError::Request(get_error(&err))
        }
    }
}

fn get_error(error: &reqwest::Error) -> String {
    match error.source() {
        Some(e) => match e.source() {
            Some(e) => e.to_string(),
            None => e.to_string(),
        },
        None => error.to_string(),
    }
}

fn is_ip_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Whether `host` is, or resolves to, a private address. Name lookups run on
/// their own thread because the system resolver has no timeout.
fn is_private_host(host: &str, timeout: Duration) -> Result<bool, ScrapeError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(is_ip_private(&ip));
    }
    if timeout.is_zero() {
        return Err(ScrapeError::Timeout);
    }

    let (tx, rx) = mpsc::channel();
    let name = host.to_string();
    thread::Builder::new()
        .name("knok-resolve".into())
        .spawn(move || {
            let private = (name.as_str(), 80)
                .to_socket_addrs()
                .map(|mut addrs| addrs.any(|addr| is_ip_private(&addr.ip())))
                .unwrap_or(false);
            let _ = tx.send(private);
        })
        .map_err(|e| ScrapeError::Request(format!("couldn't spawn resolver thread: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(private) => Ok(private),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            log::debug!("{host}: lookup timed out");
            Err(ScrapeError::Timeout)
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Ok(false),
    }
}

/// Scheme allowlist, blocked hosts and the private address guard applied to
/// every outbound request. The address lookup counts against `timeout`.
pub fn check_url_policy(
    url: &Url,
    config: &ScrapeConfig,
    timeout: Duration,
) -> Result<(), ScrapeError> {
    if !config.allowed_schemes.iter().any(|s| s == url.scheme()) {
        return Err(ScrapeError::Blocked(format!(
            "scheme '{}' not allowed",
            url.scheme()
        )));
    }

    let host = url.host_str().unwrap_or_default();
    if host.is_empty() {
        return Err(ScrapeError::InvalidUrl(url.to_string()));
    }

    if config.blocked_hosts.iter().any(|h| h.eq_ignore_ascii_case(host)) {
        return Err(ScrapeError::Blocked(format!("host '{host}' is blocked")));
    }

    if config.block_private_ips && is_private_host(host, timeout)? {
        return Err(ScrapeError::Blocked(format!(
            "host '{host}' resolves to a private address"
        )));
    }

    Ok(())
}

/// Parses `url` and applies the fetch policy, returning what is left of
/// `timeout` for the request itself.
fn admit(url: &str, config: &ScrapeConfig, timeout: Duration) -> Result<(Url, Duration), ScrapeError> {
    let started = Instant::now();
    let parsed = parse_url(url)?;
    check_url_policy(&parsed, config, timeout)?;

    let left = timeout.saturating_sub(started.elapsed());
    if left.is_zero() {
        return Err(ScrapeError::Timeout);
    }
    Ok((parsed, left))
}

fn parse_url(url: &str) -> Result<Url, ScrapeError> {
    let url = if url.starts_with("//") {
        format!("https:{url}")
    } else {
        url.to_string()
    };
    Url::parse(&url).map_err(|e| ScrapeError::InvalidUrl(format!("{url}: {e}")))
}

/// Headers of a desktop browser; some sites refuse anything that looks like a bot.
fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8",
        ),
    );
    headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(header::DNT, HeaderValue::from_static("1"));
    headers.insert(header::UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("document"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("none"));
    headers.insert("sec-fetch-user", HeaderValue::from_static("?1"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
    headers
}

fn build_client(
    config: &ScrapeConfig,
    timeout: Duration,
    redirects: Policy,
    headers: HeaderMap,
) -> Result<Client, ScrapeError> {
    Client::builder()
        .user_agent(config.user_agent.as_str())
        .default_headers(headers)
        .redirect(redirects)
        .danger_accept_invalid_certs(config.accept_invalid_certs)
        .timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(10))
        .build()
        .map_err(ScrapeError::from)
}

fn read_capped(resp: Response, limit: u64) -> Result<Vec<u8>, ScrapeError> {
    let mut bytes = Vec::new();
    resp.take(limit)
        .read_to_end(&mut bytes)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut => ScrapeError::Timeout,
            _ => ScrapeError::Request(e.to_string()),
        })?;
    Ok(bytes)
}

/// GETs an html document with browser-like headers. The body is truncated at
/// `max_body_bytes`.
pub fn fetch_document(
    url: &str,
    config: &ScrapeConfig,
    timeout: Duration,
) -> Result<String, ScrapeError> {
    let (parsed, timeout) = admit(url, config, timeout)?;

    let iden = format!("{}{}", parsed.host_str().unwrap_or_default(), parsed.path());
    let client = build_client(config, timeout, Policy::limited(10), browser_headers())?;

    log::debug!("{iden}: requesting");
    let resp = client.get(parsed).send()?;

    let status = resp.status();
    if status != StatusCode::OK {
        log::debug!("{iden}: {status}");
        return Err(ScrapeError::Status(status));
    }

    let bytes = read_capped(resp, config.max_body_bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// GETs and decodes a json document.
pub fn fetch_json<T: DeserializeOwned>(
    url: &str,
    config: &ScrapeConfig,
    timeout: Duration,
) -> Result<T, ScrapeError> {
    let (parsed, timeout) = admit(url, config, timeout)?;

    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
    let client = build_client(config, timeout, Policy::limited(10), headers)?;

    let resp = client.get(parsed).send()?;
    let status = resp.status();
    if status != StatusCode::OK {
        return Err(ScrapeError::Status(status));
    }

    let bytes = read_capped(resp, config.max_body_bytes)?;
    serde_json::from_slice(&bytes).map_err(|e| ScrapeError::Decode(e.to_string()))
}

/// Follows exactly one redirect hop with a HEAD request and returns where it
/// points. Non-redirect responses return the input unchanged.
pub fn resolve_redirect(
    url: &str,
    config: &ScrapeConfig,
    timeout: Duration,
) -> Result<String, ScrapeError> {
    let (parsed, timeout) = admit(url, config, timeout)?;

    let client = build_client(config, timeout, Policy::none(), HeaderMap::new())?;
    let resp = client.head(parsed.clone()).send()?;

    if !resp.status().is_redirection() {
        return Ok(url.to_string());
    }

    let location = resp
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ScrapeError::Decode("redirect without location header".into()))?;

    // relative locations resolve against the short link itself
    let resolved = parsed
        .join(location)
        .map_err(|e| ScrapeError::Decode(format!("bad location '{location}': {e}")))?;

    log::debug!(
        "resolved redirect short_url={url} resolved_url={resolved} status={}",
        resp.status()
    );

    Ok(resolved.to_string())
}

pub fn collapse_whitespace(value: &str) -> String {
    WHITESPACE.replace_all(value.trim(), " ").into_owned()
}

fn resolve_relative(value: String, base_url: &str) -> String {
    if value.starts_with("http://") || value.starts_with("https://") {
        return value;
    }

    match Url::parse(base_url).and_then(|base| base.join(&value)) {
        Ok(u) => u.to_string(),
        Err(_) => value,
    }
}

#[derive(Default)]
struct CardFields {
    title: Option<String>,
    description: Option<String>,
    image: Option<String>,
    site_name: Option<String>,
}

impl CardFields {
    fn set(&mut self, field: &str, value: String) {
        let slot = match field {
            "title" => &mut self.title,
            "description" => &mut self.description,
            "image" => &mut self.image,
            "site_name" => &mut self.site_name,
            _ => return,
        };
        if slot.is_none() {
            *slot = Some(value);
        }
    }
}

/// Open Graph fields of a page. Twitter Card tags fill the same fields only
/// where no Open Graph value was found.
pub fn parse_open_graph(html: &str, url: &str) -> Metadata {
    let document = Html::parse_document(html);

    let mut og = CardFields::default();
    let mut twitter = CardFields::default();

    for element in document.select(&META_SELECTOR) {
        let el = element.value();
        let content = match el.attr("content").map(collapse_whitespace) {
            Some(c) if !c.is_empty() => c,
            _ => continue,
        };

        let key = el.attr("property").or_else(|| el.attr("name")).unwrap_or_default();

        if let Some(field) = key.strip_prefix("og:") {
            og.set(field, content);
        } else if let Some(field) = key.strip_prefix("twitter:") {
            let field = match field {
                "site" => "site_name",
                other => other,
            };
            twitter.set(field, content);
        }
    }

    Metadata {
        title: og.title.or(twitter.title),
        description: og.description.or(twitter.description),
        image: og.image.or(twitter.image).map(|img| resolve_relative(img, url)),
        site_name: og.site_name.or(twitter.site_name),
    }
}

/// Text of the first `<title>` element.
pub fn parse_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let title = document.select(&TITLE_SELECTOR).next()?;
    let text = collapse_whitespace(title.text().next().unwrap_or_default());
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Anti-bot interstitials render fine but carry nothing about the page.
pub fn looks_like_challenge(html: &str) -> bool {
    html.contains("Sorry, you have been blocked")
        || html.contains("Verify you are human by completing the action below")
        || html.contains("<title>Just a moment...</title>")
}
