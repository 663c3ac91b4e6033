use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::normalize::normalize_url;
use crate::platforms::{Platform, PlatformRegistry, PLATFORM_UNKNOWN};

static MARKDOWN_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").expect("markdown link regex"));

static SUPPRESSED_EMBED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<(https?://[^>]+)>").expect("suppressed embed regex"));

static GENERIC_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)https?://[\w\-]+(?:\.[\w\-]+)+(?::\d+)?(?:[/?#][^\s<>\[\]]*)?")
        .expect("generic url regex")
});

const TRAILING_PUNCTUATION: &[char] = &['.', ',', '!', '?', ';', ':', '"', '\''];

/// A link found in message text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DetectedUrl {
    pub url: String,
    pub platform: String,
}

struct CompiledPattern {
    regex: Regex,
    platform: String,
}

#[derive(Default)]
struct Patterns {
    /// In platform priority order, then pattern order
    compiled: Vec<CompiledPattern>,
    /// Protocol-less `host/path` matcher limited to registered hosts
    bare_domain: Option<Regex>,
}

/// Finds platform links in free text.
pub struct Detector {
    registry: Arc<PlatformRegistry>,
    patterns: RwLock<Patterns>,
}

impl Detector {
    pub fn new(registry: Arc<PlatformRegistry>) -> Self {
        let detector = Self {
            registry,
            patterns: RwLock::new(Patterns::default()),
        };
        detector.refresh();
        detector
    }

    fn read_patterns(&self) -> RwLockReadGuard<'_, Patterns> {
        self.patterns.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Rebuilds the compiled patterns from the registry's current contents.
    pub fn refresh(&self) {
        let patterns = match self.registry.get_all_by_priority() {
            Ok(platforms) => build_patterns(&platforms),
            Err(e) => {
                log::warn!("platform patterns not built err={e}");
                Patterns::default()
            }
        };

        log::info!(
            "built url detection patterns pattern_count={}",
            patterns.compiled.len()
        );

        *self.patterns.write().unwrap_or_else(|e| e.into_inner()) = patterns;
    }

    /// Scans `content` for links and returns them normalized, deduplicated and
    /// tagged with a platform id (`unknown` when nothing matched).
    pub fn detect_urls(&self, content: &str) -> Vec<DetectedUrl> {
        let patterns = self.read_patterns();
        let mut found = Found::default();

        // markdown links [label](url)
        for caps in MARKDOWN_LINK.captures_iter(content) {
            if let Some(target) = caps.get(2) {
                found.add(&patterns, target.as_str());
            }
        }
        let text = MARKDOWN_LINK.replace_all(content, " ");

        // suppressed embeds <url>
        for caps in SUPPRESSED_EMBED.captures_iter(&text) {
            if let Some(target) = caps.get(1) {
                found.add(&patterns, target.as_str());
            }
        }
        let text = SUPPRESSED_EMBED.replace_all(&text, " ").into_owned();

        let wrapped = if text.contains('\n') {
            wrapped_links(&text)
        } else {
            Vec::new()
        };
        let wrap_points: HashSet<usize> = wrapped
            .iter()
            .flat_map(|w| w.line_ends.iter().copied())
            .collect();

        // scheme://host/... links; a piece cut off by a wrap is left to the
        // wrapped link below
        for m in GENERIC_URL.find_iter(&text) {
            if wrap_points.contains(&m.end()) {
                log::debug!("skipping wrapped fragment url={}", m.as_str());
                continue;
            }
            found.add(&patterns, clean_trailing_punctuation(m.as_str()));
        }
        let without_generic = GENERIC_URL.replace_all(&text, " ");

        // bare host/path on known hosts only
        if let Some(bare_domain) = &patterns.bare_domain {
            for caps in bare_domain.captures_iter(&without_generic) {
                if let Some(target) = caps.get(1) {
                    found.add(&patterns, clean_trailing_punctuation(target.as_str()));
                }
            }
        }

        // links wrapped over several lines by the chat client
        for w in &wrapped {
            found.add(&patterns, clean_trailing_punctuation(&w.url));
        }

        found.urls
    }

    /// True when the (normalized) link belongs to a registered platform.
    pub fn is_supported(&self, url: &str) -> bool {
        match_platform(&self.read_patterns(), url).is_some()
    }

    /// Ids of the enabled platforms, highest priority first.
    pub fn supported_platforms(&self) -> Vec<String> {
        match self.registry.get_all_by_priority() {
            Ok(platforms) => platforms.into_iter().map(|p| p.id).collect(),
            Err(e) => {
                log::warn!("failed to list platforms err={e}");
                Vec::new()
            }
        }
    }

    /// Platform id for an already normalized link.
    pub fn platform_for(&self, url: &str) -> String {
        match_platform(&self.read_patterns(), url)
            .unwrap_or(PLATFORM_UNKNOWN)
            .to_string()
    }
}

#[derive(Default)]
struct Found {
    urls: Vec<DetectedUrl>,
    seen: HashSet<String>,
}

impl Found {
    fn add(&mut self, patterns: &Patterns, raw: &str) {
        let decoded = match urlencoding::decode(raw) {
            Ok(d) => d.into_owned(),
            Err(_) => raw.to_string(),
        };
        let fixed = fix_malformed_query(&decoded);
        if fixed != raw {
            log::debug!("url decoded raw_url={raw} fixed_url={fixed}");
        }

        let url = match normalize_url(&fixed) {
            Ok(u) => u,
            Err(e) => {
                log::debug!("dropping candidate err={e}");
                return;
            }
        };

        if !self.seen.insert(url.clone()) {
            return;
        }

        let platform = match_platform(patterns, &url)
            .unwrap_or(PLATFORM_UNKNOWN)
            .to_string();
        self.urls.push(DetectedUrl { url, platform });
    }
}

fn match_platform<'a>(patterns: &'a Patterns, url: &str) -> Option<&'a str> {
    let target = match_target(url)?;
    patterns
        .compiled
        .iter()
        .find(|p| p.regex.is_match(&target))
        .map(|p| p.platform.as_str())
}

/// `host` + `path` of a link, the string platform patterns are matched against.
fn match_target(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    Some(format!("{host}{}", parsed.path()))
}

/// Only the first `?` opens the query; later ones are mis-encoded `&`.
fn fix_malformed_query(url: &str) -> String {
    match url.split_once('?') {
        Some((base, query)) => format!("{base}?{}", query.replace('?', "&")),
        None => url.to_string(),
    }
}

/// Trims sentence punctuation, keeping a closing paren while the link's
/// parentheses are balanced.
fn clean_trailing_punctuation(candidate: &str) -> &str {
    let mut s = candidate;
    loop {
        if s.ends_with(')') {
            if s.matches('(').count() >= s.matches(')').count() {
                return s;
            }
            s = &s[..s.len() - 1];
            continue;
        }

        match s.chars().last() {
            Some(c) if TRAILING_PUNCTUATION.contains(&c) => s = &s[..s.len() - c.len_utf8()],
            _ => return s,
        }
    }
}

/// Removes line breaks, returning the joined text and the byte offsets (in the
/// joined text) where a break used to be.
struct LineBreak {
    /// Offset in the joined text where the next line starts
    joined: usize,
    /// Offset in the original text where the line's content ends
    line_end: usize,
}

fn join_lines(text: &str) -> (String, Vec<LineBreak>) {
    let mut joined = String::with_capacity(text.len());
    let mut breaks = Vec::new();
    let mut line_end = 0;
    for (i, c) in text.char_indices() {
        match c {
            '\n' => breaks.push(LineBreak {
                joined: joined.len(),
                line_end,
            }),
            '\r' => {}
            _ => {
                joined.push(c);
                line_end = i + c.len_utf8();
            }
        }
    }
    (joined, breaks)
}

struct WrappedLink {
    url: String,
    /// Original-text offsets of the line ends the link runs across
    line_ends: Vec<usize>,
}

/// Links that only match once line breaks are removed. A break followed by
/// a fresh `http(s)://` starts a new link rather than continuing one.
fn wrapped_links(text: &str) -> Vec<WrappedLink> {
    let (joined, breaks) = join_lines(text);
    let mut links = Vec::new();

    for m in GENERIC_URL.find_iter(&joined) {
        let crossed: Vec<&LineBreak> = breaks
            .iter()
            .filter(|b| m.start() < b.joined && b.joined < m.end())
            .collect();
        if crossed.is_empty() {
            continue;
        }

        let starts_new_link = crossed.iter().any(|b| {
            let rest = joined[b.joined..].to_ascii_lowercase();
            rest.starts_with("http://") || rest.starts_with("https://")
        });
        if starts_new_link {
            continue;
        }

        links.push(WrappedLink {
            url: m.as_str().to_string(),
            line_ends: crossed.iter().map(|b| b.line_end).collect(),
        });
    }

    links
}

fn build_patterns(platforms: &[Platform]) -> Patterns {
    let mut compiled = Vec::new();
    let mut hosts = Vec::new();

    for platform in platforms {
        for pattern in &platform.url_patterns {
            let source = pattern_to_regex(pattern);
            match Regex::new(&source) {
                Ok(regex) => compiled.push(CompiledPattern {
                    regex,
                    platform: platform.id.clone(),
                }),
                Err(e) => {
                    log::warn!("skipping url pattern platform={} pattern={pattern} err={e}", platform.id);
                    continue;
                }
            }

            let host = pattern
                .trim_start_matches("*.")
                .trim_start_matches("www.")
                .split('/')
                .next()
                .unwrap_or_default()
                .to_lowercase();
            if !host.is_empty() && !hosts.contains(&host) {
                hosts.push(host);
            }
        }
    }

    Patterns {
        compiled,
        bare_domain: bare_domain_regex(hosts),
    }
}

/// Compiles a platform host pattern into a regex over `host/path`.
///
/// - `example.com` matches the host and any subdomain
/// - `www.example.com` makes `www.` optional
/// - `*.example.com` requires a subdomain
/// - `sub.example.com` matches that host exactly
/// - a trailing `/path` restricts to that path prefix
fn pattern_to_regex(pattern: &str) -> String {
    let pattern = pattern.trim().to_lowercase();
    let (host, path) = match pattern.find('/') {
        Some(idx) => pattern.split_at(idx),
        None => (pattern.as_str(), ""),
    };

    let head = if let Some(rest) = host.strip_prefix("*.") {
        format!(r"[\w-]+\.{}", regex::escape(rest))
    } else if let Some(rest) = host.strip_prefix("www.") {
        format!(r"(?:www\.)?{}", regex::escape(rest))
    } else if host.split('.').count() <= 2 {
        format!(r"(?:[\w-]+\.)*{}", regex::escape(host))
    } else {
        regex::escape(host)
    };

    let tail = if path.is_empty() || path == "/" {
        "(?:/|$)".to_string()
    } else {
        regex::escape(path)
    };

    format!("(?i)^{head}{tail}")
}

fn bare_domain_regex(mut hosts: Vec<String>) -> Option<Regex> {
    if hosts.is_empty() {
        return None;
    }

    // longest first so alternation prefers the most specific host
    hosts.sort_by_key(|h| std::cmp::Reverse(h.len()));
    let alternation = hosts
        .iter()
        .map(|h| regex::escape(h))
        .collect::<Vec<_>>()
        .join("|");

    let source = format!(
        r"(?i)(?:^|\s)((?:www\.)?(?:[\w-]+\.)*(?:{alternation})\b(?:/[^\s<>\[\]]*)?)"
    );

    match Regex::new(&source) {
        Ok(r) => Some(r),
        Err(e) => {
            log::warn!("bare domain matcher not built err={e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_trailing_punctuation() {
        assert_eq!(clean_trailing_punctuation("https://a.com/x."), "https://a.com/x");
        assert_eq!(clean_trailing_punctuation("https://a.com/x!?"), "https://a.com/x");
        assert_eq!(
            clean_trailing_punctuation("https://en.wikipedia.org/wiki/Foo_(bar)"),
            "https://en.wikipedia.org/wiki/Foo_(bar)"
        );
        assert_eq!(clean_trailing_punctuation("https://a.com/x)."), "https://a.com/x");
    }

    #[test]
    fn test_fix_malformed_query() {
        assert_eq!(
            fix_malformed_query("https://youtube.com/watch?v=ABC?si=XYZ"),
            "https://youtube.com/watch?v=ABC&si=XYZ"
        );
        assert_eq!(fix_malformed_query("https://a.com/"), "https://a.com/");
    }

    #[test]
    fn test_pattern_shapes() {
        let bare = Regex::new(&pattern_to_regex("bandcamp.com")).unwrap();
        assert!(bare.is_match("artist.bandcamp.com/album/x"));
        assert!(bare.is_match("bandcamp.com/"));
        assert!(!bare.is_match("notbandcamp.com/"));

        let www = Regex::new(&pattern_to_regex("www.rinse.fm")).unwrap();
        assert!(www.is_match("rinse.fm/episodes"));
        assert!(www.is_match("www.rinse.fm/"));

        let wildcard = Regex::new(&pattern_to_regex("*.bandcamp.com")).unwrap();
        assert!(wildcard.is_match("artist.bandcamp.com/"));
        assert!(!wildcard.is_match("bandcamp.com/"));

        let exact = Regex::new(&pattern_to_regex("music.apple.com")).unwrap();
        assert!(exact.is_match("music.apple.com/us/album/1"));
        assert!(!exact.is_match("apple.com/"));

        let with_path = Regex::new(&pattern_to_regex("youtube.com/embed")).unwrap();
        assert!(with_path.is_match("youtube.com/embed/abc"));
        assert!(!with_path.is_match("youtube.com/watch"));
    }

    #[test]
    fn test_join_lines_records_breaks() {
        let (joined, breaks) = join_lines("ab\ncd\r\ne");
        assert_eq!(joined, "abcde");
        assert_eq!(breaks, vec![2, 4]);
    }
}
