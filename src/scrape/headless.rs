use std::path::PathBuf;
use std::sync::mpsc;
use std::thread::{self, sleep};
use std::time::{Duration, Instant};

use headless_chrome::{Browser, LaunchOptionsBuilder, Tab};

use super::{admit, ScrapeError};
use crate::config::ScrapeConfig;

enum RenderEvent {
    /// The render thread hands the browser over right after launch.
    Launched(Browser),
    Done(Result<String, ScrapeError>),
}

/// Renders `url` in a sandboxed headless browser and returns the resulting
/// document. The whole attempt (launch, navigate, settle, read) is bounded by
/// `budget`. Once launched the browser is owned here, so returning on any
/// path, timeout included, drops it and kills the process.
pub fn render_page(url: &str, config: &ScrapeConfig, budget: Duration) -> Result<String, ScrapeError> {
    let (parsed, budget) = admit(url, config, budget)?;
    let started = Instant::now();

    let (tx, rx) = mpsc::channel();
    let url = parsed.to_string();
    let config = config.clone();

    thread::Builder::new()
        .name("knok-render".into())
        .spawn(move || render_thread(&url, &config, started, budget, tx))
        .map_err(|e| ScrapeError::Browser(format!("couldn't spawn render thread: {e}")))?;

    let deadline = started + budget;
    let mut browser = None;
    loop {
        let wait = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(wait) {
            Ok(RenderEvent::Launched(b)) => browser = Some(b),
            Ok(RenderEvent::Done(res)) => return res,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if let Some(pid) = browser.as_ref().and_then(|b| b.get_process_id()) {
                    log::debug!("render timed out, killing browser pid={pid}");
                }
                return Err(ScrapeError::Timeout);
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(ScrapeError::Browser("render thread exited".into()))
            }
        }
    }
}

fn remaining(started: Instant, budget: Duration) -> Result<Duration, ScrapeError> {
    budget
        .checked_sub(started.elapsed())
        .filter(|d| !d.is_zero())
        .ok_or(ScrapeError::Timeout)
}

fn launch(config: &ScrapeConfig, budget: Duration) -> Result<Browser, ScrapeError> {
    let launch_options = LaunchOptionsBuilder::default()
        .headless(true)
        .sandbox(true)
        .path(Some(PathBuf::from(&config.chrome_path)))
        .idle_browser_timeout(budget)
        .build()
        .map_err(|e| ScrapeError::Browser(format!("bad launch options: {e}")))?;

    Browser::new(launch_options).map_err(|e| ScrapeError::Browser(format!("failed to start chrome: {e}")))
}

fn render_thread(
    url: &str,
    config: &ScrapeConfig,
    started: Instant,
    budget: Duration,
    tx: mpsc::Sender<RenderEvent>,
) {
    let tab = match launch(config, budget).and_then(|browser| {
        let tab = browser
            .new_tab()
            .map_err(|e| ScrapeError::Browser(format!("failed to open tab: {e}")))?;
        Ok((browser, tab))
    }) {
        Ok((browser, tab)) => {
            // a caller that already gave up drops the browser with the event
            if tx.send(RenderEvent::Launched(browser)).is_err() {
                return;
            }
            tab
        }
        Err(e) => {
            let _ = tx.send(RenderEvent::Done(Err(e)));
            return;
        }
    };

    let _ = tx.send(RenderEvent::Done(render_tab(&tab, url, config, started, budget)));
}

fn render_tab(
    tab: &Tab,
    url: &str,
    config: &ScrapeConfig,
    started: Instant,
    budget: Duration,
) -> Result<String, ScrapeError> {
    let _ = tab.set_user_agent(&config.user_agent, Some("en-US,en"), None);

    let navigation = config.navigation_timeout().min(remaining(started, budget)?);
    tab.set_default_timeout(navigation);

    tab.navigate_to(url)
        .and_then(|t| t.wait_until_navigated())
        .map_err(|e| ScrapeError::Browser(format!("navigation failed: {e}")))?;

    // script-driven content needs a moment after load
    let settle = config.settle_delay().min(remaining(started, budget)?);
    sleep(settle);

    tab.get_content()
        .map_err(|e| ScrapeError::Browser(format!("failed to read document: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::loopback_scrape_config;

    #[test]
    fn test_missing_browser_fails_fast() {
        let config = ScrapeConfig {
            chrome_path: "/nonexistent/chrome".into(),
            ..loopback_scrape_config()
        };
        let started = Instant::now();

        let res = render_page("http://127.0.0.1:9/", &config, Duration::from_secs(20));

        assert!(matches!(res, Err(ScrapeError::Browser(_))), "{res:?}");
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn test_timeout_returns_within_budget() {
        let config = loopback_scrape_config();
        if !std::path::Path::new(&config.chrome_path).exists() {
            return;
        }

        // accepts connections but never answers
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let started = Instant::now();

        let res = render_page(&url, &config, Duration::from_secs(3));

        assert!(matches!(res, Err(ScrapeError::Timeout)), "{res:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(listener);
    }
}
