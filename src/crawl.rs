//! Crawl mode: sitemap discovery and a bounded pool of tabs draining a shared
//! URL queue.
//!
//! Each pool tab handles its URLs strictly one after another (load, settle,
//! test). Tabs run concurrently with each other; captures still funnel through
//! the coordinator's single [`crate::tasks::SequentialTaskRunner`].

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::browser::{BrowserError, BrowserResult, BrowserSurface, CreateTab, TabId, TabUpdate, WindowId};
use crate::config::CrawlSettings;
use crate::harness::types::{HarnessError, TestReport};

/// Page loaded into pool tabs before their first URL
const BLANK_PAGE: &str = "about:blank";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CrawlError {
    #[error("invalid start URL '{0}'")]
    InvalidUrl(String),

    #[error("sitemap request timed out after {0:?}")]
    Timeout(Duration),

    #[error("sitemap request failed: {0}")]
    Fetch(String),

    #[error("sitemap request returned HTTP {0}")]
    Http(u16),

    #[error("sitemap has no locations")]
    NoLocations,

    #[error("no crawl tab could be opened: {0}")]
    NoTabs(String),
}

/// Where crawl URLs come from.
#[async_trait]
pub trait SitemapSource: Send + Sync {
    /// Every location listed for the site of `start_url`, in document order.
    async fn locations(&self, start_url: &str) -> Result<Vec<String>, CrawlError>;
}

/// Fetches `<origin>/sitemap.xml` over HTTP.
pub struct HttpSitemapSource {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpSitemapSource {
    pub fn new(timeout: Duration) -> Result<Self, CrawlError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CrawlError::Fetch(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    pub fn from_settings(settings: &CrawlSettings) -> Result<Self, CrawlError> {
        Self::new(settings.sitemap_timeout)
    }
}

#[async_trait]
impl SitemapSource for HttpSitemapSource {
    async fn locations(&self, start_url: &str) -> Result<Vec<String>, CrawlError> {
        let sitemap = sitemap_url(start_url)?;
        debug!(%sitemap, "fetching sitemap");

        let response = self.client.get(sitemap).send().await.map_err(|e| {
            if e.is_timeout() {
                CrawlError::Timeout(self.timeout)
            } else {
                CrawlError::Fetch(e.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(CrawlError::Http(status.as_u16()));
        }
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                CrawlError::Timeout(self.timeout)
            } else {
                CrawlError::Fetch(e.to_string())
            }
        })?;
        parse_locations(&body)
    }
}

/// A fixed list of locations.
pub struct StaticSitemapSource {
    locations: Vec<String>,
}

impl StaticSitemapSource {
    pub fn new<I, S>(locations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            locations: locations.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl SitemapSource for StaticSitemapSource {
    async fn locations(&self, _start_url: &str) -> Result<Vec<String>, CrawlError> {
        Ok(self.locations.clone())
    }
}

/// `<scheme>://<host>[:port]/sitemap.xml` for the site of `start_url`.
pub fn sitemap_url(start_url: &str) -> Result<url::Url, CrawlError> {
    let parsed = url::Url::parse(start_url).map_err(|_| CrawlError::InvalidUrl(start_url.to_string()))?;
    if parsed.host_str().is_none() {
        return Err(CrawlError::InvalidUrl(start_url.to_string()));
    }
    parsed
        .join("/sitemap.xml")
        .map_err(|_| CrawlError::InvalidUrl(start_url.to_string()))
}

/// Extract every `<loc>` entry of a sitemap document.
pub fn parse_locations(xml: &str) -> Result<Vec<String>, CrawlError> {
    let pattern = Regex::new(r"(?s)<loc>\s*(.*?)\s*</loc>").map_err(|e| CrawlError::Fetch(e.to_string()))?;
    Ok(pattern
        .captures_iter(xml)
        .filter_map(|c| c.get(1))
        .map(|m| unescape_xml(m.as_str()))
        .filter(|loc| !loc.is_empty())
        .collect())
}

fn unescape_xml(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Sort, drop duplicates and the start page, cap at `max_urls`.
pub fn dedupe(mut urls: Vec<String>, start_url: &str, max_urls: usize) -> Vec<String> {
    urls.sort();
    urls.dedup();
    urls.retain(|u| u != start_url);
    urls.truncate(max_urls);
    urls
}

/// Discover the URLs a crawl from `start_url` will visit.
pub async fn discover(
    source: &dyn SitemapSource,
    start_url: &str,
    max_urls: usize,
) -> Result<Vec<String>, CrawlError> {
    let locations = source.locations(start_url).await?;
    if locations.is_empty() {
        return Err(CrawlError::NoLocations);
    }
    let urls = dedupe(locations, start_url, max_urls);
    info!(start_url, count = urls.len(), "sitemap discovered");
    Ok(urls)
}

/// One test of a loaded page, run inside a pool tab.
#[async_trait]
pub trait PageTest: Send + Sync {
    async fn test_page(&self, tab_id: TabId, url: &str) -> Result<TestReport, HarnessError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlFailure {
    pub url: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlReport {
    pub discovered: Vec<String>,
    pub tested: Vec<TestReport>,
    pub failed: Vec<CrawlFailure>,
    /// Pages not tested because their crawl tab was closed
    pub interrupted: Vec<CrawlFailure>,
}

#[derive(Default)]
struct Outcomes {
    tested: Vec<TestReport>,
    failed: Vec<CrawlFailure>,
    interrupted: Vec<CrawlFailure>,
}

pub struct CrawlOrchestrator<'a> {
    browser: &'a dyn BrowserSurface,
    tabs: usize,
    page_settle: Duration,
}

impl<'a> CrawlOrchestrator<'a> {
    pub fn new(browser: &'a dyn BrowserSurface, settings: &CrawlSettings) -> Self {
        Self {
            browser,
            tabs: settings.tabs.max(1),
            page_settle: settings.page_settle,
        }
    }

    /// Drain `urls` through a pool of background tabs opened in `window_id`.
    ///
    /// Returns once every pool tab has drained the queue and been closed.
    pub async fn run(
        &self,
        window_id: WindowId,
        urls: Vec<String>,
        tester: &dyn PageTest,
    ) -> Result<CrawlReport, CrawlError> {
        let mut report = CrawlReport {
            discovered: urls.clone(),
            ..Default::default()
        };
        if urls.is_empty() {
            return Ok(report);
        }

        let pool_size = self.tabs.min(urls.len());
        let mut pool = Vec::with_capacity(pool_size);
        let mut last_error = None;
        for _ in 0..pool_size {
            match self.open_pool_tab(window_id).await {
                Ok(tab_id) => pool.push(tab_id),
                Err(err) => {
                    warn!(error = %err, "could not open crawl tab");
                    last_error = Some(err);
                }
            }
        }
        if pool.is_empty() {
            let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
            return Err(CrawlError::NoTabs(reason));
        }
        info!(tabs = pool.len(), urls = urls.len(), "crawl started");

        let queue = Mutex::new(VecDeque::from(urls));
        let results = Mutex::new(Outcomes::default());
        let workers = pool
            .iter()
            .enumerate()
            .map(|(slot, tab_id)| self.worker(slot, *tab_id, &queue, &results, tester));
        futures::future::join_all(workers).await;

        let mut outcomes = results.into_inner();
        outcomes
            .interrupted
            .extend(queue.into_inner().into_iter().map(|url| CrawlFailure {
                url,
                error: "every crawl tab was closed".to_string(),
            }));
        report.tested = outcomes.tested;
        report.failed = outcomes.failed;
        report.interrupted = outcomes.interrupted;
        info!(
            tested = report.tested.len(),
            failed = report.failed.len(),
            interrupted = report.interrupted.len(),
            "crawl finished"
        );
        Ok(report)
    }

    async fn open_pool_tab(&self, window_id: WindowId) -> BrowserResult<TabId> {
        let tab = self
            .browser
            .create_tab(CreateTab {
                window_id,
                url: BLANK_PAGE.to_string(),
                active: false,
                index: None,
            })
            .await?;
        Ok(tab.id)
    }

    async fn worker(
        &self,
        slot: usize,
        tab_id: TabId,
        queue: &Mutex<VecDeque<String>>,
        results: &Mutex<Outcomes>,
        tester: &dyn PageTest,
    ) {
        loop {
            let Some(url) = queue.lock().pop_front() else {
                break;
            };
            debug!(slot, tab = tab_id, %url, "loading page");

            if let Err(err) = self.browser.update_tab(tab_id, TabUpdate::navigate(url.as_str())).await {
                let failure = CrawlFailure {
                    url,
                    error: err.to_string(),
                };
                if matches!(err, BrowserError::TabNotFound(_)) {
                    warn!(slot, tab = tab_id, url = %failure.url, "crawl tab closed");
                    results.lock().interrupted.push(failure);
                    return;
                }
                warn!(slot, tab = tab_id, url = %failure.url, error = %err, "could not load page");
                results.lock().failed.push(failure);
                continue;
            }
            if !self.page_settle.is_zero() {
                tokio::time::sleep(self.page_settle).await;
            }

            match tester.test_page(tab_id, &url).await {
                Ok(report) => results.lock().tested.push(report),
                Err(err) => {
                    let failure = CrawlFailure {
                        url,
                        error: err.to_string(),
                    };
                    // Leave the rest of the queue to tabs that are still open.
                    if err.is_tab_closed() || self.tab_is_gone(tab_id).await {
                        warn!(slot, tab = tab_id, url = %failure.url, "crawl tab closed mid-test");
                        results.lock().interrupted.push(failure);
                        return;
                    }
                    warn!(slot, tab = tab_id, url = %failure.url, error = %err, "page test failed");
                    results.lock().failed.push(failure);
                }
            }
        }

        match self.browser.remove_tab(tab_id).await {
            Ok(()) | Err(BrowserError::TabNotFound(_)) => debug!(slot, tab = tab_id, "crawl tab drained"),
            Err(err) => warn!(slot, tab = tab_id, error = %err, "could not close crawl tab"),
        }
    }

    async fn tab_is_gone(&self, tab_id: TabId) -> bool {
        matches!(self.browser.get_tab(tab_id).await, Err(BrowserError::TabNotFound(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{SimulatedBrowser, Size};
    use crate::check::CheckStatus;
    use crate::harness::types::{MatchLevel, TestParameters};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_sitemap_url_uses_origin() {
        assert_eq!(
            sitemap_url("https://example.com/blog/post?x=1").unwrap().as_str(),
            "https://example.com/sitemap.xml"
        );
        assert_eq!(
            sitemap_url("http://localhost:8080/a").unwrap().as_str(),
            "http://localhost:8080/sitemap.xml"
        );
        assert!(matches!(sitemap_url("not a url"), Err(CrawlError::InvalidUrl(_))));
    }

    #[test]
    fn test_parse_locations() {
        let xml = r#"<?xml version="1.0"?>
<urlset>
  <url><loc>https://example.com/a</loc></url>
  <url><loc>
    https://example.com/b?x=1&amp;y=2
  </loc></url>
</urlset>"#;
        assert_eq!(
            parse_locations(xml).unwrap(),
            vec!["https://example.com/a", "https://example.com/b?x=1&y=2"]
        );
    }

    #[test]
    fn test_dedupe_drops_start_and_duplicates() {
        let urls = vec![
            "https://e.com/c".to_string(),
            "https://e.com/a".to_string(),
            "https://e.com/".to_string(),
            "https://e.com/c".to_string(),
            "https://e.com/b".to_string(),
        ];
        assert_eq!(
            dedupe(urls.clone(), "https://e.com/", 10),
            vec!["https://e.com/a", "https://e.com/b", "https://e.com/c"]
        );
        assert_eq!(dedupe(urls, "https://e.com/", 2), vec!["https://e.com/a", "https://e.com/b"]);
    }

    #[tokio::test]
    async fn test_discover_rejects_empty_sitemap() {
        let source = StaticSitemapSource::new(Vec::<String>::new());
        assert_eq!(
            discover(&source, "https://e.com/", 10).await,
            Err(CrawlError::NoLocations)
        );
    }

    #[tokio::test]
    async fn test_http_source_reads_sitemap() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/sitemap.xml")
            .with_status(200)
            .with_body("<urlset><url><loc>https://e.com/a</loc></url></urlset>")
            .create_async()
            .await;

        let source = HttpSitemapSource::new(Duration::from_secs(5)).unwrap();
        let start = format!("{}/start", server.url());
        assert_eq!(source.locations(&start).await.unwrap(), vec!["https://e.com/a"]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_source_reports_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/sitemap.xml")
            .with_status(404)
            .create_async()
            .await;

        let source = HttpSitemapSource::new(Duration::from_secs(5)).unwrap();
        assert_eq!(
            source.locations(&server.url()).await,
            Err(CrawlError::Http(404))
        );
    }

    struct RecordingTester {
        browser: std::sync::Arc<SimulatedBrowser>,
        seen: Mutex<Vec<(TabId, String)>>,
        fail_on: Option<String>,
        /// Close the testing tab while this page is under test
        close_on: Option<String>,
    }

    impl RecordingTester {
        fn new(browser: &std::sync::Arc<SimulatedBrowser>) -> Self {
            Self {
                browser: browser.clone(),
                seen: Mutex::new(Vec::new()),
                fail_on: None,
                close_on: None,
            }
        }
    }

    #[async_trait]
    impl PageTest for RecordingTester {
        async fn test_page(&self, tab_id: TabId, url: &str) -> Result<TestReport, HarnessError> {
            let tab = self.browser.get_tab(tab_id).await?;
            assert_eq!(tab.url, url);
            self.seen.lock().push((tab_id, url.to_string()));
            tokio::task::yield_now().await;
            if self.fail_on.as_deref() == Some(url) {
                return Err(HarnessError::Capture("boom".to_string()));
            }
            if self.close_on.as_deref() == Some(url) {
                self.browser.close_tab(tab_id)?;
                return Err(HarnessError::TabClosed(tab_id));
            }
            Ok(TestReport {
                parameters: TestParameters {
                    app_name: "e.com".to_string(),
                    test_name: url.to_string(),
                    branch_name: None,
                    parent_branch_name: None,
                    os: "Linux".to_string(),
                    hosting_app: "Simulated".to_string(),
                    inferred_environment: "useragent:test".to_string(),
                    match_level: MatchLevel::Strict,
                    viewport_size: Size::new(800, 600),
                    batch: None,
                },
                status: CheckStatus::New,
                result_url: None,
                results_tab: None,
            })
        }
    }

    fn settings(tabs: usize) -> CrawlSettings {
        CrawlSettings {
            tabs,
            page_settle: Duration::ZERO,
            sitemap_timeout: Duration::from_secs(1),
            max_urls: 100,
        }
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_closes_tabs() {
        let browser = std::sync::Arc::new(SimulatedBrowser::new());
        let (window, _) = browser.open_window(Size::new(816, 688), &["https://e.com/"]);
        let tester = RecordingTester {
            fail_on: Some("https://e.com/3".to_string()),
            ..RecordingTester::new(&browser)
        };
        let urls: Vec<String> = (1..=7).map(|i| format!("https://e.com/{}", i)).collect();

        let orchestrator = CrawlOrchestrator::new(browser.as_ref(), &settings(3));
        let report = orchestrator.run(window, urls.clone(), &tester).await.unwrap();

        assert_eq!(report.discovered, urls);
        assert_eq!(report.tested.len(), 6);
        assert_eq!(
            report.failed,
            vec![CrawlFailure {
                url: "https://e.com/3".to_string(),
                error: "Capture failed: boom".to_string()
            }]
        );
        assert!(report.interrupted.is_empty());

        let seen = tester.seen.lock().clone();
        assert_eq!(seen.len(), 7);
        let mut pool_tabs: Vec<TabId> = seen.iter().map(|(tab, _)| *tab).collect();
        pool_tabs.sort();
        pool_tabs.dedup();
        assert_eq!(pool_tabs.len(), 3);

        // Only the original tab is left.
        assert_eq!(browser.tab_count(), 1);
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_url_count() {
        let browser = std::sync::Arc::new(SimulatedBrowser::new());
        let (window, _) = browser.open_window(Size::new(816, 688), &["https://e.com/"]);
        let tester = RecordingTester::new(&browser);
        let orchestrator = CrawlOrchestrator::new(browser.as_ref(), &settings(5));
        orchestrator
            .run(window, vec!["https://e.com/only".to_string()], &tester)
            .await
            .unwrap();

        let created = browser
            .calls()
            .iter()
            .filter(|c| matches!(c, crate::browser::BrowserCall::CreateTab { .. }))
            .count();
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn test_closed_tab_leaves_remaining_urls_to_open_tabs() {
        let browser = std::sync::Arc::new(SimulatedBrowser::new());
        let (window, _) = browser.open_window(Size::new(816, 688), &["https://e.com/"]);
        let tester = RecordingTester {
            close_on: Some("https://e.com/1".to_string()),
            ..RecordingTester::new(&browser)
        };
        let urls: Vec<String> = (1..=4).map(|i| format!("https://e.com/{}", i)).collect();

        let orchestrator = CrawlOrchestrator::new(browser.as_ref(), &settings(2));
        let report = orchestrator.run(window, urls, &tester).await.unwrap();

        let mut tested: Vec<String> = report
            .tested
            .iter()
            .map(|r| r.parameters.test_name.clone())
            .collect();
        tested.sort();
        assert_eq!(tested, vec!["https://e.com/2", "https://e.com/3", "https://e.com/4"]);
        assert!(report.failed.is_empty());
        assert_eq!(report.interrupted.len(), 1);
        assert_eq!(report.interrupted[0].url, "https://e.com/1");
        assert_eq!(browser.tab_count(), 1);
    }

    #[tokio::test]
    async fn test_http_source_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept connections and never answer.
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let timeout = Duration::from_millis(50);
        let source = HttpSitemapSource::new(timeout).unwrap();
        assert_eq!(
            source.locations(&format!("http://{}/start", addr)).await,
            Err(CrawlError::Timeout(timeout))
        );
        server.abort();
    }
}
