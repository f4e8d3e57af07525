//! The operations the surrounding UI calls: run one test, crawl a site,
//! navigate steps, manage the baseline image and accounts.
//!
//! A single test goes through these stages, each feeding the next:
//! 1. resolve credentials and preferences, derive [`TestParameters`]
//! 2. prepare the tab's window to the requested viewport
//! 3. capture the tab through the shared [`SequentialTaskRunner`]
//! 4. submit the capture to the [`VisualCheck`]
//! 5. show the result in a (reused) background tab
//! 6. restore the original window layout
//!
//! Lifecycle bookkeeping runs on every path; failures are reported to the
//! [`RunContext`] before they are returned. A tab closed mid-test is not a
//! failure: the tracker logs it and the run returns [`HarnessError::TabClosed`].

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::auth::{Account, AccountCredentials, AccountDirectory, AccountSession, AuthState};
use crate::browser::{
    BrowserResult, BrowserSurface, CaptureOptions, TabId, TabUpdate, WindowId, decode_data_url,
};
use crate::check::{CheckOutcome, VisualCheck, image_dimensions};
use crate::config::Config;
use crate::crawl::{self, CrawlOrchestrator, CrawlReport, PageTest, SitemapSource};
use crate::harness::types::{
    BaselineSelection, BatchInfo, HarnessError, HarnessResult, TestParameters, TestReport,
};
use crate::lifecycle::TestLifecycleTracker;
use crate::results::{DisplayOptions, ResultTabCache, STEPS_KEY, with_account_id};
use crate::settings::{Preferences, SettingsStore};
use crate::state::{Indicator, LogEntry, RunContext};
use crate::steps::StepCursor;
use crate::tasks::SequentialTaskRunner;
use crate::window::{RetryPolicy, WindowPreparer};

const HIDE_SCROLLBARS_SCRIPT: &str = "document.documentElement.style.overflow = 'hidden';";
const SHOW_SCROLLBARS_SCRIPT: &str = "document.documentElement.style.overflow = '';";

/// External collaborators of the coordinator.
pub struct Collaborators {
    pub browser: Arc<dyn BrowserSurface>,
    pub store: Arc<dyn SettingsStore>,
    pub accounts: Arc<dyn AccountDirectory>,
    pub check: Arc<dyn VisualCheck>,
}

/// Where a test runs and where its results go.
#[derive(Debug, Clone, Copy)]
struct RunTarget {
    tab_id: TabId,
    results_window: WindowId,
    steps_mode: bool,
}

#[derive(Debug, Default)]
struct BaselineImage {
    png: Option<Vec<u8>>,
    enabled: bool,
}

pub struct TestRunCoordinator {
    browser: Arc<dyn BrowserSurface>,
    store: Arc<dyn SettingsStore>,
    check: Arc<dyn VisualCheck>,
    config: Config,
    ctx: Arc<RunContext>,
    auth: AccountSession,
    preparer: WindowPreparer,
    tracker: TestLifecycleTracker,
    results: ResultTabCache,
    runner: SequentialTaskRunner,
    steps: Mutex<StepCursor>,
    baseline_image: Mutex<BaselineImage>,
}

impl TestRunCoordinator {
    pub fn new(parts: Collaborators, config: Config) -> Self {
        let ctx = Arc::new(RunContext::new());
        Self {
            auth: AccountSession::new(
                Arc::clone(&parts.store),
                parts.accounts,
                Arc::clone(&parts.browser),
                config.server.clone(),
            ),
            preparer: WindowPreparer::new(
                Arc::clone(&parts.browser),
                RetryPolicy::from(&config.window),
            ),
            tracker: TestLifecycleTracker::new(Arc::clone(&ctx)),
            results: ResultTabCache::new(Arc::clone(&parts.browser)),
            runner: SequentialTaskRunner::new(),
            steps: Mutex::new(StepCursor::new()),
            baseline_image: Mutex::new(BaselineImage::default()),
            browser: parts.browser,
            store: parts.store,
            check: parts.check,
            config,
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.ctx
    }

    pub fn tracker(&self) -> &TestLifecycleTracker {
        &self.tracker
    }

    pub fn result_tabs(&self) -> &ResultTabCache {
        &self.results
    }

    // ------------------------------------------------------------------
    // Single test
    // ------------------------------------------------------------------

    /// Test the active tab.
    pub async fn run_single_test(&self) -> HarnessResult<TestReport> {
        let result = self.single_test().await;
        match &result {
            Err(err) if !err.is_tab_closed() => self.ctx.report_error(Some(&err.to_string())),
            _ => {}
        }
        result
    }

    async fn single_test(&self) -> HarnessResult<TestReport> {
        let credentials = self.auth.credentials().await?;
        let tab = self.browser.active_tab().await?;
        let prefs = Preferences::load(self.store.as_ref()).await?;

        let step = self.steps.lock().current().map(str::to_string);
        let steps_mode = step.is_some();
        let params = self
            .build_parameters(&tab.url, &prefs, &prefs.baseline, step)
            .await?;
        info!(app = %params.app_name, test = %params.test_name, viewport = %params.viewport_size, "running test");

        let stored_image = {
            let baseline = self.baseline_image.lock();
            if baseline.enabled {
                Some(baseline.png.clone().ok_or_else(|| {
                    HarnessError::BaselineImage("no baseline image loaded".to_string())
                })?)
            } else {
                None
            }
        };

        let report = match stored_image {
            Some(png) => {
                let target = RunTarget {
                    tab_id: tab.id,
                    results_window: tab.window_id,
                    steps_mode,
                };
                self.execute(target, params, &prefs, &credentials, Some(png)).await?
            }
            None => {
                let prep = self.preparer.prepare(tab.id, prefs.viewport_size).await?;
                let target = RunTarget {
                    tab_id: prep.updated.tab.id,
                    results_window: prep.original.window.id,
                    steps_mode,
                };
                let outcome = self.execute(target, params, &prefs, &credentials, None).await;
                let restored = self.preparer.restore(&prep).await;
                let report = outcome?;
                restored?;
                report
            }
        };

        if steps_mode {
            self.steps.lock().move_next();
        }
        Ok(report)
    }

    /// Capture (unless `image` is given), check and show one test.
    async fn execute(
        &self,
        target: RunTarget,
        params: TestParameters,
        prefs: &Preferences,
        credentials: &AccountCredentials,
        image: Option<Vec<u8>>,
    ) -> HarnessResult<TestReport> {
        let RunTarget {
            tab_id,
            results_window,
            steps_mode,
        } = target;
        let handle = self.tracker.test_started(tab_id, &params.app_name, &params.test_name);
        let checked: HarnessResult<CheckOutcome> = async {
            let image = match image {
                Some(png) => png,
                None => self.capture(tab_id, prefs).await?,
            };
            self.check
                .run_check(&params, &image, &params.test_name, credentials)
                .await
                .map_err(HarnessError::from)
        }
        .await;
        if !self.tracker.finish(handle) {
            // Closed mid-test: the tracker logged it and there is nothing to show.
            if matches!(checked, Err(HarnessError::Check(_))) {
                self.check.abort(&params).await;
            }
            info!(tab_id, test = %params.test_name, "tab closed during test");
            return Err(HarnessError::TabClosed(tab_id));
        }

        let display = DisplayOptions {
            open_in_new_tab: prefs.open_results_in_new_tab,
            steps_mode,
        };
        match checked {
            Ok(outcome) => {
                let (result_url, results_tab) = match outcome.result_url {
                    Some(url) => {
                        let shown = with_account_id(&url, credentials.account_id());
                        let tab = self
                            .results
                            .show_results(&shown, &params, results_window, display)
                            .await?;
                        (Some(shown), tab)
                    }
                    None => (None, None),
                };
                Ok(TestReport {
                    parameters: params,
                    status: outcome.status,
                    result_url,
                    results_tab,
                })
            }
            Err(err) => {
                if let HarnessError::Check(check_err) = &err {
                    self.check.abort(&params).await;
                    if let Some(url) = check_err.result_url() {
                        let shown = with_account_id(url, credentials.account_id());
                        if let Err(show_err) = self
                            .results
                            .show_results(&shown, &params, results_window, display)
                            .await
                        {
                            warn!(error = %show_err, "could not show results of failed check");
                        }
                    }
                }
                Err(err)
            }
        }
    }

    async fn capture(&self, tab_id: TabId, prefs: &Preferences) -> HarnessResult<Vec<u8>> {
        let browser = Arc::clone(&self.browser);
        let options = CaptureOptions {
            full_page: prefs.full_page_screenshot,
        };
        let hide_scrollbars = prefs.remove_scrollbars;
        let png = self
            .runner
            .submit(async move { capture_tab(browser.as_ref(), tab_id, options, hide_scrollbars).await })
            .await??;
        Ok(png)
    }

    async fn build_parameters(
        &self,
        page_url: &str,
        prefs: &Preferences,
        baseline: &BaselineSelection,
        step: Option<String>,
    ) -> HarnessResult<TestParameters> {
        let platform = self.browser.platform().await?;
        let with_query = prefs.test_name_uses_query_params;
        let (app_name, derived_test) = match baseline {
            BaselineSelection::Default => names_from_url(page_url, with_query),
            BaselineSelection::StepUrl { url } => names_from_url(url, with_query),
            BaselineSelection::UserValues { app_name, test_name } => (app_name.clone(), test_name.clone()),
        };
        let steps_mode = step.is_some();
        let test_name = step.unwrap_or(derived_test);

        let batch = (prefs.batch_enabled || steps_mode).then(|| BatchInfo {
            name: prefs.batch_name.clone(),
            id: self.ctx.batch_id(),
        });

        Ok(TestParameters {
            app_name,
            test_name,
            branch_name: prefs.branch_name.clone(),
            parent_branch_name: prefs.parent_branch_name.clone(),
            os: platform.os,
            hosting_app: platform.browser,
            inferred_environment: format!("useragent:{}", platform.user_agent),
            match_level: prefs.match_level,
            viewport_size: prefs.viewport_size,
            batch,
        })
    }

    // ------------------------------------------------------------------
    // Crawl
    // ------------------------------------------------------------------

    /// Test every page the active tab's sitemap lists.
    pub async fn crawl(&self, source: &dyn SitemapSource) -> HarnessResult<CrawlReport> {
        let result = self.crawl_site(source).await;
        match &result {
            Ok(report) => {
                for failure in &report.failed {
                    self.ctx
                        .report_error(Some(&format!("{}: {}", failure.url, failure.error)));
                }
                if !report.interrupted.is_empty() {
                    self.ctx.warn(format!(
                        "{} pages were not tested because their crawl tab was closed",
                        report.interrupted.len()
                    ));
                }
            }
            Err(err) if !err.is_tab_closed() => self.ctx.report_error(Some(&err.to_string())),
            Err(_) => {}
        }
        result
    }

    async fn crawl_site(&self, source: &dyn SitemapSource) -> HarnessResult<CrawlReport> {
        let credentials = self.auth.credentials().await?;
        let tab = self.browser.active_tab().await?;
        let prefs = Preferences::load(self.store.as_ref()).await?;

        let urls = crawl::discover(source, &tab.url, self.config.crawl.max_urls).await?;
        self.ctx
            .info(format!("Crawling {} pages from {}", urls.len(), tab.url));

        let prep = self.preparer.prepare(tab.id, prefs.viewport_size).await?;
        let tester = CrawlPageTest {
            coordinator: self,
            prefs: &prefs,
            credentials: &credentials,
            results_window: prep.original.window.id,
        };
        let orchestrator = CrawlOrchestrator::new(self.browser.as_ref(), &self.config.crawl);
        let crawled = orchestrator
            .run(prep.updated.window.id, urls, &tester)
            .await;
        let restored = self.preparer.restore(&prep).await;

        let report = crawled?;
        restored?;
        self.ctx.info(format!(
            "Crawl finished: {} tested, {} failed",
            report.tested.len(),
            report.failed.len()
        ));
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    /// Replace the step list with the non-blank lines of `raw`.
    pub fn set_steps(&self, raw: &str) -> usize {
        let mut steps = self.steps.lock();
        steps.set_steps(raw);
        self.results.forget(STEPS_KEY);
        steps.count()
    }

    pub fn reset_steps(&self) {
        self.steps.lock().reset();
    }

    pub fn steps(&self) -> Vec<String> {
        self.steps.lock().steps().to_vec()
    }

    pub fn step_count(&self) -> usize {
        self.steps.lock().count()
    }

    pub fn current_step_index(&self) -> Option<usize> {
        self.steps.lock().current_index()
    }

    pub fn current_step(&self) -> Option<String> {
        self.steps.lock().current().map(str::to_string)
    }

    pub fn move_to_next_step(&self) -> Option<String> {
        self.steps.lock().move_next().map(str::to_string)
    }

    pub fn move_to_previous_step(&self) -> Option<String> {
        self.steps.lock().move_prev().map(str::to_string)
    }

    pub fn move_to_step(&self, index: usize) -> Option<String> {
        self.steps.lock().move_to(index).map(str::to_string)
    }

    // ------------------------------------------------------------------
    // Baseline image
    // ------------------------------------------------------------------

    /// Keep `png` as the image submitted instead of a live capture.
    pub fn load_baseline_image(&self, png: Vec<u8>) -> HarnessResult<(u32, u32)> {
        let dimensions =
            image_dimensions(&png).map_err(|e| HarnessError::BaselineImage(e.to_string()))?;
        self.baseline_image.lock().png = Some(png);
        self.ctx.info(format!(
            "Loaded baseline image {}x{}",
            dimensions.0, dimensions.1
        ));
        Ok(dimensions)
    }

    pub fn set_use_baseline_image(&self, enabled: bool) {
        self.baseline_image.lock().enabled = enabled;
    }

    pub fn uses_baseline_image(&self) -> bool {
        self.baseline_image.lock().enabled
    }

    pub fn clear_baseline_image(&self) {
        *self.baseline_image.lock() = BaselineImage::default();
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    pub async fn auth_state(&self) -> HarnessResult<AuthState> {
        Ok(self.auth.state().await?)
    }

    pub async fn reload_accounts(&self) -> HarnessResult<AuthState> {
        Ok(self.auth.reload().await?)
    }

    pub async fn accounts(&self) -> HarnessResult<Option<Vec<Account>>> {
        Ok(self.auth.accounts().await?)
    }

    pub async fn current_account_index(&self) -> HarnessResult<Option<usize>> {
        Ok(self.auth.current_account_index().await?)
    }

    pub async fn set_current_account(&self, account_id: &str) -> HarnessResult<()> {
        self.auth.state().await?;
        Ok(self.auth.set_current_account(account_id).await?)
    }

    pub async fn run_key(&self) -> HarnessResult<String> {
        Ok(self.auth.run_key().await?)
    }

    pub async fn results_view_key(&self) -> HarnessResult<String> {
        Ok(self.auth.results_view_key().await?)
    }

    pub async fn access_key(&self) -> HarnessResult<String> {
        Ok(self.auth.access_key().await?)
    }

    // ------------------------------------------------------------------
    // Run state
    // ------------------------------------------------------------------

    pub fn running_tests(&self) -> usize {
        self.ctx.running_tests()
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.ctx.logs()
    }

    pub fn new_batch(&self) -> String {
        self.ctx.new_batch()
    }

    pub fn main_view_opened(&self) {
        self.ctx.main_view_opened();
    }

    pub fn secondary_view_opened(&self) {
        self.ctx.secondary_view_opened();
    }

    pub fn subscribe(&self) -> watch::Receiver<Indicator> {
        self.ctx.subscribe()
    }

    /// Forward tab removals to the lifecycle tracker until the browser goes
    /// away.
    pub async fn watch_tab_removals(&self) {
        let removals = self.browser.subscribe_tab_removals();
        self.forward_removals(removals).await;
    }

    /// Like [`Self::watch_tab_removals`], on its own task. The subscription
    /// is taken before this returns, so no removal after it is missed.
    pub fn spawn_removal_watcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let removals = self.browser.subscribe_tab_removals();
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.forward_removals(removals).await })
    }

    async fn forward_removals(&self, mut removals: broadcast::Receiver<TabId>) {
        loop {
            match removals.recv().await {
                Ok(tab_id) => {
                    let ended = self.tracker.on_tab_closed(tab_id);
                    if ended > 0 {
                        debug!(tab_id, ended, "tracked tab removed");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "missed tab removal notifications");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

struct CrawlPageTest<'a> {
    coordinator: &'a TestRunCoordinator,
    prefs: &'a Preferences,
    credentials: &'a AccountCredentials,
    results_window: WindowId,
}

#[async_trait]
impl<'a> PageTest for CrawlPageTest<'a> {
    async fn test_page(&self, tab_id: TabId, url: &str) -> HarnessResult<TestReport> {
        // Every page is named after its own URL.
        let params = self
            .coordinator
            .build_parameters(url, self.prefs, &BaselineSelection::Default, None)
            .await?;
        let target = RunTarget {
            tab_id,
            results_window: self.results_window,
            steps_mode: false,
        };
        self.coordinator
            .execute(target, params, self.prefs, self.credentials, None)
            .await
    }
}

/// Activate the tab and capture its window. Runs inside the task runner.
async fn capture_tab(
    browser: &dyn BrowserSurface,
    tab_id: TabId,
    options: CaptureOptions,
    hide_scrollbars: bool,
) -> BrowserResult<Vec<u8>> {
    let tab = browser.update_tab(tab_id, TabUpdate::activate()).await?;
    if hide_scrollbars {
        browser.execute_script(tab_id, HIDE_SCROLLBARS_SCRIPT).await?;
    }
    let captured = browser.capture_visible_tab(tab.window_id, options).await;
    if hide_scrollbars {
        if let Err(err) = browser.execute_script(tab_id, SHOW_SCROLLBARS_SCRIPT).await {
            warn!(tab_id, error = %err, "could not restore scrollbars");
        }
    }
    decode_data_url(&captured?)
}

/// App name (host) and test name (path, optionally with the query) of a URL.
pub fn names_from_url(raw: &str, with_query: bool) -> (String, String) {
    match url::Url::parse(raw) {
        Ok(parsed) => {
            let app = parsed.host_str().unwrap_or(raw).to_string();
            let mut test = parsed.path().to_string();
            if with_query {
                if let Some(query) = parsed.query() {
                    test.push('?');
                    test.push_str(query);
                }
            }
            (app, test)
        }
        Err(_) => (raw.to_string(), raw.to_string()),
    }
}
