//! Reusable tabs for showing check results.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::browser::{BrowserError, BrowserResult, BrowserSurface, CreateTab, TabId, TabUpdate, WindowId};
use crate::harness::types::TestParameters;

/// Cache key shared by every result of a steps run
pub const STEPS_KEY: &str = "steps";

/// How a result should be displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayOptions {
    /// Open (or reuse) a tab at all
    pub open_in_new_tab: bool,
    /// All results of the run share one tab
    pub steps_mode: bool,
}

pub struct ResultTabCache {
    browser: Arc<dyn BrowserSurface>,
    tabs: Mutex<HashMap<String, TabId>>,
}

impl ResultTabCache {
    pub fn new(browser: Arc<dyn BrowserSurface>) -> Self {
        Self {
            browser,
            tabs: Mutex::new(HashMap::new()),
        }
    }

    /// Show `result_url` in a background tab of `target_window`.
    ///
    /// Returns the tab used, or `None` when results are not opened in tabs.
    pub async fn show_results(
        &self,
        result_url: &str,
        params: &TestParameters,
        target_window: WindowId,
        options: DisplayOptions,
    ) -> BrowserResult<Option<TabId>> {
        if !options.open_in_new_tab {
            return Ok(None);
        }

        let key = if options.steps_mode {
            STEPS_KEY.to_string()
        } else {
            params.fingerprint()
        };

        let cached = self.tabs.lock().get(&key).copied();
        if let Some(tab_id) = cached {
            match self.browser.update_tab(tab_id, TabUpdate::navigate(result_url)).await {
                Ok(tab) => {
                    debug!(tab = tab.id, "reused results tab");
                    return Ok(Some(tab.id));
                }
                Err(BrowserError::TabNotFound(_)) => {
                    debug!(tab = tab_id, "results tab is gone, opening another");
                }
                Err(err) => return Err(err),
            }
        }

        let tab = self
            .browser
            .create_tab(CreateTab {
                window_id: target_window,
                url: result_url.to_string(),
                active: false,
                index: None,
            })
            .await?;
        info!(tab = tab.id, window = target_window, "opened results tab");
        self.tabs.lock().insert(key, tab.id);
        Ok(Some(tab.id))
    }

    pub fn cached_tab(&self, key: &str) -> Option<TabId> {
        self.tabs.lock().get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.tabs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.lock().is_empty()
    }

    /// Drop the entry for `key`; the tab itself stays open.
    pub fn forget(&self, key: &str) -> Option<TabId> {
        self.tabs.lock().remove(key)
    }
}

/// Append the account id as the `accountId` query parameter.
pub fn with_account_id(result_url: &str, account_id: &str) -> String {
    match url::Url::parse(result_url) {
        Ok(mut parsed) => {
            parsed.query_pairs_mut().append_pair("accountId", account_id);
            parsed.into()
        }
        Err(_) => result_url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserCall, SimulatedBrowser, Size};
    use crate::harness::types::MatchLevel;

    fn params(test_name: &str) -> TestParameters {
        TestParameters {
            app_name: "example.com".to_string(),
            test_name: test_name.to_string(),
            branch_name: None,
            parent_branch_name: None,
            os: "Linux".to_string(),
            hosting_app: "Simulated".to_string(),
            inferred_environment: "useragent:test".to_string(),
            match_level: MatchLevel::Strict,
            viewport_size: Size::new(800, 600),
            batch: None,
        }
    }

    const SHOW: DisplayOptions = DisplayOptions {
        open_in_new_tab: true,
        steps_mode: false,
    };

    fn setup() -> (Arc<SimulatedBrowser>, ResultTabCache, WindowId) {
        let browser = Arc::new(SimulatedBrowser::new());
        let (window, _) = browser.open_window(Size::new(1000, 800), &["https://example.com/"]);
        let cache = ResultTabCache::new(browser.clone());
        (browser, cache, window)
    }

    #[tokio::test]
    async fn test_identical_parameters_reuse_tab() {
        let (browser, cache, window) = setup();
        let first = cache.show_results("https://r/1", &params("/a"), window, SHOW).await.unwrap();
        let second = cache.show_results("https://r/2", &params("/a"), window, SHOW).await.unwrap();
        assert_eq!(first, second);

        let tab = browser.get_tab(first.unwrap()).await.unwrap();
        assert_eq!(tab.url, "https://r/2");
        assert!(!tab.active);
    }

    #[tokio::test]
    async fn test_different_test_names_get_different_tabs() {
        let (_, cache, window) = setup();
        let a = cache.show_results("https://r/a", &params("/a"), window, SHOW).await.unwrap();
        let b = cache.show_results("https://r/b", &params("/b"), window, SHOW).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_steps_mode_shares_one_tab() {
        let (_, cache, window) = setup();
        let steps = DisplayOptions {
            open_in_new_tab: true,
            steps_mode: true,
        };
        let a = cache.show_results("https://r/a", &params("/a"), window, steps).await.unwrap();
        let b = cache.show_results("https://r/b", &params("/b"), window, steps).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.cached_tab(STEPS_KEY), a);
    }

    #[tokio::test]
    async fn test_forget_drops_only_that_key() {
        let (_, cache, window) = setup();
        let steps = DisplayOptions {
            open_in_new_tab: true,
            steps_mode: true,
        };
        let shared = cache.show_results("https://r/s", &params("/s"), window, steps).await.unwrap();
        let keyed = cache.show_results("https://r/a", &params("/a"), window, SHOW).await.unwrap();

        assert_eq!(cache.forget(STEPS_KEY), shared);
        assert_eq!(cache.cached_tab(STEPS_KEY), None);
        assert_eq!(cache.cached_tab(&params("/a").fingerprint()), keyed);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_tab_is_replaced() {
        let (browser, cache, window) = setup();
        let first = cache
            .show_results("https://r/1", &params("/a"), window, SHOW)
            .await
            .unwrap()
            .unwrap();
        browser.close_tab(first).unwrap();

        let second = cache
            .show_results("https://r/2", &params("/a"), window, SHOW)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(cache.cached_tab(&params("/a").fingerprint()), Some(second));
    }

    #[tokio::test]
    async fn test_disabled_opens_nothing() {
        let (browser, cache, window) = setup();
        browser.clear_calls();
        let hidden = DisplayOptions {
            open_in_new_tab: false,
            steps_mode: false,
        };
        let shown = cache.show_results("https://r/1", &params("/a"), window, hidden).await.unwrap();
        assert_eq!(shown, None);
        assert!(!browser.calls().iter().any(|c| matches!(c, BrowserCall::CreateTab { .. })));
    }

    #[test]
    fn test_with_account_id() {
        assert_eq!(
            with_account_id("https://eyes.example.com/app/batches/1?x=1", "acct 9"),
            "https://eyes.example.com/app/batches/1?x=1&accountId=acct+9"
        );
        assert_eq!(with_account_id("not a url", "a"), "not a url");
    }
}
