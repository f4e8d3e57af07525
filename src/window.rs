//! Bringing a tab to an exact viewport size, and putting it back afterwards.
//!
//! A tab sharing its window with other tabs is moved into a window of its
//! own; a tab alone in its window is resized in place. Window managers don't
//! always honour a resize on the first try, so resizing goes through
//! [`retry_settled`]: resize, wait for the window to settle, measure, repeat
//! up to the attempt budget. Whatever happens, a failed preparation restores
//! the original layout before returning the error.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::browser::{
    BrowserError, BrowserSurface, CreateWindow, Size, Tab, TabId, TabUpdate, Window, WindowUpdate,
};
use crate::config::WindowSettings;

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error("viewport could not be set to {requested} after {attempts} attempts, last size was {actual}")]
    SizeMismatch {
        requested: Size,
        actual: Size,
        attempts: u32,
    },
}

/// Bounded attempts with a fixed settle delay between acting and measuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub settle: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, settle: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            settle,
        }
    }
}

impl From<&WindowSettings> for RetryPolicy {
    fn from(settings: &WindowSettings) -> Self {
        Self::new(settings.resize_attempts, settings.resize_settle)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&WindowSettings::defaults())
    }
}

/// Verdict of one measurement.
pub enum Attempt<T> {
    Done(T),
    Retry(T),
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    Exhausted { last: T, attempts: u32 },
}

/// Run `act`, sleep `policy.settle`, run `measure`; repeat while `measure`
/// asks for a retry and attempts remain. Errors end the loop immediately.
pub async fn retry_settled<T, E, A, AF, M, MF>(
    policy: RetryPolicy,
    mut act: A,
    mut measure: M,
) -> Result<RetryOutcome<T>, E>
where
    A: FnMut(u32) -> AF,
    AF: Future<Output = Result<(), E>>,
    M: FnMut() -> MF,
    MF: Future<Output = Result<Attempt<T>, E>>,
{
    let mut attempt = 1;
    loop {
        act(attempt).await?;
        if !policy.settle.is_zero() {
            tokio::time::sleep(policy.settle).await;
        }
        match measure().await? {
            Attempt::Done(value) => {
                return Ok(RetryOutcome::Succeeded {
                    value,
                    attempts: attempt,
                });
            }
            Attempt::Retry(last) if attempt >= policy.max_attempts => {
                return Ok(RetryOutcome::Exhausted {
                    last,
                    attempts: attempt,
                });
            }
            Attempt::Retry(_) => attempt += 1,
        }
    }
}

/// Where the tab ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTab {
    pub tab: Tab,
    pub window: Window,
    pub is_new_window_created: bool,
}

/// What is needed to put the tab back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalLayout {
    pub window: Window,
    pub tab_index: usize,
    pub window_size: Size,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowPreparation {
    pub updated: PreparedTab,
    pub original: OriginalLayout,
}

pub struct WindowPreparer {
    browser: Arc<dyn BrowserSurface>,
    policy: RetryPolicy,
}

impl WindowPreparer {
    pub fn new(browser: Arc<dyn BrowserSurface>, policy: RetryPolicy) -> Self {
        Self { browser, policy }
    }

    /// Get `tab_id`'s content area to exactly `viewport`.
    pub async fn prepare(&self, tab_id: TabId, viewport: Size) -> Result<WindowPreparation, PrepareError> {
        let tab = self.browser.get_tab(tab_id).await?;
        let window = self.browser.get_window(tab.window_id).await?;
        let original = OriginalLayout {
            window: window.clone(),
            tab_index: tab.index,
            window_size: window.size,
        };

        let updated = if window.tab_ids.len() > 1 {
            let approximate = viewport.grow_by_frame(window.size, tab.content_size);
            debug!(tab_id, %approximate, "moving tab into a new window");
            let new_window = self
                .browser
                .create_window(CreateWindow {
                    tab_id: Some(tab_id),
                    left: Some(window.left),
                    top: Some(window.top),
                    size: Some(approximate),
                    focused: true,
                    ..Default::default()
                })
                .await?;
            PreparedTab {
                tab: self.browser.get_tab(tab_id).await?,
                window: new_window,
                is_new_window_created: true,
            }
        } else {
            PreparedTab {
                tab,
                window,
                is_new_window_created: false,
            }
        };

        let mut preparation = WindowPreparation { updated, original };
        match self.fit(&preparation.updated, viewport).await {
            Ok(fitted) => {
                preparation.updated = fitted;
                Ok(preparation)
            }
            Err(err) => {
                warn!(tab_id, error = %err, "window preparation failed, restoring layout");
                if let Err(restore_err) = self.restore(&preparation).await {
                    warn!(tab_id, error = %restore_err, "restoring after failed preparation failed");
                }
                Err(err)
            }
        }
    }

    async fn fit(&self, prepared: &PreparedTab, viewport: Size) -> Result<PreparedTab, PrepareError> {
        let browser = &self.browser;
        let tab_id = prepared.tab.id;
        let window_id = prepared.window.id;

        let outcome = retry_settled(
            self.policy,
            move |attempt| async move {
                let tab = browser.get_tab(tab_id).await?;
                let window = browser.get_window(window_id).await?;
                let required = viewport.grow_by_frame(window.size, tab.content_size);
                debug!(tab_id, attempt, %required, "resizing window");
                browser
                    .update_window(window_id, WindowUpdate::resize(required))
                    .await?;
                Ok::<(), PrepareError>(())
            },
            move || async move {
                let tab = browser.get_tab(tab_id).await?;
                let verdict = if tab.content_size == viewport {
                    Attempt::Done(tab)
                } else {
                    Attempt::Retry(tab)
                };
                Ok::<_, PrepareError>(verdict)
            },
        )
        .await?;

        match outcome {
            RetryOutcome::Succeeded { value, attempts } => {
                info!(tab_id, %viewport, attempts, "viewport prepared");
                Ok(PreparedTab {
                    window: self.browser.get_window(value.window_id).await?,
                    tab: value,
                    is_new_window_created: prepared.is_new_window_created,
                })
            }
            RetryOutcome::Exhausted { last, attempts } => Err(PrepareError::SizeMismatch {
                requested: viewport,
                actual: last.content_size,
                attempts,
            }),
        }
    }

    /// Put the tab back where it was and return its fresh state.
    pub async fn restore(&self, preparation: &WindowPreparation) -> Result<Tab, PrepareError> {
        let tab_id = preparation.updated.tab.id;
        let original = &preparation.original;

        if preparation.updated.is_new_window_created {
            debug!(tab_id, window_id = original.window.id, "moving tab back to its window");
            self.browser
                .move_tab(tab_id, original.window.id, original.tab_index)
                .await?;
            self.browser.update_tab(tab_id, TabUpdate::activate()).await?;
            self.browser
                .update_window(
                    original.window.id,
                    WindowUpdate {
                        focused: Some(true),
                        ..Default::default()
                    },
                )
                .await?;
        } else {
            debug!(tab_id, size = %original.window_size, "resizing window back");
            self.browser
                .update_window(original.window.id, WindowUpdate::resize(original.window_size))
                .await?;
        }

        Ok(self.browser.get_tab(tab_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{ResizeBehavior, SimulatedBrowser};

    fn preparer(browser: &Arc<SimulatedBrowser>) -> WindowPreparer {
        let surface: Arc<dyn BrowserSurface> = browser.clone();
        WindowPreparer::new(surface, RetryPolicy::new(4, Duration::ZERO))
    }

    #[tokio::test]
    async fn test_single_tab_window_resized_in_place_and_restored() {
        let browser = Arc::new(SimulatedBrowser::new());
        let (window_id, tabs) = browser.open_window(Size::new(1000, 800), &["https://example.com/"]);
        let preparer = preparer(&browser);

        let prep = preparer.prepare(tabs[0], Size::new(800, 600)).await.unwrap();
        assert!(!prep.updated.is_new_window_created);
        assert_eq!(prep.updated.tab.content_size, Size::new(800, 600));
        assert_eq!(prep.original.window_size, Size::new(1000, 800));

        let tab = preparer.restore(&prep).await.unwrap();
        assert_eq!(tab.window_id, window_id);
        assert_eq!(
            browser.resize_requests(),
            vec![Size::new(816, 688), Size::new(1000, 800)]
        );
        assert_eq!(browser.get_window(window_id).await.unwrap().size, Size::new(1000, 800));
    }

    #[tokio::test]
    async fn test_shared_window_moves_tab_out_and_back() {
        let browser = Arc::new(SimulatedBrowser::new());
        let (window_id, tabs) = browser.open_window(
            Size::new(1200, 900),
            &["https://a.test/", "https://b.test/", "https://c.test/"],
        );
        browser.update_tab(tabs[1], TabUpdate::activate()).await.unwrap();
        let preparer = preparer(&browser);

        let prep = preparer.prepare(tabs[1], Size::new(640, 480)).await.unwrap();
        assert!(prep.updated.is_new_window_created);
        assert_ne!(prep.updated.window.id, window_id);
        assert_eq!(prep.updated.tab.content_size, Size::new(640, 480));
        assert_eq!(browser.window_count(), 2);

        let tab = preparer.restore(&prep).await.unwrap();
        assert_eq!(tab.window_id, window_id);
        assert_eq!(tab.index, 1);
        assert!(tab.active);
        assert_eq!(browser.window_count(), 1);
        assert_eq!(browser.get_window(window_id).await.unwrap().size, Size::new(1200, 900));
    }

    #[tokio::test]
    async fn test_always_undershooting_resize_fails_after_four_attempts() {
        let browser = Arc::new(SimulatedBrowser::new());
        browser.set_resize_behavior(ResizeBehavior::ScreenLimit(Size::new(1200, 900)));
        let (window_id, tabs) = browser.open_window(Size::new(1000, 800), &["https://example.com/"]);
        let preparer = preparer(&browser);

        let err = preparer.prepare(tabs[0], Size::new(1500, 1000)).await.unwrap_err();
        match err {
            PrepareError::SizeMismatch {
                requested,
                actual,
                attempts,
            } => {
                assert_eq!(requested, Size::new(1500, 1000));
                assert_eq!(actual, Size::new(1184, 812));
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected error: {other}"),
        }

        let requests = browser.resize_requests();
        assert_eq!(requests.len(), 5);
        assert!(requests[..4].iter().all(|s| *s == Size::new(1516, 1088)));
        assert_eq!(requests[4], Size::new(1000, 800));
        assert_eq!(browser.get_window(window_id).await.unwrap().size, Size::new(1000, 800));
    }

    #[tokio::test]
    async fn test_lagging_resize_succeeds_on_retry() {
        let browser = Arc::new(SimulatedBrowser::new());
        browser.set_resize_behavior(ResizeBehavior::Lagging {
            misses: 2,
            shortfall: 10,
        });
        let (_, tabs) = browser.open_window(Size::new(1000, 800), &["https://example.com/"]);
        let preparer = preparer(&browser);

        let prep = preparer.prepare(tabs[0], Size::new(800, 600)).await.unwrap();
        assert_eq!(prep.updated.tab.content_size, Size::new(800, 600));
        assert_eq!(browser.resize_requests().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_preparation_in_new_window_returns_tab() {
        let browser = Arc::new(SimulatedBrowser::new());
        let (window_id, tabs) =
            browser.open_window(Size::new(1000, 800), &["https://a.test/", "https://b.test/"]);
        browser.set_resize_behavior(ResizeBehavior::ScreenLimit(Size::new(1000, 800)));
        let preparer = preparer(&browser);

        let result = preparer.prepare(tabs[0], Size::new(1400, 1000)).await;
        assert!(matches!(result, Err(PrepareError::SizeMismatch { attempts: 4, .. })));
        let tab = browser.get_tab(tabs[0]).await.unwrap();
        assert_eq!(tab.window_id, window_id);
        assert_eq!(tab.index, 0);
        assert_eq!(browser.window_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_settled_stops_at_budget() {
        let mut acts = 0;
        let outcome: RetryOutcome<u32> = retry_settled(
            RetryPolicy::new(3, Duration::ZERO),
            |_| {
                acts += 1;
                async { Ok::<(), ()>(()) }
            },
            || async { Ok(Attempt::Retry(9)) },
        )
        .await
        .unwrap();
        assert_eq!(outcome, RetryOutcome::Exhausted { last: 9, attempts: 3 });
        assert_eq!(acts, 3);
    }
}
