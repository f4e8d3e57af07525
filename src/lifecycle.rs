//! Bookkeeping of in-flight tests per tab.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::browser::TabId;
use crate::state::RunContext;

/// The test currently running in a tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTest {
    pub app_name: String,
    pub test_name: String,
}

/// One started test, as returned by [`TestLifecycleTracker::test_started`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TestHandle {
    id: u64,
    pub tab_id: TabId,
}

#[derive(Default)]
struct Records {
    next_id: u64,
    tests: BTreeMap<u64, (TabId, RunningTest)>,
}

pub struct TestLifecycleTracker {
    ctx: Arc<RunContext>,
    running: Mutex<Records>,
}

impl TestLifecycleTracker {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self {
            ctx,
            running: Mutex::new(Records::default()),
        }
    }

    /// Record a test on `tab_id`. Several tests may run on the same tab.
    pub fn test_started(&self, tab_id: TabId, app_name: &str, test_name: &str) -> TestHandle {
        let id = {
            let mut records = self.running.lock();
            let id = records.next_id;
            records.next_id += 1;
            records.tests.insert(
                id,
                (
                    tab_id,
                    RunningTest {
                        app_name: app_name.to_string(),
                        test_name: test_name.to_string(),
                    },
                ),
            );
            id
        };
        let running = self.ctx.increment_running();
        self.ctx.info(format!(
            "Test started: {} / {} (tab {}, {} running)",
            app_name, test_name, tab_id, running
        ));
        TestHandle { id, tab_id }
    }

    /// Decrement the run counter (clamped at zero) and log the end of a test.
    pub fn test_ended(&self, app_name: Option<&str>, test_name: Option<&str>) {
        let running = self.ctx.decrement_running();
        match (app_name, test_name) {
            (Some(app), Some(test)) => self
                .ctx
                .info(format!("Test ended: {} / {} ({} running)", app, test, running)),
            _ => self.ctx.info(format!("Test ended ({} running)", running)),
        }
    }

    /// End the test behind `handle`.
    ///
    /// Returns `false` when its record is gone, which happens when the tab
    /// was closed mid-test and [`Self::on_tab_closed`] already accounted
    /// for it.
    pub fn finish(&self, handle: TestHandle) -> bool {
        let record = self.running.lock().tests.remove(&handle.id);
        match record {
            Some((_, test)) => {
                self.test_ended(Some(&test.app_name), Some(&test.test_name));
                true
            }
            None => false,
        }
    }

    /// A tab went away. Every test tracked on it counts as terminated.
    ///
    /// Returns how many tests were running on the tab.
    pub fn on_tab_closed(&self, tab_id: TabId) -> usize {
        let closed: Vec<RunningTest> = {
            let mut records = self.running.lock();
            let ids: Vec<u64> = records
                .tests
                .iter()
                .filter(|(_, (tab, _))| *tab == tab_id)
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| records.tests.remove(id))
                .map(|(_, test)| test)
                .collect()
        };
        for test in &closed {
            let running = self.ctx.decrement_running();
            self.ctx.warn(format!(
                "Tab {} was closed before test finished: {} / {} ({} running)",
                tab_id, test.app_name, test.test_name, running
            ));
        }
        closed.len()
    }

    /// Tests running on `tab_id`, oldest first.
    pub fn running_on(&self, tab_id: TabId) -> Vec<RunningTest> {
        self.running
            .lock()
            .tests
            .values()
            .filter(|(tab, _)| *tab == tab_id)
            .map(|(_, test)| test.clone())
            .collect()
    }

    pub fn tracked_tests(&self) -> usize {
        self.running.lock().tests.len()
    }

    pub fn running_tests(&self) -> usize {
        self.ctx.running_tests()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LogLevel;

    fn tracker() -> (Arc<RunContext>, TestLifecycleTracker) {
        let ctx = Arc::new(RunContext::new());
        let tracker = TestLifecycleTracker::new(Arc::clone(&ctx));
        (ctx, tracker)
    }

    fn test(app: &str, name: &str) -> RunningTest {
        RunningTest {
            app_name: app.to_string(),
            test_name: name.to_string(),
        }
    }

    #[test]
    fn test_started_records_tab_and_counts() {
        let (ctx, tracker) = tracker();
        let handle = tracker.test_started(7, "shop", "/cart");
        assert_eq!(handle.tab_id, 7);
        assert_eq!(tracker.running_tests(), 1);
        assert_eq!(tracker.running_on(7), vec![test("shop", "/cart")]);
        assert_eq!(ctx.indicator().running, 1);
        assert!(ctx.logs().last().unwrap().message.contains("Test started"));
    }

    #[test]
    fn test_extra_ends_never_go_negative() {
        let (_, tracker) = tracker();
        tracker.test_started(1, "a", "t");
        tracker.test_ended(Some("a"), Some("t"));
        tracker.test_ended(None, None);
        tracker.test_ended(None, None);
        assert_eq!(tracker.running_tests(), 0);
    }

    #[test]
    fn test_tab_closed_cleans_up_and_warns() {
        let (ctx, tracker) = tracker();
        let closed = tracker.test_started(3, "a", "t");
        tracker.test_started(4, "a", "u");

        assert_eq!(tracker.on_tab_closed(3), 1);
        assert_eq!(tracker.running_tests(), 1);
        assert!(tracker.running_on(3).is_empty());
        let last = ctx.logs().pop().unwrap();
        assert_eq!(last.level, LogLevel::Warn);
        assert!(last.message.contains("closed before test finished"));

        // The run finishing afterwards must not count the tab twice.
        assert!(!tracker.finish(closed));
        assert_eq!(tracker.running_tests(), 1);
    }

    #[test]
    fn test_untracked_tab_close_is_ignored() {
        let (ctx, tracker) = tracker();
        tracker.test_started(1, "a", "t");
        assert_eq!(tracker.on_tab_closed(99), 0);
        assert_eq!(ctx.running_tests(), 1);
    }

    #[test]
    fn test_finish_ends_tracked_test() {
        let (_, tracker) = tracker();
        let handle = tracker.test_started(5, "a", "t");
        assert!(tracker.finish(handle));
        assert_eq!(tracker.running_tests(), 0);
        assert_eq!(tracker.tracked_tests(), 0);
    }

    #[test]
    fn test_overlapping_tests_on_one_tab_each_finish() {
        let (ctx, tracker) = tracker();
        let first = tracker.test_started(2, "a", "t");
        let second = tracker.test_started(2, "a", "u");
        assert_eq!(tracker.running_on(2), vec![test("a", "t"), test("a", "u")]);

        assert!(tracker.finish(second));
        assert_eq!(tracker.running_on(2), vec![test("a", "t")]);
        assert!(tracker.finish(first));
        assert_eq!(tracker.running_tests(), 0);
        assert_eq!(ctx.indicator().running, 0);
        assert!(!tracker.finish(first));
    }

    #[test]
    fn test_closing_tab_ends_every_test_on_it() {
        let (ctx, tracker) = tracker();
        let first = tracker.test_started(2, "a", "t");
        let second = tracker.test_started(2, "a", "u");
        tracker.test_started(9, "a", "v");

        assert_eq!(tracker.on_tab_closed(2), 2);
        assert_eq!(tracker.running_tests(), 1);
        let warnings = ctx.logs().iter().filter(|e| e.level == LogLevel::Warn).count();
        assert_eq!(warnings, 2);
        assert!(!tracker.finish(first));
        assert!(!tracker.finish(second));
        assert_eq!(tracker.running_tests(), 1);
    }
}
