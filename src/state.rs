//! Process-wide run state shared by every component.
//!
//! One [`RunContext`] is created per process and handed (as an `Arc`) to the
//! components that read or write it. Every mutation is a short critical
//! section; nothing here is held across an await point.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::LOG_CAPACITY;

/// Message used when a failure is reported without a specific one.
pub const DEFAULT_ERROR_MESSAGE: &str = "Test run failed, see the log for details";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// What the toolbar badge shows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indicator {
    pub running: usize,
    /// Set while an error has not been seen in the main view
    pub error: Option<String>,
}

#[derive(Debug)]
struct RunState {
    running: usize,
    batch_id: String,
    logs: VecDeque<LogEntry>,
    new_errors: bool,
    unread_errors: bool,
    last_error: Option<String>,
}

pub struct RunContext {
    state: Mutex<RunState>,
    indicator: watch::Sender<Indicator>,
}

impl RunContext {
    pub fn new() -> Self {
        let (indicator, _) = watch::channel(Indicator::default());
        Self {
            state: Mutex::new(RunState {
                running: 0,
                batch_id: new_batch_id(),
                logs: VecDeque::with_capacity(LOG_CAPACITY),
                new_errors: false,
                unread_errors: false,
                last_error: None,
            }),
            indicator,
        }
    }

    pub fn running_tests(&self) -> usize {
        self.state.lock().running
    }

    pub fn increment_running(&self) -> usize {
        let running = {
            let mut state = self.state.lock();
            state.running += 1;
            state.running
        };
        self.publish();
        running
    }

    /// Decrement the run counter; it never goes below zero.
    pub fn decrement_running(&self) -> usize {
        let running = {
            let mut state = self.state.lock();
            state.running = state.running.saturating_sub(1);
            state.running
        };
        self.publish();
        running
    }

    pub fn batch_id(&self) -> String {
        self.state.lock().batch_id.clone()
    }

    /// Start a new batch; later tests are grouped under the returned id.
    pub fn new_batch(&self) -> String {
        let id = new_batch_id();
        self.state.lock().batch_id = id.clone();
        self.info(format!("Started new batch {}", id));
        id
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => info!("{}", message),
            LogLevel::Warn => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
        let mut state = self.state.lock();
        if state.logs.len() == LOG_CAPACITY {
            state.logs.pop_front();
        }
        state.logs.push_back(LogEntry {
            timestamp: Utc::now(),
            level,
            message,
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    /// Oldest first.
    pub fn logs(&self) -> Vec<LogEntry> {
        self.state.lock().logs.iter().cloned().collect()
    }

    /// Flag a failure: both error flags go up and the badge turns red.
    pub fn report_error(&self, message: Option<&str>) {
        let message = message.unwrap_or(DEFAULT_ERROR_MESSAGE).to_string();
        self.log(LogLevel::Error, message.clone());
        {
            let mut state = self.state.lock();
            state.new_errors = true;
            state.unread_errors = true;
            state.last_error = Some(message);
        }
        self.publish();
    }

    pub fn new_errors_exist(&self) -> bool {
        self.state.lock().new_errors
    }

    pub fn unread_errors_exist(&self) -> bool {
        self.state.lock().unread_errors
    }

    /// The main view (popup) was opened: the new-error badge is cleared.
    pub fn main_view_opened(&self) {
        self.state.lock().new_errors = false;
        self.publish();
    }

    /// The log view was opened: errors count as read.
    pub fn secondary_view_opened(&self) {
        self.state.lock().unread_errors = false;
    }

    pub fn indicator(&self) -> Indicator {
        self.indicator.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Indicator> {
        self.indicator.subscribe()
    }

    fn publish(&self) {
        let next = {
            let state = self.state.lock();
            Indicator {
                running: state.running,
                error: if state.new_errors {
                    state.last_error.clone()
                } else {
                    None
                },
            }
        };
        self.indicator.send_replace(next);
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

fn new_batch_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_never_goes_negative() {
        let ctx = RunContext::new();
        ctx.increment_running();
        assert_eq!(ctx.decrement_running(), 0);
        assert_eq!(ctx.decrement_running(), 0);
        assert_eq!(ctx.running_tests(), 0);
    }

    #[test]
    fn test_log_ring_evicts_oldest() {
        let ctx = RunContext::new();
        for i in 0..(LOG_CAPACITY + 5) {
            ctx.info(format!("entry {}", i));
        }
        let logs = ctx.logs();
        assert_eq!(logs.len(), LOG_CAPACITY);
        assert_eq!(logs[0].message, "entry 5");
        assert_eq!(logs[LOG_CAPACITY - 1].message, format!("entry {}", LOG_CAPACITY + 4));
    }

    #[test]
    fn test_error_flags_are_cleared_independently() {
        let ctx = RunContext::new();
        ctx.report_error(None);
        assert!(ctx.new_errors_exist());
        assert!(ctx.unread_errors_exist());
        assert_eq!(ctx.indicator().error.as_deref(), Some(DEFAULT_ERROR_MESSAGE));

        ctx.main_view_opened();
        assert!(!ctx.new_errors_exist());
        assert!(ctx.unread_errors_exist());
        assert_eq!(ctx.indicator().error, None);

        ctx.report_error(Some("resize failed"));
        ctx.secondary_view_opened();
        assert!(ctx.new_errors_exist());
        assert!(!ctx.unread_errors_exist());
    }

    #[test]
    fn test_indicator_tracks_running_count() {
        let ctx = RunContext::new();
        let rx = ctx.subscribe();
        ctx.increment_running();
        ctx.increment_running();
        assert_eq!(rx.borrow().running, 2);
    }

    #[test]
    fn test_new_batch_changes_id() {
        let ctx = RunContext::new();
        let before = ctx.batch_id();
        let after = ctx.new_batch();
        assert_ne!(before, after);
        assert_eq!(ctx.batch_id(), after);
    }
}
