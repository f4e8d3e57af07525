use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::AuthError;
use crate::browser::{BrowserError, Size};
use crate::check::CheckError;
use crate::crawl::CrawlError;
use crate::settings::SettingsError;
use crate::tasks::TaskDropped;
use crate::window::PrepareError;

/// How strictly the comparison engine matches a capture against its baseline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchLevel {
    #[default]
    Strict,
    Content,
    Layout,
    Exact,
}

impl MatchLevel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "strict" => Some(Self::Strict),
            "content" => Some(Self::Content),
            "layout" | "layout2" => Some(Self::Layout),
            "exact" => Some(Self::Exact),
            _ => None,
        }
    }
}

/// Batch that groups the tests of one run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchInfo {
    pub name: String,
    pub id: String,
}

/// Which baseline a test is compared against
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BaselineSelection {
    /// App and test name derived from the tab's own URL
    #[default]
    Default,
    /// App and test name derived from another page's URL
    StepUrl { url: String },
    /// App and test name given by the user
    UserValues { app_name: String, test_name: String },
}

/// Everything the comparison engine needs to identify a test.
///
/// Values are owned, so a clone handed to a parallel crawl worker never
/// aliases another worker's parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestParameters {
    pub app_name: String,
    pub test_name: String,
    pub branch_name: Option<String>,
    pub parent_branch_name: Option<String>,
    pub os: String,
    pub hosting_app: String,
    pub inferred_environment: String,
    pub match_level: MatchLevel,
    pub viewport_size: Size,
    pub batch: Option<BatchInfo>,
}

impl TestParameters {
    /// Stable key: identical parameters give identical keys.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

/// Outcome of a single test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub parameters: TestParameters,
    pub status: crate::check::CheckStatus,
    pub result_url: Option<String>,
    /// Tab the results were shown in, if any
    pub results_tab: Option<crate::browser::TabId>,
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error types for harness operations
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error("Window preparation failed: {0}")]
    Preparation(#[from] PrepareError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Visual check failed: {0}")]
    Check(#[from] CheckError),

    #[error("Crawl failed: {0}")]
    Crawl(#[from] CrawlError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Task(#[from] TaskDropped),

    #[error("Invalid baseline image: {0}")]
    BaselineImage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The tab under test went away before the test finished. The lifecycle
    /// tracker has already logged it, so it is not reported as a failure.
    #[error("Tab {0} was closed before the test finished")]
    TabClosed(crate::browser::TabId),
}

impl HarnessError {
    pub fn is_tab_closed(&self) -> bool {
        matches!(self, Self::TabClosed(_))
    }
}
