//! Tab Vision - visual-regression test orchestration for browser tabs.
//!
//! This crate provides:
//! - Window preparation to an exact viewport, with bounded resize retries
//!   and guaranteed restore
//! - Globally serialized screenshot capture
//! - Crawl mode: sitemap discovery drained by a bounded pool of tabs
//! - Reuse of result tabs per test fingerprint
//! - Account/credential resolution with a legacy fallback
//! - An in-memory simulated browser and a session-backed local check
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tab_vision::{
//!     Collaborators, Config, MemoryStore, Session, SessionCheck, SimulatedBrowser, Size,
//!     StaticAccountDirectory, TestRunCoordinator,
//! };
//!
//! # async fn demo() -> tab_vision::HarnessResult<()> {
//! let browser = Arc::new(SimulatedBrowser::new());
//! browser.open_window(Size::new(1000, 800), &["https://example.com/"]);
//!
//! let coordinator = TestRunCoordinator::new(
//!     Collaborators {
//!         browser,
//!         store: Arc::new(MemoryStore::new()),
//!         accounts: Arc::new(StaticAccountDirectory::unsupported()),
//!         check: Arc::new(SessionCheck::new(Session::new())),
//!     },
//!     Config::from_env(),
//! );
//! let report = coordinator.run_single_test().await?;
//! println!("{:?}", report.status);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod browser;
pub mod check;
pub mod config;
pub mod crawl;
pub mod harness;
pub mod lifecycle;
pub mod results;
pub mod session;
pub mod settings;
pub mod state;
pub mod steps;
pub mod tasks;
pub mod window;

// Re-export configuration
pub use config::Config;

// Re-export harness types
pub use harness::{
    BaselineSelection, BatchInfo, Collaborators, HarnessError, HarnessResult, MatchLevel,
    TestParameters, TestReport, TestRunCoordinator,
};

// Re-export collaborator contracts and bundled implementations
pub use auth::{Account, AccountCredentials, AccountDirectory, AuthError, AuthState, StaticAccountDirectory};
pub use browser::{BrowserError, BrowserSurface, ResizeBehavior, SimulatedBrowser, Size, TabId, WindowId};
pub use check::{CheckError, CheckOutcome, CheckStatus, SessionCheck, VisualCheck};
pub use crawl::{CrawlError, CrawlReport, HttpSitemapSource, SitemapSource, StaticSitemapSource};
pub use settings::{MemoryStore, Preferences, SettingsError, SettingsStore};

// Re-export core components
pub use lifecycle::{TestHandle, TestLifecycleTracker};
pub use results::ResultTabCache;
pub use state::{Indicator, LogEntry, LogLevel, RunContext};
pub use steps::StepCursor;
pub use tasks::SequentialTaskRunner;
pub use window::{PrepareError, RetryPolicy, WindowPreparer};

// Re-export session management
pub use session::Session;
