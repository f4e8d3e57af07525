//! Process-level configuration with environment variable support.
//!
//! These are the knobs of the orchestration engine itself (timing, pool sizes,
//! default server endpoints). Per-user preferences such as the requested
//! viewport or the baseline selection live in [`crate::settings`].
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `TAB_VISION_RESIZE_SETTLE_MS` | Wait after each window resize (ms) | `200` |
//! | `TAB_VISION_RESIZE_ATTEMPTS` | Total resize attempts before giving up | `4` |
//! | `TAB_VISION_PAGE_SETTLE_MS` | Wait after loading a crawled page (ms) | `10000` |
//! | `TAB_VISION_SITEMAP_TIMEOUT_SECS` | Sitemap request timeout (s) | `5` |
//! | `TAB_VISION_CRAWL_TABS` | Parallel tabs used by a crawl | `5` |
//! | `TAB_VISION_CRAWL_MAX_URLS` | Upper bound on discovered URLs | `100` |
//! | `TAB_VISION_SESSION_DIR` | Base directory for capture sessions | `/tmp/tab-vision` |
//! | `TAB_VISION_SERVER_URL` | Default main server URL | `https://eyes.example.com` |
//! | `TAB_VISION_API_URL` | Default API server URL | `https://eyes.example.com/api` |

use std::env;
use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Default Values
// ============================================================================

/// Default wait after a window resize before measuring it again
pub const DEFAULT_RESIZE_SETTLE_MS: u64 = 200;

/// Default number of resize attempts (initial attempt plus three retries)
pub const DEFAULT_RESIZE_ATTEMPTS: u32 = 4;

/// Default wait after navigating a crawl tab before testing it
pub const DEFAULT_PAGE_SETTLE_MS: u64 = 10_000;

/// Default sitemap fetch timeout (seconds)
pub const DEFAULT_SITEMAP_TIMEOUT_SECS: u64 = 5;

/// Default size of the crawl tab pool
pub const DEFAULT_CRAWL_TABS: usize = 5;

/// Default cap on the number of URLs a crawl discovers
pub const DEFAULT_CRAWL_MAX_URLS: usize = 100;

/// Default session base directory
pub const DEFAULT_SESSION_DIR: &str = "/tmp/tab-vision";

/// Default main server URL
pub const DEFAULT_SERVER_URL: &str = "https://eyes.example.com";

/// Default API server URL
pub const DEFAULT_API_URL: &str = "https://eyes.example.com/api";

/// Maximum number of entries kept in the run log
pub const LOG_CAPACITY: usize = 100;

// ============================================================================
// Environment Variable Names
// ============================================================================

pub const ENV_RESIZE_SETTLE_MS: &str = "TAB_VISION_RESIZE_SETTLE_MS";
pub const ENV_RESIZE_ATTEMPTS: &str = "TAB_VISION_RESIZE_ATTEMPTS";
pub const ENV_PAGE_SETTLE_MS: &str = "TAB_VISION_PAGE_SETTLE_MS";
pub const ENV_SITEMAP_TIMEOUT_SECS: &str = "TAB_VISION_SITEMAP_TIMEOUT_SECS";
pub const ENV_CRAWL_TABS: &str = "TAB_VISION_CRAWL_TABS";
pub const ENV_CRAWL_MAX_URLS: &str = "TAB_VISION_CRAWL_MAX_URLS";
pub const ENV_SESSION_DIR: &str = "TAB_VISION_SESSION_DIR";
pub const ENV_SERVER_URL: &str = "TAB_VISION_SERVER_URL";
pub const ENV_API_URL: &str = "TAB_VISION_API_URL";

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration (initialized from environment on first access)
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Centralized configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Window preparation timing
    pub window: WindowSettings,
    /// Crawl pool and discovery settings
    pub crawl: CrawlSettings,
    /// Default server endpoints
    pub server: ServerSettings,
    /// Capture session storage
    pub session: SessionSettings,
}

/// Window preparation settings
#[derive(Debug, Clone)]
pub struct WindowSettings {
    /// Wait after each resize so the window manager can apply it
    pub resize_settle: Duration,
    /// Total number of resize attempts
    pub resize_attempts: u32,
}

/// Crawl settings
#[derive(Debug, Clone)]
pub struct CrawlSettings {
    /// Number of tabs draining the URL queue in parallel
    pub tabs: usize,
    /// Wait after loading each page
    pub page_settle: Duration,
    /// Sitemap request timeout
    pub sitemap_timeout: Duration,
    /// Maximum number of URLs taken from the sitemap
    pub max_urls: usize,
}

/// Default server endpoints, used when the settings store has none
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub server_url: String,
    pub api_url: String,
}

/// Session-related settings
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Base directory for session storage
    pub base_dir: String,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            window: WindowSettings::from_env(),
            crawl: CrawlSettings::from_env(),
            server: ServerSettings::from_env(),
            session: SessionSettings::from_env(),
        }
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self {
            window: WindowSettings::defaults(),
            crawl: CrawlSettings::defaults(),
            server: ServerSettings::defaults(),
            session: SessionSettings::defaults(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl WindowSettings {
    pub fn from_env() -> Self {
        Self {
            resize_settle: Duration::from_millis(env_parse(
                ENV_RESIZE_SETTLE_MS,
                DEFAULT_RESIZE_SETTLE_MS,
            )),
            resize_attempts: env_parse(ENV_RESIZE_ATTEMPTS, DEFAULT_RESIZE_ATTEMPTS).max(1),
        }
    }

    pub fn defaults() -> Self {
        Self {
            resize_settle: Duration::from_millis(DEFAULT_RESIZE_SETTLE_MS),
            resize_attempts: DEFAULT_RESIZE_ATTEMPTS,
        }
    }
}

impl CrawlSettings {
    pub fn from_env() -> Self {
        Self {
            tabs: env_parse(ENV_CRAWL_TABS, DEFAULT_CRAWL_TABS).max(1),
            page_settle: Duration::from_millis(env_parse(ENV_PAGE_SETTLE_MS, DEFAULT_PAGE_SETTLE_MS)),
            sitemap_timeout: Duration::from_secs(env_parse(
                ENV_SITEMAP_TIMEOUT_SECS,
                DEFAULT_SITEMAP_TIMEOUT_SECS,
            )),
            max_urls: env_parse(ENV_CRAWL_MAX_URLS, DEFAULT_CRAWL_MAX_URLS),
        }
    }

    pub fn defaults() -> Self {
        Self {
            tabs: DEFAULT_CRAWL_TABS,
            page_settle: Duration::from_millis(DEFAULT_PAGE_SETTLE_MS),
            sitemap_timeout: Duration::from_secs(DEFAULT_SITEMAP_TIMEOUT_SECS),
            max_urls: DEFAULT_CRAWL_MAX_URLS,
        }
    }
}

impl ServerSettings {
    pub fn from_env() -> Self {
        Self {
            server_url: env::var(ENV_SERVER_URL).unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string()),
            api_url: env::var(ENV_API_URL).unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
        }
    }

    pub fn defaults() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
        }
    }
}

impl SessionSettings {
    pub fn from_env() -> Self {
        Self {
            base_dir: env::var(ENV_SESSION_DIR).unwrap_or_else(|_| DEFAULT_SESSION_DIR.to_string()),
        }
    }

    pub fn defaults() -> Self {
        Self {
            base_dir: DEFAULT_SESSION_DIR.to_string(),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Get session base directory (convenience function)
pub fn session_base_dir() -> String {
    get().session.base_dir.clone()
}
