//! Browser automation surface.
//!
//! The orchestration engine never talks to a concrete browser: it goes
//! through [`BrowserSurface`], which exposes the window/tab primitives a
//! browser extension host provides (query, create, move, resize, script
//! execution, visible-tab capture, cookies). [`SimulatedBrowser`] is an
//! in-memory implementation used by the CLI and the tests.

pub mod simulated;

use std::fmt;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

pub use simulated::{BrowserCall, ResizeBehavior, SimulatedBrowser};

pub type TabId = u32;
pub type WindowId = u32;

/// Width/height pair in CSS pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Parse `"WxH"` (e.g. `"1024x768"`).
    pub fn parse(raw: &str) -> Option<Self> {
        let (w, h) = raw.trim().to_lowercase().split_once('x').map(|(w, h)| {
            (w.trim().to_string(), h.trim().to_string())
        })?;
        Some(Self::new(w.parse().ok()?, h.parse().ok()?))
    }

    /// `self + (outer - inner)`, i.e. the outer size needed so that the inner
    /// area becomes `self`, given the current outer/inner pair.
    pub fn grow_by_frame(self, outer: Size, inner: Size) -> Size {
        let dw = i64::from(outer.width) - i64::from(inner.width);
        let dh = i64::from(outer.height) - i64::from(inner.height);
        Size::new(
            (i64::from(self.width) + dw).max(0) as u32,
            (i64::from(self.height) + dh).max(0) as u32,
        )
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Snapshot of a tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tab {
    pub id: TabId,
    pub window_id: WindowId,
    /// Position inside its window's tab strip
    pub index: usize,
    pub url: String,
    pub title: String,
    pub active: bool,
    /// Content area (viewport) size, excluding the window frame
    pub content_size: Size,
}

/// Snapshot of a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub id: WindowId,
    pub left: i32,
    pub top: i32,
    /// Outer size, frame included
    pub size: Size,
    pub focused: bool,
    pub tab_ids: Vec<TabId>,
}

/// Request for a new window; with `tab_id` set the tab is moved into it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateWindow {
    pub tab_id: Option<TabId>,
    pub url: Option<String>,
    pub left: Option<i32>,
    pub top: Option<i32>,
    pub size: Option<Size>,
    pub focused: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowUpdate {
    pub size: Option<Size>,
    pub left: Option<i32>,
    pub top: Option<i32>,
    pub focused: Option<bool>,
}

impl WindowUpdate {
    pub fn resize(size: Size) -> Self {
        Self {
            size: Some(size),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTab {
    pub window_id: WindowId,
    pub url: String,
    pub active: bool,
    pub index: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabUpdate {
    pub url: Option<String>,
    pub active: Option<bool>,
}

impl TabUpdate {
    pub fn navigate(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            active: None,
        }
    }

    pub fn activate() -> Self {
        Self {
            url: None,
            active: Some(true),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Capture the whole scrollable page rather than the visible viewport
    pub full_page: bool,
}

/// Host platform description used to fill test parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub os: String,
    pub browser: String,
    pub user_agent: String,
}

pub type BrowserResult<T> = Result<T, BrowserError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrowserError {
    #[error("no tab with id {0}")]
    TabNotFound(TabId),

    #[error("no window with id {0}")]
    WindowNotFound(WindowId),

    #[error("no active tab")]
    NoActiveTab,

    #[error("script execution failed: {0}")]
    Script(String),

    #[error("capture failed: {0}")]
    Capture(String),

    #[error("browser error: {0}")]
    Other(String),
}

/// Window/tab primitives of the hosting browser.
#[async_trait]
pub trait BrowserSurface: Send + Sync {
    /// Active tab of the focused window
    async fn active_tab(&self) -> BrowserResult<Tab>;

    async fn get_tab(&self, tab_id: TabId) -> BrowserResult<Tab>;

    async fn get_window(&self, window_id: WindowId) -> BrowserResult<Window>;

    async fn create_window(&self, request: CreateWindow) -> BrowserResult<Window>;

    async fn update_window(&self, window_id: WindowId, update: WindowUpdate) -> BrowserResult<Window>;

    /// Move a tab into `window_id` at `index` (clamped to the tab strip)
    async fn move_tab(&self, tab_id: TabId, window_id: WindowId, index: usize) -> BrowserResult<Tab>;

    async fn create_tab(&self, request: CreateTab) -> BrowserResult<Tab>;

    async fn update_tab(&self, tab_id: TabId, update: TabUpdate) -> BrowserResult<Tab>;

    async fn remove_tab(&self, tab_id: TabId) -> BrowserResult<()>;

    async fn execute_script(&self, tab_id: TabId, code: &str) -> BrowserResult<serde_json::Value>;

    /// Capture the active tab of `window_id`, returned as a PNG data URL
    async fn capture_visible_tab(
        &self,
        window_id: WindowId,
        options: CaptureOptions,
    ) -> BrowserResult<String>;

    async fn get_cookie(&self, url: &str, name: &str) -> BrowserResult<Option<String>>;

    async fn platform(&self) -> BrowserResult<PlatformInfo>;

    /// Stream of ids of tabs that disappeared
    fn subscribe_tab_removals(&self) -> broadcast::Receiver<TabId>;
}

/// Decode a `data:image/png;base64,...` URL into raw bytes.
pub fn decode_data_url(data_url: &str) -> BrowserResult<Vec<u8>> {
    let (header, payload) = data_url
        .split_once(',')
        .ok_or_else(|| BrowserError::Capture("capture is not a data URL".to_string()))?;
    if !header.ends_with(";base64") {
        return Err(BrowserError::Capture(format!(
            "unsupported data URL encoding: {}",
            header
        )));
    }
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| BrowserError::Capture(format!("invalid base64 payload: {}", e)))
}

/// Encode PNG bytes as a data URL.
pub fn encode_data_url(png: &[u8]) -> String {
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(png)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_parse() {
        assert_eq!(Size::parse("800x600"), Some(Size::new(800, 600)));
        assert_eq!(Size::parse(" 1024 X 768 "), Some(Size::new(1024, 768)));
        assert_eq!(Size::parse("800"), None);
        assert_eq!(Size::parse("axb"), None);
    }

    #[test]
    fn test_grow_by_frame() {
        let required = Size::new(800, 600).grow_by_frame(Size::new(1000, 800), Size::new(984, 712));
        assert_eq!(required, Size::new(816, 688));
    }

    #[test]
    fn test_data_url_roundtrip() {
        let url = encode_data_url(&[1, 2, 3, 250]);
        assert!(url.starts_with("data:image/png;base64,"));
        assert_eq!(decode_data_url(&url).unwrap(), vec![1, 2, 3, 250]);
    }

    #[test]
    fn test_decode_rejects_plain_url() {
        assert!(matches!(
            decode_data_url("https://example.com/a.png"),
            Err(BrowserError::Capture(_))
        ));
    }
}
