//! In-memory browser used by the CLI and the test-suite.
//!
//! Windows have a fixed frame (title bar, toolbars, borders) so a tab's
//! content area is always the window size minus [`SimulatedBrowser::frame`].
//! Resizes go through a configurable [`ResizeBehavior`] to reproduce window
//! managers that clamp or lag behind a requested size. Captures render a PNG
//! of the tab's viewport with the page URL drawn on it.

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::io::Cursor;

use async_trait::async_trait;
use font8x8::{BASIC_FONTS, UnicodeFonts};
use image::{ImageBuffer, RgbImage};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{
    BrowserError, BrowserResult, BrowserSurface, CaptureOptions, CreateTab, CreateWindow,
    PlatformInfo, Size, Tab, TabId, TabUpdate, Window, WindowId, WindowUpdate, encode_data_url,
};

/// Default window frame: 16px of borders, 88px of title bar and toolbars.
pub const DEFAULT_FRAME: Size = Size::new(16, 88);

/// How the simulated window manager applies a requested window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeBehavior {
    /// Windows take exactly the requested size.
    Exact,
    /// Windows can't grow past the screen; larger requests are clamped.
    ScreenLimit(Size),
    /// The next `misses` resizes fall `shortfall` pixels short in both axes.
    Lagging { misses: usize, shortfall: u32 },
}

/// A recorded call on the surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserCall {
    CreateWindow { tab_id: Option<TabId>, size: Option<Size> },
    UpdateWindow { window_id: WindowId, size: Option<Size> },
    MoveTab { tab_id: TabId, window_id: WindowId, index: usize },
    CreateTab { window_id: WindowId, url: String, active: bool },
    UpdateTab { tab_id: TabId, url: Option<String>, active: Option<bool> },
    RemoveTab(TabId),
    ExecuteScript(TabId),
    Capture { window_id: WindowId, tab_id: TabId },
}

#[derive(Debug, Clone)]
struct WindowState {
    left: i32,
    top: i32,
    size: Size,
    tabs: Vec<TabId>,
}

#[derive(Debug, Clone)]
struct TabState {
    window_id: WindowId,
    url: String,
    active: bool,
}

#[derive(Debug)]
struct World {
    windows: BTreeMap<WindowId, WindowState>,
    tabs: BTreeMap<TabId, TabState>,
    focused: Option<WindowId>,
    next_id: u32,
    behavior: ResizeBehavior,
    cookies: HashMap<(String, String), String>,
    calls: Vec<BrowserCall>,
}

pub struct SimulatedBrowser {
    world: Mutex<World>,
    frame: Size,
    platform: PlatformInfo,
    removals: broadcast::Sender<TabId>,
}

impl SimulatedBrowser {
    pub fn new() -> Self {
        Self::with_frame(DEFAULT_FRAME)
    }

    pub fn with_frame(frame: Size) -> Self {
        let (removals, _) = broadcast::channel(64);
        Self {
            world: Mutex::new(World {
                windows: BTreeMap::new(),
                tabs: BTreeMap::new(),
                focused: None,
                next_id: 1,
                behavior: ResizeBehavior::Exact,
                cookies: HashMap::new(),
                calls: Vec::new(),
            }),
            frame,
            platform: PlatformInfo {
                os: "Linux".to_string(),
                browser: "Chrome 126".to_string(),
                user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36".to_string(),
            },
            removals,
        }
    }

    pub fn frame(&self) -> Size {
        self.frame
    }

    pub fn set_resize_behavior(&self, behavior: ResizeBehavior) {
        self.world.lock().behavior = behavior;
    }

    pub fn set_cookie(&self, url: &str, name: &str, value: &str) {
        self.world
            .lock()
            .cookies
            .insert((cookie_scope(url), name.to_string()), value.to_string());
    }

    /// Open a focused window holding one tab per URL; the first tab is active.
    pub fn open_window(&self, size: Size, urls: &[&str]) -> (WindowId, Vec<TabId>) {
        let mut world = self.world.lock();
        let window_id = world.allocate_id();
        let mut tabs = Vec::new();
        for (i, url) in urls.iter().enumerate() {
            let tab_id = world.allocate_id();
            world.tabs.insert(
                tab_id,
                TabState {
                    window_id,
                    url: url.to_string(),
                    active: i == 0,
                },
            );
            tabs.push(tab_id);
        }
        world.windows.insert(
            window_id,
            WindowState {
                left: 0,
                top: 0,
                size,
                tabs: tabs.clone(),
            },
        );
        world.focused = Some(window_id);
        (window_id, tabs)
    }

    /// The user closes a tab.
    pub fn close_tab(&self, tab_id: TabId) -> BrowserResult<()> {
        self.world.lock().detach_tab(tab_id)?;
        self.world.lock().tabs.remove(&tab_id);
        let _ = self.removals.send(tab_id);
        Ok(())
    }

    pub fn calls(&self) -> Vec<BrowserCall> {
        self.world.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.world.lock().calls.clear();
    }

    /// Sizes requested through `update_window`, in order.
    pub fn resize_requests(&self) -> Vec<Size> {
        self.world
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BrowserCall::UpdateWindow { size: Some(size), .. } => Some(*size),
                _ => None,
            })
            .collect()
    }

    /// Tabs captured, in capture order.
    pub fn captured_tabs(&self) -> Vec<TabId> {
        self.world
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BrowserCall::Capture { tab_id, .. } => Some(*tab_id),
                _ => None,
            })
            .collect()
    }

    pub fn window_count(&self) -> usize {
        self.world.lock().windows.len()
    }

    pub fn tab_count(&self) -> usize {
        self.world.lock().tabs.len()
    }

    fn tab_snapshot(&self, world: &World, tab_id: TabId) -> BrowserResult<Tab> {
        let tab = world.tabs.get(&tab_id).ok_or(BrowserError::TabNotFound(tab_id))?;
        let window = world
            .windows
            .get(&tab.window_id)
            .ok_or(BrowserError::WindowNotFound(tab.window_id))?;
        let index = window.tabs.iter().position(|id| *id == tab_id).unwrap_or(0);
        Ok(Tab {
            id: tab_id,
            window_id: tab.window_id,
            index,
            url: tab.url.clone(),
            title: page_title(&tab.url),
            active: tab.active,
            content_size: Size::new(
                window.size.width.saturating_sub(self.frame.width),
                window.size.height.saturating_sub(self.frame.height),
            ),
        })
    }

    fn window_snapshot(world: &World, window_id: WindowId) -> BrowserResult<Window> {
        let window = world
            .windows
            .get(&window_id)
            .ok_or(BrowserError::WindowNotFound(window_id))?;
        Ok(Window {
            id: window_id,
            left: window.left,
            top: window.top,
            size: window.size,
            focused: world.focused == Some(window_id),
            tab_ids: window.tabs.clone(),
        })
    }
}

impl Default for SimulatedBrowser {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn apply_resize(&mut self, requested: Size) -> Size {
        match self.behavior {
            ResizeBehavior::Exact => requested,
            ResizeBehavior::ScreenLimit(screen) => Size::new(
                requested.width.min(screen.width),
                requested.height.min(screen.height),
            ),
            ResizeBehavior::Lagging { misses, shortfall } => {
                if misses == 0 {
                    return requested;
                }
                self.behavior = ResizeBehavior::Lagging {
                    misses: misses - 1,
                    shortfall,
                };
                Size::new(
                    requested.width.saturating_sub(shortfall),
                    requested.height.saturating_sub(shortfall),
                )
            }
        }
    }

    /// Take a tab out of its window's strip; empty windows close.
    fn detach_tab(&mut self, tab_id: TabId) -> BrowserResult<()> {
        let tab = self.tabs.get(&tab_id).ok_or(BrowserError::TabNotFound(tab_id))?;
        let window_id = tab.window_id;
        let was_active = tab.active;
        let window = self
            .windows
            .get_mut(&window_id)
            .ok_or(BrowserError::WindowNotFound(window_id))?;
        let position = window.tabs.iter().position(|id| *id == tab_id).unwrap_or(0);
        window.tabs.retain(|id| *id != tab_id);

        if window.tabs.is_empty() {
            self.windows.remove(&window_id);
            if self.focused == Some(window_id) {
                self.focused = self.windows.keys().next_back().copied();
            }
        } else if was_active {
            let next = window.tabs[position.min(window.tabs.len() - 1)];
            if let Some(next_tab) = self.tabs.get_mut(&next) {
                next_tab.active = true;
            }
        }
        if let Some(tab) = self.tabs.get_mut(&tab_id) {
            tab.active = false;
        }
        Ok(())
    }

    fn activate(&mut self, tab_id: TabId) -> BrowserResult<()> {
        let window_id = self
            .tabs
            .get(&tab_id)
            .ok_or(BrowserError::TabNotFound(tab_id))?
            .window_id;
        let siblings = self
            .windows
            .get(&window_id)
            .map(|w| w.tabs.clone())
            .unwrap_or_default();
        for sibling in siblings {
            if let Some(tab) = self.tabs.get_mut(&sibling) {
                tab.active = sibling == tab_id;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BrowserSurface for SimulatedBrowser {
    async fn active_tab(&self) -> BrowserResult<Tab> {
        let world = self.world.lock();
        let window_id = world.focused.ok_or(BrowserError::NoActiveTab)?;
        let window = world
            .windows
            .get(&window_id)
            .ok_or(BrowserError::WindowNotFound(window_id))?;
        let tab_id = window
            .tabs
            .iter()
            .copied()
            .find(|id| world.tabs.get(id).is_some_and(|t| t.active))
            .ok_or(BrowserError::NoActiveTab)?;
        self.tab_snapshot(&world, tab_id)
    }

    async fn get_tab(&self, tab_id: TabId) -> BrowserResult<Tab> {
        let world = self.world.lock();
        self.tab_snapshot(&world, tab_id)
    }

    async fn get_window(&self, window_id: WindowId) -> BrowserResult<Window> {
        let world = self.world.lock();
        Self::window_snapshot(&world, window_id)
    }

    async fn create_window(&self, request: CreateWindow) -> BrowserResult<Window> {
        let mut world = self.world.lock();
        world.calls.push(BrowserCall::CreateWindow {
            tab_id: request.tab_id,
            size: request.size,
        });

        let window_id = world.allocate_id();
        let tab_id = match request.tab_id {
            Some(tab_id) => {
                world.detach_tab(tab_id)?;
                tab_id
            }
            None => {
                let tab_id = world.allocate_id();
                world.tabs.insert(
                    tab_id,
                    TabState {
                        window_id,
                        url: request.url.clone().unwrap_or_else(|| "about:blank".to_string()),
                        active: true,
                    },
                );
                tab_id
            }
        };
        if let Some(tab) = world.tabs.get_mut(&tab_id) {
            tab.window_id = window_id;
            tab.active = true;
        }

        let size = match request.size {
            Some(size) => world.apply_resize(size),
            None => Size::new(1024, 768),
        };
        world.windows.insert(
            window_id,
            WindowState {
                left: request.left.unwrap_or(0),
                top: request.top.unwrap_or(0),
                size,
                tabs: vec![tab_id],
            },
        );
        if request.focused || world.focused.is_none() {
            world.focused = Some(window_id);
        }
        Self::window_snapshot(&world, window_id)
    }

    async fn update_window(&self, window_id: WindowId, update: WindowUpdate) -> BrowserResult<Window> {
        let mut world = self.world.lock();
        world.calls.push(BrowserCall::UpdateWindow {
            window_id,
            size: update.size,
        });
        if !world.windows.contains_key(&window_id) {
            return Err(BrowserError::WindowNotFound(window_id));
        }
        let applied = update.size.map(|size| world.apply_resize(size));
        if let Some(window) = world.windows.get_mut(&window_id) {
            if let Some(size) = applied {
                window.size = size;
            }
            if let Some(left) = update.left {
                window.left = left;
            }
            if let Some(top) = update.top {
                window.top = top;
            }
        }
        if update.focused == Some(true) {
            world.focused = Some(window_id);
        }
        Self::window_snapshot(&world, window_id)
    }

    async fn move_tab(&self, tab_id: TabId, window_id: WindowId, index: usize) -> BrowserResult<Tab> {
        let mut world = self.world.lock();
        world.calls.push(BrowserCall::MoveTab {
            tab_id,
            window_id,
            index,
        });
        if !world.windows.contains_key(&window_id) {
            return Err(BrowserError::WindowNotFound(window_id));
        }
        world.detach_tab(tab_id)?;
        let target = world
            .windows
            .get_mut(&window_id)
            .ok_or(BrowserError::WindowNotFound(window_id))?;
        let index = index.min(target.tabs.len());
        target.tabs.insert(index, tab_id);
        if let Some(tab) = world.tabs.get_mut(&tab_id) {
            tab.window_id = window_id;
        }
        self.tab_snapshot(&world, tab_id)
    }

    async fn create_tab(&self, request: CreateTab) -> BrowserResult<Tab> {
        let mut world = self.world.lock();
        world.calls.push(BrowserCall::CreateTab {
            window_id: request.window_id,
            url: request.url.clone(),
            active: request.active,
        });
        if !world.windows.contains_key(&request.window_id) {
            return Err(BrowserError::WindowNotFound(request.window_id));
        }
        let tab_id = world.allocate_id();
        world.tabs.insert(
            tab_id,
            TabState {
                window_id: request.window_id,
                url: request.url,
                active: false,
            },
        );
        if let Some(window) = world.windows.get_mut(&request.window_id) {
            let index = request.index.unwrap_or(window.tabs.len()).min(window.tabs.len());
            window.tabs.insert(index, tab_id);
        }
        if request.active {
            world.activate(tab_id)?;
        }
        self.tab_snapshot(&world, tab_id)
    }

    async fn update_tab(&self, tab_id: TabId, update: TabUpdate) -> BrowserResult<Tab> {
        let mut world = self.world.lock();
        world.calls.push(BrowserCall::UpdateTab {
            tab_id,
            url: update.url.clone(),
            active: update.active,
        });
        let tab = world.tabs.get_mut(&tab_id).ok_or(BrowserError::TabNotFound(tab_id))?;
        if let Some(url) = update.url {
            tab.url = url;
        }
        if update.active == Some(true) {
            world.activate(tab_id)?;
        }
        self.tab_snapshot(&world, tab_id)
    }

    async fn remove_tab(&self, tab_id: TabId) -> BrowserResult<()> {
        {
            let mut world = self.world.lock();
            world.calls.push(BrowserCall::RemoveTab(tab_id));
            world.detach_tab(tab_id)?;
            world.tabs.remove(&tab_id);
        }
        let _ = self.removals.send(tab_id);
        Ok(())
    }

    async fn execute_script(&self, tab_id: TabId, _code: &str) -> BrowserResult<serde_json::Value> {
        let mut world = self.world.lock();
        world.calls.push(BrowserCall::ExecuteScript(tab_id));
        if !world.tabs.contains_key(&tab_id) {
            return Err(BrowserError::TabNotFound(tab_id));
        }
        Ok(serde_json::Value::Null)
    }

    async fn capture_visible_tab(
        &self,
        window_id: WindowId,
        options: CaptureOptions,
    ) -> BrowserResult<String> {
        let (url, size) = {
            let mut world = self.world.lock();
            let window = world
                .windows
                .get(&window_id)
                .ok_or(BrowserError::WindowNotFound(window_id))?;
            let tab_id = window
                .tabs
                .iter()
                .copied()
                .find(|id| world.tabs.get(id).is_some_and(|t| t.active))
                .ok_or(BrowserError::NoActiveTab)?;
            world.calls.push(BrowserCall::Capture { window_id, tab_id });
            let tab = self.tab_snapshot(&world, tab_id)?;
            let mut size = tab.content_size;
            if options.full_page {
                size.height = size.height.saturating_mul(2);
            }
            (tab.url, size)
        };

        let png = render_page(&url, size)?;
        Ok(encode_data_url(&png))
    }

    async fn get_cookie(&self, url: &str, name: &str) -> BrowserResult<Option<String>> {
        let world = self.world.lock();
        Ok(world
            .cookies
            .get(&(cookie_scope(url), name.to_string()))
            .cloned())
    }

    async fn platform(&self) -> BrowserResult<PlatformInfo> {
        Ok(self.platform.clone())
    }

    fn subscribe_tab_removals(&self) -> broadcast::Receiver<TabId> {
        self.removals.subscribe()
    }
}

fn cookie_scope(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

fn page_title(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| format!("{}{}", h, u.path())))
        .unwrap_or_else(|| url.to_string())
}

/// Paint a page: background colour derived from the URL, URL text on top.
fn render_page(url: &str, size: Size) -> BrowserResult<Vec<u8>> {
    let width = size.width.max(1);
    let height = size.height.max(1);

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    url.hash(&mut hasher);
    let seed = hasher.finish().to_le_bytes();
    let background = [seed[0] / 2 + 64, seed[1] / 2 + 64, seed[2] / 2 + 64];

    let mut img: RgbImage = ImageBuffer::from_pixel(width, height, image::Rgb(background));
    let mut x = 8u32;
    for ch in url.chars() {
        if x + 8 > width || height < 16 {
            break;
        }
        let glyph = BASIC_FONTS.get(ch).unwrap_or([0u8; 8]);
        for (row_idx, row) in glyph.iter().enumerate() {
            for bit in 0..8u32 {
                // font8x8 stores LSB as leftmost pixel
                if (row >> bit) & 1 == 1 {
                    img.put_pixel(x + bit, 8 + row_idx as u32, image::Rgb([0, 0, 0]));
                }
            }
        }
        x += 8;
    }

    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|e| BrowserError::Capture(format!("Failed to encode PNG: {}", e)))?;
    Ok(bytes)
}
