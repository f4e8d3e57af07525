//! User preferences, read through an async key/value store.
//!
//! The store itself is a collaborator (browser extension storage in
//! production); [`MemoryStore`] is the bundled implementation. Defaults are
//! applied here, by [`Preferences::load`], never by the store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::browser::Size;
use crate::config::ServerSettings;
use crate::harness::types::{BaselineSelection, MatchLevel};

// ============================================================================
// Keys
// ============================================================================

pub const KEY_MATCH_LEVEL: &str = "match_level";
pub const KEY_VIEWPORT_SIZE: &str = "viewport_size";
pub const KEY_BASELINE_MODE: &str = "baseline_mode";
pub const KEY_BASELINE_STEP_URL: &str = "baseline_step_url";
pub const KEY_BASELINE_APP_NAME: &str = "baseline_app_name";
pub const KEY_BASELINE_TEST_NAME: &str = "baseline_test_name";
pub const KEY_SERVER_URL: &str = "server_url";
pub const KEY_API_URL: &str = "api_url";
pub const KEY_BRANCH_NAME: &str = "branch_name";
pub const KEY_PARENT_BRANCH_NAME: &str = "parent_branch_name";
pub const KEY_BATCH_ENABLED: &str = "batch_enabled";
pub const KEY_BATCH_NAME: &str = "batch_name";
pub const KEY_FULL_PAGE_SCREENSHOT: &str = "full_page_screenshot";
pub const KEY_REMOVE_SCROLLBARS: &str = "remove_scrollbars";
pub const KEY_OPEN_RESULTS_IN_NEW_TAB: &str = "open_results_in_new_tab";
pub const KEY_TEST_NAME_USES_QUERY_PARAMS: &str = "test_name_uses_query_params";
pub const KEY_LEGACY_API_KEY: &str = "legacy_api_key";
pub const KEY_LEGACY_ACCOUNT_ID: &str = "legacy_account_id";
pub const KEY_CURRENT_ACCOUNT_ID: &str = "current_account_id";

/// Viewport used when none was chosen
pub const DEFAULT_VIEWPORT: Size = Size::new(1024, 768);

/// Batch name used when batching is on without a name
pub const DEFAULT_BATCH_NAME: &str = "tab-vision";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("settings store failure: {0}")]
    Store(String),

    #[error("invalid value for '{key}': {reason}")]
    Invalid { key: String, reason: String },
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, SettingsError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), SettingsError>;

    async fn remove(&self, key: &str) -> Result<(), SettingsError>;
}

/// Read `key` as `T`, or `default` when it is absent.
pub async fn get_or<T: DeserializeOwned>(
    store: &dyn SettingsStore,
    key: &str,
    default: T,
) -> Result<T, SettingsError> {
    match store.get(key).await? {
        None | Some(Value::Null) => Ok(default),
        Some(value) => serde_json::from_value(value).map_err(|e| SettingsError::Invalid {
            key: key.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Read an optional non-empty string.
pub async fn get_string(store: &dyn SettingsStore, key: &str) -> Result<Option<String>, SettingsError> {
    let value: Option<String> = get_or(store, key, None).await?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: impl Into<Value>) -> Self {
        self.values.lock().insert(key.to_string(), value.into());
        self
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, SettingsError> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), SettingsError> {
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), SettingsError> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// Snapshot of every preference a test run reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preferences {
    pub match_level: MatchLevel,
    pub viewport_size: Size,
    pub baseline: BaselineSelection,
    pub branch_name: Option<String>,
    pub parent_branch_name: Option<String>,
    pub batch_enabled: bool,
    pub batch_name: String,
    pub full_page_screenshot: bool,
    pub remove_scrollbars: bool,
    pub open_results_in_new_tab: bool,
    pub test_name_uses_query_params: bool,
}

impl Preferences {
    pub async fn load(store: &dyn SettingsStore) -> Result<Self, SettingsError> {
        let match_level = match get_string(store, KEY_MATCH_LEVEL).await? {
            None => MatchLevel::default(),
            Some(raw) => MatchLevel::parse(&raw).ok_or_else(|| SettingsError::Invalid {
                key: KEY_MATCH_LEVEL.to_string(),
                reason: format!("unknown match level '{}'", raw),
            })?,
        };

        let viewport_size = match get_string(store, KEY_VIEWPORT_SIZE).await? {
            None => DEFAULT_VIEWPORT,
            Some(raw) => Size::parse(&raw).ok_or_else(|| SettingsError::Invalid {
                key: KEY_VIEWPORT_SIZE.to_string(),
                reason: format!("expected WIDTHxHEIGHT, got '{}'", raw),
            })?,
        };

        Ok(Self {
            match_level,
            viewport_size,
            baseline: load_baseline_selection(store).await?,
            branch_name: get_string(store, KEY_BRANCH_NAME).await?,
            parent_branch_name: get_string(store, KEY_PARENT_BRANCH_NAME).await?,
            batch_enabled: get_or(store, KEY_BATCH_ENABLED, false).await?,
            batch_name: get_string(store, KEY_BATCH_NAME)
                .await?
                .unwrap_or_else(|| DEFAULT_BATCH_NAME.to_string()),
            full_page_screenshot: get_or(store, KEY_FULL_PAGE_SCREENSHOT, false).await?,
            remove_scrollbars: get_or(store, KEY_REMOVE_SCROLLBARS, false).await?,
            open_results_in_new_tab: get_or(store, KEY_OPEN_RESULTS_IN_NEW_TAB, true).await?,
            test_name_uses_query_params: get_or(store, KEY_TEST_NAME_USES_QUERY_PARAMS, false).await?,
        })
    }
}

async fn load_baseline_selection(store: &dyn SettingsStore) -> Result<BaselineSelection, SettingsError> {
    let mode = get_string(store, KEY_BASELINE_MODE).await?;
    match mode.as_deref() {
        None | Some("default") => Ok(BaselineSelection::Default),
        Some("step_url") => match get_string(store, KEY_BASELINE_STEP_URL).await? {
            Some(url) => Ok(BaselineSelection::StepUrl { url }),
            None => Ok(BaselineSelection::Default),
        },
        Some("user_values") => {
            let app_name = get_string(store, KEY_BASELINE_APP_NAME).await?;
            let test_name = get_string(store, KEY_BASELINE_TEST_NAME).await?;
            match (app_name, test_name) {
                (Some(app_name), Some(test_name)) => Ok(BaselineSelection::UserValues { app_name, test_name }),
                _ => Ok(BaselineSelection::Default),
            }
        }
        Some(other) => Err(SettingsError::Invalid {
            key: KEY_BASELINE_MODE.to_string(),
            reason: format!("unknown baseline mode '{}'", other),
        }),
    }
}

/// Persist a baseline selection.
pub async fn save_baseline_selection(
    store: &dyn SettingsStore,
    selection: &BaselineSelection,
) -> Result<(), SettingsError> {
    match selection {
        BaselineSelection::Default => {
            store.set(KEY_BASELINE_MODE, Value::from("default")).await?;
        }
        BaselineSelection::StepUrl { url } => {
            store.set(KEY_BASELINE_MODE, Value::from("step_url")).await?;
            store.set(KEY_BASELINE_STEP_URL, Value::from(url.as_str())).await?;
        }
        BaselineSelection::UserValues { app_name, test_name } => {
            store.set(KEY_BASELINE_MODE, Value::from("user_values")).await?;
            store.set(KEY_BASELINE_APP_NAME, Value::from(app_name.as_str())).await?;
            store.set(KEY_BASELINE_TEST_NAME, Value::from(test_name.as_str())).await?;
        }
    }
    Ok(())
}

/// Server endpoints from the store, falling back to `defaults` per key.
pub async fn load_servers(
    store: &dyn SettingsStore,
    defaults: &ServerSettings,
) -> Result<ServerSettings, SettingsError> {
    Ok(ServerSettings {
        server_url: get_string(store, KEY_SERVER_URL)
            .await?
            .unwrap_or_else(|| defaults.server_url.clone()),
        api_url: get_string(store, KEY_API_URL)
            .await?
            .unwrap_or_else(|| defaults.api_url.clone()),
    })
}
