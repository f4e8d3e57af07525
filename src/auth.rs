//! Account and credential resolution.
//!
//! Resolution ends in one of three states:
//! - [`AuthState::Accounts`]: the server returned the user's accounts
//! - [`AuthState::Legacy`]: the server has no account list, but a legacy API
//!   key and account id are configured
//! - [`AuthState::Unauthenticated`]: neither, with the URL the user should be
//!   sent to

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::browser::{BrowserError, BrowserSurface};
use crate::config::ServerSettings;
use crate::settings::{
    KEY_CURRENT_ACCOUNT_ID, KEY_LEGACY_ACCOUNT_ID, KEY_LEGACY_API_KEY, SettingsError, SettingsStore,
    get_string, load_servers,
};

/// Cookie holding the user's session on the main server
pub const SESSION_COOKIE: &str = "session";

/// Where users without any account are sent
pub const ACCESS_DENIED_PATH: &str = "/app/access-denied";

/// Where users without legacy credentials are sent
pub const LEGACY_LOGIN_PATH: &str = "/app/login";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("not authenticated, sign in at {redirect_url}")]
    Unauthenticated { redirect_url: String },

    #[error("account selection requires the multi-account scheme")]
    WrongScheme,

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("account list unavailable: {0}")]
    Directory(String),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Browser(#[from] BrowserError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub is_current: bool,
    pub runner_key: String,
    pub access_key: String,
}

/// Source of the signed-in user's account list.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Fails when the server does not support accounts or the user is not
    /// signed in under that scheme.
    async fn fetch_accounts(
        &self,
        api_url: &str,
        session_cookie: Option<&str>,
    ) -> Result<Vec<Account>, AuthError>;
}

/// Fixed account list (or fixed failure).
pub struct StaticAccountDirectory {
    accounts: Option<Vec<Account>>,
}

impl StaticAccountDirectory {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self {
            accounts: Some(accounts),
        }
    }

    /// A directory whose server does not know about accounts.
    pub fn unsupported() -> Self {
        Self { accounts: None }
    }
}

#[async_trait]
impl AccountDirectory for StaticAccountDirectory {
    async fn fetch_accounts(
        &self,
        _api_url: &str,
        _session_cookie: Option<&str>,
    ) -> Result<Vec<Account>, AuthError> {
        self.accounts
            .clone()
            .ok_or_else(|| AuthError::Directory("account listing not supported".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Accounts { accounts: Vec<Account>, current: usize },
    Legacy { api_key: String, account_id: String },
    Unauthenticated { redirect_url: String },
}

/// Credentials handed to the comparison engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountCredentials {
    Account {
        account_id: String,
        run_key: String,
        access_key: String,
    },
    Legacy {
        account_id: String,
        api_key: String,
    },
}

impl AccountCredentials {
    pub fn account_id(&self) -> &str {
        match self {
            Self::Account { account_id, .. } | Self::Legacy { account_id, .. } => account_id,
        }
    }
}

pub struct AccountSession {
    store: Arc<dyn SettingsStore>,
    directory: Arc<dyn AccountDirectory>,
    browser: Arc<dyn BrowserSurface>,
    servers: ServerSettings,
    state: Mutex<Option<AuthState>>,
}

impl AccountSession {
    pub fn new(
        store: Arc<dyn SettingsStore>,
        directory: Arc<dyn AccountDirectory>,
        browser: Arc<dyn BrowserSurface>,
        servers: ServerSettings,
    ) -> Self {
        Self {
            store,
            directory,
            browser,
            servers,
            state: Mutex::new(None),
        }
    }

    /// Resolve credentials from scratch and cache the result.
    pub async fn reload(&self) -> Result<AuthState, AuthError> {
        let store = self.store.as_ref();
        let ServerSettings { server_url, api_url } = load_servers(store, &self.servers).await?;

        let cookie = self.browser.get_cookie(&server_url, SESSION_COOKIE).await?;
        let state = match self.directory.fetch_accounts(&api_url, cookie.as_deref()).await {
            Ok(accounts) if accounts.is_empty() => {
                info!("signed in without any account");
                AuthState::Unauthenticated {
                    redirect_url: join_url(&server_url, ACCESS_DENIED_PATH),
                }
            }
            Ok(accounts) => {
                let remembered = get_string(store, KEY_CURRENT_ACCOUNT_ID).await?;
                let current = select_account(&accounts, remembered.as_deref());
                info!(account_id = %accounts[current].account_id, "accounts resolved");
                AuthState::Accounts { accounts, current }
            }
            Err(err) => {
                debug!(error = %err, "account list unavailable, trying legacy credentials");
                let api_key = get_string(store, KEY_LEGACY_API_KEY).await?;
                let account_id = get_string(store, KEY_LEGACY_ACCOUNT_ID).await?;
                match (api_key, account_id) {
                    (Some(api_key), Some(account_id)) => {
                        info!(%account_id, "using legacy credentials");
                        AuthState::Legacy { api_key, account_id }
                    }
                    _ => {
                        warn!("no credentials available");
                        AuthState::Unauthenticated {
                            redirect_url: join_url(&server_url, LEGACY_LOGIN_PATH),
                        }
                    }
                }
            }
        };

        *self.state.lock() = Some(state.clone());
        Ok(state)
    }

    /// Cached state, resolving on first use.
    pub async fn state(&self) -> Result<AuthState, AuthError> {
        let cached = self.state.lock().clone();
        match cached {
            Some(state) => Ok(state),
            None => self.reload().await,
        }
    }

    pub async fn accounts(&self) -> Result<Option<Vec<Account>>, AuthError> {
        Ok(match self.state().await? {
            AuthState::Accounts { accounts, .. } => Some(accounts),
            _ => None,
        })
    }

    pub async fn current_account_index(&self) -> Result<Option<usize>, AuthError> {
        Ok(match self.state().await? {
            AuthState::Accounts { current, .. } => Some(current),
            _ => None,
        })
    }

    pub async fn current_account_id(&self) -> Result<String, AuthError> {
        Ok(self.credentials().await?.account_id().to_string())
    }

    /// Switch to another of the user's accounts and remember the choice.
    pub async fn set_current_account(&self, account_id: &str) -> Result<(), AuthError> {
        let index = {
            let mut guard = self.state.lock();
            let Some(AuthState::Accounts { accounts, current }) = guard.as_mut() else {
                return Err(AuthError::WrongScheme);
            };
            let index = accounts
                .iter()
                .position(|a| a.account_id == account_id)
                .ok_or_else(|| AuthError::AccountNotFound(account_id.to_string()))?;
            *current = index;
            index
        };
        self.store
            .set(KEY_CURRENT_ACCOUNT_ID, Value::from(account_id))
            .await?;
        info!(account_id, index, "current account changed");
        Ok(())
    }

    pub async fn credentials(&self) -> Result<AccountCredentials, AuthError> {
        match self.state().await? {
            AuthState::Accounts { accounts, current } => {
                let account = &accounts[current];
                Ok(AccountCredentials::Account {
                    account_id: account.account_id.clone(),
                    run_key: account.runner_key.clone(),
                    access_key: account.access_key.clone(),
                })
            }
            AuthState::Legacy { api_key, account_id } => {
                Ok(AccountCredentials::Legacy { account_id, api_key })
            }
            AuthState::Unauthenticated { redirect_url } => {
                Err(AuthError::Unauthenticated { redirect_url })
            }
        }
    }

    /// Key used to submit test runs.
    pub async fn run_key(&self) -> Result<String, AuthError> {
        Ok(match self.credentials().await? {
            AccountCredentials::Account { run_key, .. } => run_key,
            AccountCredentials::Legacy { api_key, .. } => api_key,
        })
    }

    /// Key used to open result pages.
    pub async fn results_view_key(&self) -> Result<String, AuthError> {
        Ok(match self.credentials().await? {
            AccountCredentials::Account { access_key, .. } => access_key,
            AccountCredentials::Legacy { api_key, .. } => api_key,
        })
    }

    /// Key used for read access to the account.
    pub async fn access_key(&self) -> Result<String, AuthError> {
        self.results_view_key().await
    }
}

/// Remembered selection, else the server's current account, else the first.
fn select_account(accounts: &[Account], remembered: Option<&str>) -> usize {
    remembered
        .and_then(|id| accounts.iter().position(|a| a.account_id == id))
        .or_else(|| accounts.iter().position(|a| a.is_current))
        .unwrap_or(0)
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::SimulatedBrowser;
    use crate::settings::MemoryStore;

    fn account(id: &str, is_current: bool) -> Account {
        Account {
            account_id: id.to_string(),
            is_current,
            runner_key: format!("run-{}", id),
            access_key: format!("access-{}", id),
        }
    }

    fn session(store: MemoryStore, directory: StaticAccountDirectory) -> AccountSession {
        AccountSession::new(
            Arc::new(store),
            Arc::new(directory),
            Arc::new(SimulatedBrowser::new()),
            ServerSettings::defaults(),
        )
    }

    #[tokio::test]
    async fn test_server_current_account_selected_without_prior_choice() {
        let auth = session(
            MemoryStore::new(),
            StaticAccountDirectory::new(vec![account("a", false), account("b", true)]),
        );
        assert_eq!(auth.current_account_index().await.unwrap(), Some(1));
        assert_eq!(auth.run_key().await.unwrap(), "run-b");
    }

    #[tokio::test]
    async fn test_remembered_choice_wins() {
        let auth = session(
            MemoryStore::new().with(KEY_CURRENT_ACCOUNT_ID, "a"),
            StaticAccountDirectory::new(vec![account("a", false), account("b", true)]),
        );
        assert_eq!(auth.current_account_index().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_empty_account_list_is_access_denied() {
        let auth = session(MemoryStore::new(), StaticAccountDirectory::new(vec![]));
        let state = auth.state().await.unwrap();
        assert_eq!(
            state,
            AuthState::Unauthenticated {
                redirect_url: format!("{}{}", crate::config::DEFAULT_SERVER_URL, ACCESS_DENIED_PATH)
            }
        );
        assert!(matches!(auth.run_key().await, Err(AuthError::Unauthenticated { .. })));
    }

    #[tokio::test]
    async fn test_legacy_fallback_with_both_values() {
        let auth = session(
            MemoryStore::new()
                .with(KEY_LEGACY_API_KEY, "legacy-key")
                .with(KEY_LEGACY_ACCOUNT_ID, "acct-9"),
            StaticAccountDirectory::unsupported(),
        );
        assert_eq!(
            auth.state().await.unwrap(),
            AuthState::Legacy {
                api_key: "legacy-key".to_string(),
                account_id: "acct-9".to_string()
            }
        );
        assert_eq!(auth.run_key().await.unwrap(), "legacy-key");
        assert_eq!(auth.current_account_id().await.unwrap(), "acct-9");
        assert_eq!(auth.accounts().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_legacy_fallback_missing_value_redirects_to_login() {
        let auth = session(
            MemoryStore::new().with(KEY_LEGACY_API_KEY, "legacy-key"),
            StaticAccountDirectory::unsupported(),
        );
        match auth.state().await.unwrap() {
            AuthState::Unauthenticated { redirect_url } => {
                assert!(redirect_url.ends_with(LEGACY_LOGIN_PATH))
            }
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_set_current_account_validates_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let auth = AccountSession::new(
            store.clone(),
            Arc::new(StaticAccountDirectory::new(vec![account("a", true), account("b", false)])),
            Arc::new(SimulatedBrowser::new()),
            ServerSettings::defaults(),
        );
        auth.state().await.unwrap();

        assert_eq!(
            auth.set_current_account("zzz").await,
            Err(AuthError::AccountNotFound("zzz".to_string()))
        );
        auth.set_current_account("b").await.unwrap();
        assert_eq!(auth.access_key().await.unwrap(), "access-b");
        assert_eq!(
            store.get(KEY_CURRENT_ACCOUNT_ID).await.unwrap(),
            Some(Value::from("b"))
        );
    }

    #[tokio::test]
    async fn test_set_current_account_requires_account_scheme() {
        let auth = session(
            MemoryStore::new()
                .with(KEY_LEGACY_API_KEY, "k")
                .with(KEY_LEGACY_ACCOUNT_ID, "a"),
            StaticAccountDirectory::unsupported(),
        );
        auth.state().await.unwrap();
        assert_eq!(auth.set_current_account("a").await, Err(AuthError::WrongScheme));
    }
}
