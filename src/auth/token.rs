//! Token lifecycle management
//!
//! Per-provider state machine over a persisted OAuth token set:
//! `no_tokens -> valid -> expiring -> refreshing -> valid` on the happy path,
//! `refreshing -> expired` (reconnect required) when a refresh fails. Refresh
//! is strictly serialized per provider and scheduled proactively on a
//! background timer, which is process-lifetime state: it survives session
//! cancellation and is only disarmed by logout or explicit disposal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::credentials::CredentialStore;
use crate::error::{Result, SessionError};

/// Fixed window before expiry at which proactive refresh is scheduled
pub const DEFAULT_LEAD_TIME: Duration = Duration::from_secs(30 * 60);

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// A persisted OAuth token pair
///
/// Replaced wholesale on every refresh, never partially updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokenSet {
    /// Access token used to authorize backend calls
    pub access_token: String,
    /// Refresh token exchanged for new token sets
    pub refresh_token: String,
    /// Unix timestamp (seconds) when the access token expires
    pub expires_at: u64,
    /// Account identifier embedded in the token, when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

impl OAuthTokenSet {
    /// True once `expires_at` has passed
    #[must_use]
    pub fn is_expired(&self) -> bool {
        now_secs() >= self.expires_at
    }

    /// True when current time has passed `expires_at - lead_time`
    #[must_use]
    pub fn is_within_lead(&self, lead_time: Duration) -> bool {
        now_secs() + lead_time.as_secs() >= self.expires_at
    }

    /// Seconds until the proactive refresh point, zero if already past it
    #[must_use]
    pub fn secs_until_refresh(&self, lead_time: Duration) -> u64 {
        self.expires_at
            .saturating_sub(lead_time.as_secs())
            .saturating_sub(now_secs())
    }
}

/// Derived token health, computed on demand and never cached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenHealth {
    /// No token set is persisted
    NoTokens,
    /// Token is valid and outside the lead window
    Valid,
    /// Token is inside the lead window but not yet expired
    Expiring,
    /// Token has expired
    Expired,
    /// A refresh is currently in flight
    Refreshing,
}

/// Exchanges a refresh token for a new token set
///
/// The HTTP implementation talks to the provider's token endpoint; tests
/// inject their own.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchange `refresh_token` for a fresh token set
    async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokenSet>;
}

/// Wire shape of a token endpoint response
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// HTTP token refresher posting a JSON `refresh_token` grant
#[derive(Debug, Clone)]
pub struct HttpTokenRefresher {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
}

impl HttpTokenRefresher {
    /// Create a refresher for the given token endpoint and client id
    #[must_use]
    pub fn new(token_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url: token_url.into(),
            client_id: client_id.into(),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokenSet> {
        let body = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": self.client_id,
        });

        let response = self
            .client
            .post(&self.token_url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;
        let text = response.text().await?;

        if let Ok(err) = serde_json::from_str::<TokenErrorResponse>(&text) {
            let msg = err.error_description.unwrap_or(err.error);
            return Err(SessionError::token_exchange(msg));
        }

        let parsed: TokenResponse = serde_json::from_str(&text).map_err(|e| {
            SessionError::token_exchange(format!("invalid refresh response: {e}"))
        })?;

        Ok(OAuthTokenSet {
            access_token: parsed.access_token,
            // Providers may rotate the refresh token; keep the old one if not
            refresh_token: parsed
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
            expires_at: now_secs() + parsed.expires_in.unwrap_or(3600),
            account_id: parsed.account_id,
        })
    }
}

/// Notification pushed to subscribers when stored credentials stop being
/// usable and interactive re-authentication is needed
#[derive(Debug, Clone)]
pub struct ReconnectNotice {
    /// Provider the notice applies to
    pub provider: String,
    /// Human-readable reason
    pub reason: String,
}

struct TokenManagerInner {
    provider: String,
    account: String,
    store: CredentialStore,
    refresher: Arc<dyn TokenRefresher>,
    lead_time: Duration,
    /// Serializes refreshes per provider; a second caller waits on the first
    refresh_lock: tokio::sync::Mutex<()>,
    reconnect_required: AtomicBool,
    notify_tx: broadcast::Sender<ReconnectNotice>,
    timer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Per-provider token lifecycle manager
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<TokenManagerInner>,
}

impl TokenManager {
    /// Create a manager for `provider`, persisting under `<provider>/oauth`
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        store: CredentialStore,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self::with_lead_time(provider, store, refresher, DEFAULT_LEAD_TIME)
    }

    /// Create a manager with a custom lead time
    #[must_use]
    pub fn with_lead_time(
        provider: impl Into<String>,
        store: CredentialStore,
        refresher: Arc<dyn TokenRefresher>,
        lead_time: Duration,
    ) -> Self {
        let provider = provider.into();
        let (notify_tx, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(TokenManagerInner {
                account: format!("{provider}/oauth"),
                provider,
                store,
                refresher,
                lead_time,
                refresh_lock: tokio::sync::Mutex::new(()),
                reconnect_required: AtomicBool::new(false),
                notify_tx,
                timer: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Arm the refresh scheduler from persisted state
    ///
    /// Called once at process start. If persisted tokens exist the next
    /// refresh is scheduled immediately; when the process restarts already
    /// inside the lead window this performs an eager catch-up refresh instead
    /// of waiting for the original timer.
    pub fn start(&self) {
        if self.tokens().is_some() {
            self.arm_timer();
        }
    }

    /// Load the persisted token set, if any
    #[must_use]
    pub fn tokens(&self) -> Option<OAuthTokenSet> {
        let raw = self.inner.store.load(&self.inner.account)?;
        match serde_json::from_str(&raw) {
            Ok(tokens) => Some(tokens),
            Err(e) => {
                tracing::warn!(provider = %self.inner.provider, error = %e, "Discarding unparseable token set");
                None
            }
        }
    }

    /// Compute current token health
    #[must_use]
    pub fn health(&self) -> TokenHealth {
        if self.inner.refresh_lock.try_lock().is_err() {
            return TokenHealth::Refreshing;
        }
        match self.tokens() {
            None => TokenHealth::NoTokens,
            Some(t) if t.is_expired() => TokenHealth::Expired,
            Some(t) if t.is_within_lead(self.inner.lead_time) => TokenHealth::Expiring,
            Some(_) => TokenHealth::Valid,
        }
    }

    /// Unix timestamp of the next scheduled refresh, if tokens exist
    #[must_use]
    pub fn next_refresh_at(&self) -> Option<u64> {
        self.tokens()
            .map(|t| t.expires_at.saturating_sub(self.inner.lead_time.as_secs()))
    }

    /// True once a failed refresh has flagged this provider for re-login
    #[must_use]
    pub fn reconnect_required(&self) -> bool {
        self.inner.reconnect_required.load(Ordering::SeqCst)
    }

    /// Subscribe to reconnect-required notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectNotice> {
        self.inner.notify_tx.subscribe()
    }

    /// Entry point used before every backend call
    ///
    /// Returns the access token if tokens are valid or were just refreshed.
    /// Returns `None` when no tokens exist (caller falls through to other auth
    /// methods) or when a refresh failed, leaving the reconnect-required flag
    /// set.
    pub async fn ensure_valid_token(&self) -> Option<String> {
        let tokens = self.tokens()?;
        if !tokens.is_within_lead(self.inner.lead_time) {
            return Some(tokens.access_token);
        }

        // Inside the lead window: refresh, serialized with the background
        // timer and any concurrent caller.
        let _guard = self.inner.refresh_lock.lock().await;

        // Re-check after acquiring: the refresh we waited on may have already
        // produced a fresh token set.
        let tokens = self.tokens()?;
        if !tokens.is_within_lead(self.inner.lead_time) {
            return Some(tokens.access_token);
        }

        match self.refresh_locked(&tokens).await {
            Ok(new_tokens) => Some(new_tokens.access_token),
            Err(_) => None,
        }
    }

    /// Persist a freshly obtained token set and arm the scheduler
    ///
    /// Called by the OAuth login flow after a successful code exchange.
    ///
    /// # Errors
    ///
    /// Returns an error if the token set cannot be persisted.
    pub fn install(&self, tokens: &OAuthTokenSet) -> Result<crate::credentials::StorageBackend> {
        let raw = serde_json::to_string(tokens)?;
        let backend = self.inner.store.store(&self.inner.account, &raw)?;
        self.inner.reconnect_required.store(false, Ordering::SeqCst);
        self.arm_timer();
        Ok(backend)
    }

    /// Delete persisted tokens and disarm the scheduler
    ///
    /// # Errors
    ///
    /// Returns an error if credential deletion fails.
    pub fn logout(&self) -> Result<()> {
        self.disarm_timer();
        self.inner.reconnect_required.store(false, Ordering::SeqCst);
        self.inner.store.delete(&self.inner.account)
    }

    /// Cancel the outstanding refresh timer
    ///
    /// The manager remains usable; `install` re-arms it.
    pub fn dispose(&self) {
        self.disarm_timer();
    }

    /// Perform one refresh under an already-held refresh lock
    async fn refresh_locked(&self, tokens: &OAuthTokenSet) -> Result<OAuthTokenSet> {
        tracing::debug!(provider = %self.inner.provider, "Refreshing OAuth tokens");
        match self.inner.refresher.refresh(&tokens.refresh_token).await {
            Ok(mut new_tokens) => {
                if new_tokens.account_id.is_none() {
                    new_tokens.account_id = tokens.account_id.clone();
                }
                let raw = serde_json::to_string(&new_tokens)?;
                self.inner.store.store(&self.inner.account, &raw)?;
                self.inner.reconnect_required.store(false, Ordering::SeqCst);
                tracing::info!(
                    provider = %self.inner.provider,
                    expires_at = new_tokens.expires_at,
                    "Token refresh succeeded"
                );
                Ok(new_tokens)
            }
            Err(e) => {
                // No automatic retry: a possibly-revoked refresh token risks
                // provider-side lockout. The user must re-authenticate.
                let reason = format!("token refresh failed: {e}");
                tracing::warn!(provider = %self.inner.provider, %reason, "Marking provider reconnect-required");
                self.inner.reconnect_required.store(true, Ordering::SeqCst);
                let _ = self.inner.notify_tx.send(ReconnectNotice {
                    provider: self.inner.provider.clone(),
                    reason: reason.clone(),
                });
                Err(e)
            }
        }
    }

    /// (Re)spawn the background refresh task
    ///
    /// The task recomputes its deadline from the persisted token set on every
    /// iteration, so an out-of-band refresh through `ensure_valid_token`
    /// pushes the next firing out automatically.
    fn arm_timer(&self) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Some(tokens) = manager.tokens() else {
                    break;
                };
                let delay = tokens.secs_until_refresh(manager.inner.lead_time);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }

                let _guard = manager.inner.refresh_lock.lock().await;
                let Some(current) = manager.tokens() else {
                    break;
                };
                if !current.is_within_lead(manager.inner.lead_time) {
                    // Someone refreshed while we slept; loop recomputes.
                    continue;
                }
                if manager.refresh_locked(&current).await.is_err() {
                    break;
                }
            }
        });

        let mut timer = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(old) = timer.replace(handle) {
            old.abort();
        }
    }

    fn disarm_timer(&self) {
        let mut timer = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(handle) = timer.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    struct CountingRefresher {
        calls: AtomicU32,
        fail: bool,
    }

    impl CountingRefresher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokenSet> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SessionError::token_exchange("invalid_grant"));
            }
            Ok(OAuthTokenSet {
                access_token: "fresh_access".to_string(),
                refresh_token: refresh_token.to_string(),
                expires_at: now_secs() + 3600 * 8,
                account_id: None,
            })
        }
    }

    fn manager_with(
        dir: &TempDir,
        refresher: Arc<dyn TokenRefresher>,
        expires_in: i64,
    ) -> TokenManager {
        let store = CredentialStore::with_fallback_dir("\0", dir.path().to_path_buf());
        let manager = TokenManager::with_lead_time(
            "codex",
            store,
            refresher,
            Duration::from_secs(30 * 60),
        );
        let expires_at = (now_secs() as i64 + expires_in).max(0) as u64;
        let tokens = OAuthTokenSet {
            access_token: "old_access".to_string(),
            refresh_token: "old_refresh".to_string(),
            expires_at,
            account_id: Some("acct_1".to_string()),
        };
        let raw = serde_json::to_string(&tokens).unwrap();
        manager.inner.store.store(&manager.inner.account, &raw).unwrap();
        manager
    }

    #[tokio::test]
    async fn test_valid_token_returned_without_refresh() {
        let dir = TempDir::new().unwrap();
        let refresher = CountingRefresher::new(false);
        let manager = manager_with(&dir, refresher.clone(), 3600 * 4);

        let token = manager.ensure_valid_token().await.unwrap();
        assert_eq!(token, "old_access");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.health(), TokenHealth::Valid);
    }

    #[tokio::test]
    async fn test_token_inside_lead_window_is_refreshed() {
        // Expires 25 minutes out, lead time 30 minutes: must refresh.
        let dir = TempDir::new().unwrap();
        let refresher = CountingRefresher::new(false);
        let manager = manager_with(&dir, refresher.clone(), 25 * 60);
        assert_eq!(manager.health(), TokenHealth::Expiring);

        let token = manager.ensure_valid_token().await.unwrap();
        assert_eq!(token, "fresh_access");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        // Account id carried over from the replaced set
        assert_eq!(manager.tokens().unwrap().account_id.as_deref(), Some("acct_1"));
    }

    #[tokio::test]
    async fn test_failed_refresh_sets_reconnect_required() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(&dir, CountingRefresher::new(true), 25 * 60);
        let mut notices = manager.subscribe();

        assert!(manager.ensure_valid_token().await.is_none());
        assert!(manager.reconnect_required());

        let notice = notices.try_recv().unwrap();
        assert_eq!(notice.provider, "codex");
        assert!(notice.reason.contains("invalid_grant"));
    }

    #[tokio::test]
    async fn test_no_tokens_returns_none_without_flagging() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::with_fallback_dir("\0", dir.path().to_path_buf());
        let manager = TokenManager::new("codex", store, CountingRefresher::new(false));

        assert!(manager.ensure_valid_token().await.is_none());
        assert!(!manager.reconnect_required());
        assert_eq!(manager.health(), TokenHealth::NoTokens);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_serialized() {
        let dir = TempDir::new().unwrap();
        let refresher = CountingRefresher::new(false);
        let manager = manager_with(&dir, refresher.clone(), 25 * 60);

        let (a, b) = tokio::join!(manager.ensure_valid_token(), manager.ensure_valid_token());
        assert_eq!(a.unwrap(), "fresh_access");
        assert_eq!(b.unwrap(), "fresh_access");
        // Second caller waited on the first and reused its result
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_catch_up_refresh_on_start_inside_lead_window() {
        // Simulates a process restart after the scheduled refresh point but
        // before expiry: the timer must fire immediately, not wait.
        let dir = TempDir::new().unwrap();
        let refresher = CountingRefresher::new(false);
        let manager = manager_with(&dir, refresher.clone(), 10 * 60);

        manager.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.tokens().unwrap().access_token, "fresh_access");
        manager.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_refresh_fires_at_lead_boundary() {
        let dir = TempDir::new().unwrap();
        let refresher = CountingRefresher::new(false);
        // Expires in 2h, lead 30m: refresh due in 90m.
        let manager = manager_with(&dir, refresher.clone(), 2 * 3600);

        manager.start();
        tokio::time::sleep(Duration::from_secs(60 * 60)).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(31 * 60)).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        manager.dispose();
    }

    #[tokio::test]
    async fn test_logout_deletes_tokens() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(&dir, CountingRefresher::new(false), 3600 * 4);
        manager.logout().unwrap();
        assert!(manager.tokens().is_none());
        assert_eq!(manager.health(), TokenHealth::NoTokens);
    }
}
