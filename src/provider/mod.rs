//! Provider contract, registry, and query options
//!
//! One `Provider` implementation exists per backend. The registry constructs
//! them lazily and memoizes one live instance per name, so unused backend
//! dependencies never load. `query()` is the single streaming entry point;
//! everything the UI learns about agent activity flows through it as
//! canonical messages.

pub mod claude;
pub mod codex;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::auth::oauth::{CallbackParams, LoginStart};
use crate::auth::token::{ReconnectNotice, TokenHealth};
use crate::credentials::{CredentialStore, StorageBackend};
use crate::error::{Result, SessionError};
use crate::protocol::{CanonicalMessage, QuerySummary};
use crate::session::RunHandle;

pub use claude::ClaudeProvider;
pub use codex::CodexProvider;

/// Declaration of one auxiliary tool server passed in from the application
#[derive(Debug, Clone, Default)]
pub struct ToolServerConfig {
    /// Server name
    pub name: String,
    /// Command to launch the server
    pub command: String,
    /// Arguments for the command
    pub args: Vec<String>,
    /// Extra environment for the server process
    pub env: HashMap<String, String>,
    /// Whether the server starts enabled
    pub enabled: bool,
}

/// Callback invoked once with the live run handle, before streaming begins
pub type HandleCallback = Box<dyn FnOnce(RunHandle) + Send>;

/// Configuration for one `query()` call, passed verbatim from the
/// application layer
#[derive(TypedBuilder)]
pub struct QueryOptions {
    /// The first user turn
    #[builder(setter(into))]
    pub prompt: String,

    /// Model to run
    #[builder(default, setter(strip_option, into))]
    pub model: Option<String>,

    /// Reasoning effort hint, backend-specific values
    #[builder(default, setter(strip_option, into))]
    pub reasoning_effort: Option<String>,

    /// Permission/approval mode, backend-specific values
    #[builder(default, setter(strip_option, into))]
    pub permission_mode: Option<String>,

    /// Working directory for the backend process
    #[builder(default, setter(strip_option))]
    pub cwd: Option<PathBuf>,

    /// Environment overrides for the backend process
    #[builder(default)]
    pub env: HashMap<String, String>,

    /// Auxiliary tool servers to declare
    #[builder(default)]
    pub tool_servers: Vec<ToolServerConfig>,

    /// Receives the live run handle before the first event arrives
    #[builder(default, setter(strip_option))]
    pub on_handle: Option<HandleCallback>,

    /// Abort signal shared with the backend subprocess
    #[builder(default, setter(strip_option))]
    pub cancellation_token: Option<CancellationToken>,
}

impl std::fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("prompt", &self.prompt)
            .field("model", &self.model)
            .field("reasoning_effort", &self.reasoning_effort)
            .field("permission_mode", &self.permission_mode)
            .field("cwd", &self.cwd)
            .field("tool_servers", &self.tool_servers.len())
            .finish_non_exhaustive()
    }
}

/// How the provider is currently authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Not authenticated
    None,
    /// API key, from the environment or the credential store
    ApiKey,
    /// The backend CLI's own credential file
    CliDelegated,
    /// Stored OAuth token set
    OAuth,
}

/// Auth status exposed to the application layer
///
/// Derived on demand from the credential store, token manager, environment,
/// and CLI-native auth files; never cached across a provider swap.
#[derive(Debug, Clone, Serialize)]
pub struct AuthStatus {
    /// Whether usable credentials exist right now
    pub authenticated: bool,
    /// Which credential kind is in effect
    pub method: AuthMethod,
    /// Account identity, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Human-readable reason when not authenticated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Where the active credential is stored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_backend: Option<StorageBackend>,
    /// OAuth token health
    pub token_health: TokenHealth,
    /// Unix timestamp of the next scheduled token refresh
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_refresh_at: Option<u64>,
    /// True when stored credentials stopped working and the user must
    /// re-authenticate
    pub reconnect_required: bool,
}

impl AuthStatus {
    /// Status for a provider with no usable credentials
    #[must_use]
    pub fn unauthenticated(error: Option<String>) -> Self {
        Self {
            authenticated: false,
            method: AuthMethod::None,
            identity: None,
            error,
            storage_backend: None,
            token_health: TokenHealth::NoTokens,
            next_refresh_at: None,
            reconnect_required: false,
        }
    }
}

/// A live streaming query: the message sequence plus the deferred summary
pub struct QueryRun {
    messages: mpsc::UnboundedReceiver<CanonicalMessage>,
    summary: oneshot::Receiver<QuerySummary>,
}

impl QueryRun {
    /// Assemble a run from its channel halves (used by providers)
    #[must_use]
    pub fn new(
        messages: mpsc::UnboundedReceiver<CanonicalMessage>,
        summary: oneshot::Receiver<QuerySummary>,
    ) -> Self {
        Self { messages, summary }
    }

    /// Next canonical message, `None` once the stream ends
    pub async fn next_message(&mut self) -> Option<CanonicalMessage> {
        self.messages.recv().await
    }

    /// Drain any remaining messages and return the final summary
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session ended without
    /// producing a summary.
    pub async fn finish(mut self) -> Result<QuerySummary> {
        while self.messages.recv().await.is_some() {}
        self.summary
            .await
            .map_err(|_| SessionError::closed("session ended without a summary"))
    }
}

impl futures::Stream for QueryRun {
    type Item = CanonicalMessage;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.messages.poll_recv(cx)
    }
}

/// Uniform backend contract
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name as the registry knows it
    fn name(&self) -> &str;

    /// Verify the backend binary/runtime can be spawned
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::BinaryNotFound`] when the backend is not
    /// installed.
    async fn check_ready(&self) -> Result<()>;

    /// Derive the current auth status
    async fn auth_status(&self) -> AuthStatus;

    /// Store an API key for this provider
    ///
    /// # Errors
    ///
    /// Returns an error only when both credential backends fail.
    async fn login_with_api_key(&self, key: &str) -> Result<StorageBackend>;

    /// Start an OAuth login flow
    ///
    /// # Errors
    ///
    /// Returns an error when the flow cannot be started (e.g. the loopback
    /// port is taken).
    async fn start_oauth_login(&self) -> Result<LoginStart>;

    /// Complete a pending OAuth login flow
    ///
    /// For loopback flows `callback` may be `None`; the provider then waits
    /// for the local redirect to deliver code and state. Auth failures are
    /// reported inside the returned status, not as errors.
    ///
    /// # Errors
    ///
    /// Returns an error only for non-auth failures (I/O, storage).
    async fn complete_oauth_login(
        &self,
        login_id: &str,
        callback: Option<CallbackParams>,
    ) -> Result<AuthStatus>;

    /// Run a streaming query
    ///
    /// # Errors
    ///
    /// Returns an error when the session cannot be started; failures after
    /// startup travel through the stream as data.
    async fn query(&self, options: QueryOptions) -> Result<QueryRun>;

    /// Delete stored credentials and disarm refresh timers
    ///
    /// # Errors
    ///
    /// Returns an error if credential deletion fails.
    async fn reset_auth(&self) -> Result<()>;

    /// Subscribe to reconnect-required notifications
    fn subscribe_reconnect(&self) -> broadcast::Receiver<ReconnectNotice>;

    /// Tear down background tasks owned by this provider
    async fn dispose(&self);
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").field("name", &self.name()).finish()
    }
}

/// Lazily constructs and memoizes one provider instance per name
pub struct ProviderRegistry {
    store: CredentialStore,
    providers: tokio::sync::Mutex<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    /// Create a registry persisting credentials under the given service name
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self::with_store(CredentialStore::new(service))
    }

    /// Create a registry over an existing credential store (used by tests)
    #[must_use]
    pub fn with_store(store: CredentialStore) -> Self {
        Self {
            store,
            providers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Get or construct the provider for `name`
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnknownProvider`] for unrecognized names.
    pub async fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        let mut providers = self.providers.lock().await;
        if let Some(provider) = providers.get(name) {
            return Ok(Arc::clone(provider));
        }

        let provider: Arc<dyn Provider> = match name {
            "codex" => Arc::new(CodexProvider::new(self.store.clone())),
            "claude" => Arc::new(ClaudeProvider::new(self.store.clone())),
            other => return Err(SessionError::UnknownProvider(other.to_string())),
        };
        tracing::debug!(provider = name, "Constructed provider instance");
        providers.insert(name.to_string(), Arc::clone(&provider));
        Ok(provider)
    }

    /// Names of providers constructed so far
    pub async fn active(&self) -> Vec<String> {
        self.providers.lock().await.keys().cloned().collect()
    }

    /// Dispose every constructed provider
    pub async fn dispose_all(&self) {
        let providers: Vec<Arc<dyn Provider>> =
            self.providers.lock().await.drain().map(|(_, p)| p).collect();
        for provider in providers {
            provider.dispose().await;
        }
    }
}
