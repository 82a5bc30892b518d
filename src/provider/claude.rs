//! Token-streaming backend provider
//!
//! Drives the `claude` CLI in stream-json mode. Input and output are both
//! open streams: a writer task feeds injected turns from the [`TurnQueue`]
//! as user messages, while the read loop passes the near-canonical output
//! through the [`StreamNormalizer`]. Mid-session controls ride the same
//! stdin pipe as `control_request` lines.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::auth::oauth::{CallbackParams, LoginStart, OAuthClient, OAuthConfig};
use crate::auth::token::{HttpTokenRefresher, ReconnectNotice, TokenManager};
use crate::credentials::{CredentialStore, StorageBackend};
use crate::error::{Result, SessionError};
use crate::normalize::stream::{NativeStreamMessage, StreamNormalizer};
use crate::protocol::{CanonicalMessage, QuerySummary};
use crate::runtime::resolve_binary;
use crate::session::{RunHandle, SessionControls, ToolServerInfo, TurnInput, TurnQueue};
use crate::transport::{ProcessSpec, SubprocessTransport, Transport};

use super::{AuthMethod, AuthStatus, Provider, QueryOptions, QueryRun};

const PROVIDER_NAME: &str = "claude";
const API_KEY_ACCOUNT: &str = "claude/api_key";
const OAUTH_ACCOUNT: &str = "claude/oauth";
const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
const OAUTH_TOKEN_ENV: &str = "CLAUDE_CODE_OAUTH_TOKEN";
const BIN_OVERRIDE_ENV: &str = "CLAUDE_BIN";

const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const OAUTH_AUTH_URL: &str = "https://claude.ai/oauth/authorize";
const OAUTH_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const OAUTH_REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";
const OAUTH_SCOPES: &str = "org:create_api_key user:profile user:inference";

fn oauth_config() -> OAuthConfig {
    OAuthConfig {
        client_id: OAUTH_CLIENT_ID.to_string(),
        auth_url: OAUTH_AUTH_URL.to_string(),
        token_url: OAUTH_TOKEN_URL.to_string(),
        redirect_uri: OAUTH_REDIRECT_URI.to_string(),
        scopes: OAUTH_SCOPES.to_string(),
        callback_port: None,
    }
}

/// Provider for the token-streaming `claude` backend
pub struct ClaudeProvider {
    store: CredentialStore,
    tokens: TokenManager,
    oauth: OAuthClient,
}

impl ClaudeProvider {
    /// Create the provider and arm the refresh scheduler from persisted state
    #[must_use]
    pub fn new(store: CredentialStore) -> Self {
        let refresher = Arc::new(HttpTokenRefresher::new(OAUTH_TOKEN_URL, OAUTH_CLIENT_ID));
        let tokens = TokenManager::new(PROVIDER_NAME, store.clone(), refresher);
        tokens.start();
        Self {
            store,
            tokens,
            oauth: OAuthClient::new(oauth_config()),
        }
    }

    /// Credential file written by the CLI's own `/login`
    fn cli_auth_file() -> Option<std::path::PathBuf> {
        let path = dirs::home_dir()?.join(".claude/.credentials.json");
        path.is_file().then_some(path)
    }

    /// Auth-related environment, by precedence: ambient API key, stored API
    /// key, OAuth access token, CLI-delegated credential file
    async fn auth_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if std::env::var(API_KEY_ENV).is_ok() {
            return env;
        }
        if let Some(key) = self.store.load(API_KEY_ACCOUNT) {
            env.insert(API_KEY_ENV.to_string(), key);
            return env;
        }
        if let Some(access_token) = self.tokens.ensure_valid_token().await {
            env.insert(OAUTH_TOKEN_ENV.to_string(), access_token);
        }
        env
    }

    fn build_spec(
        &self,
        binary: std::path::PathBuf,
        options: &QueryOptions,
        auth_env: HashMap<String, String>,
    ) -> ProcessSpec {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--input-format".to_string(),
            "stream-json".to_string(),
            "--include-partial-messages".to_string(),
            "--verbose".to_string(),
        ];
        if let Some(model) = &options.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(mode) = &options.permission_mode {
            args.push("--permission-mode".to_string());
            args.push(mode.clone());
        }
        if !options.tool_servers.is_empty() {
            let mut servers = serde_json::Map::new();
            for server in &options.tool_servers {
                servers.insert(
                    server.name.clone(),
                    serde_json::json!({
                        "command": server.command,
                        "args": server.args,
                        "env": server.env,
                    }),
                );
            }
            args.push("--mcp-config".to_string());
            args.push(serde_json::json!({ "mcpServers": servers }).to_string());
        }

        let mut env = options.env.clone();
        env.extend(auth_env);

        ProcessSpec {
            program: binary,
            args,
            env,
            cwd: options.cwd.clone(),
        }
    }
}

#[async_trait]
impl Provider for ClaudeProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn check_ready(&self) -> Result<()> {
        resolve_binary(PROVIDER_NAME, BIN_OVERRIDE_ENV)?;
        Ok(())
    }

    async fn auth_status(&self) -> AuthStatus {
        let token_health = self.tokens.health();
        let reconnect_required = self.tokens.reconnect_required();

        if std::env::var(API_KEY_ENV).is_ok() {
            return AuthStatus {
                authenticated: true,
                method: AuthMethod::ApiKey,
                identity: None,
                error: None,
                storage_backend: None,
                token_health,
                next_refresh_at: None,
                reconnect_required,
            };
        }

        if let Some((_, backend)) = self.store.load_with_backend(API_KEY_ACCOUNT) {
            return AuthStatus {
                authenticated: true,
                method: AuthMethod::ApiKey,
                identity: None,
                error: None,
                storage_backend: Some(backend),
                token_health,
                next_refresh_at: None,
                reconnect_required,
            };
        }

        if let Some(tokens) = self.tokens.tokens() {
            let usable = !tokens.is_expired() && !reconnect_required;
            let backend = self
                .store
                .load_with_backend(OAUTH_ACCOUNT)
                .map(|(_, b)| b);
            return AuthStatus {
                authenticated: usable,
                method: AuthMethod::OAuth,
                identity: tokens.account_id,
                error: (!usable).then(|| "session expired; please log in again".to_string()),
                storage_backend: backend,
                token_health,
                next_refresh_at: self.tokens.next_refresh_at(),
                reconnect_required,
            };
        }

        if Self::cli_auth_file().is_some() {
            return AuthStatus {
                authenticated: true,
                method: AuthMethod::CliDelegated,
                identity: None,
                error: None,
                storage_backend: None,
                token_health,
                next_refresh_at: None,
                reconnect_required,
            };
        }

        AuthStatus::unauthenticated(None)
    }

    async fn login_with_api_key(&self, key: &str) -> Result<StorageBackend> {
        self.store.store(API_KEY_ACCOUNT, key)
    }

    async fn start_oauth_login(&self) -> Result<LoginStart> {
        // Manual-paste flow: the provider's redirect page shows the code
        Ok(self.oauth.start_login())
    }

    async fn complete_oauth_login(
        &self,
        login_id: &str,
        callback: Option<CallbackParams>,
    ) -> Result<AuthStatus> {
        let Some(params) = callback else {
            return Ok(AuthStatus::unauthenticated(Some(
                "authorization code required".to_string(),
            )));
        };

        match self
            .oauth
            .complete_login(login_id, &params.code, params.state.as_deref())
            .await
        {
            Ok(tokens) => {
                self.tokens.install(&tokens)?;
                Ok(self.auth_status().await)
            }
            Err(
                e @ (SessionError::StateMismatch
                | SessionError::LoginFlowExpired(_)
                | SessionError::TokenExchange(_)
                | SessionError::Auth(_)),
            ) => Ok(AuthStatus::unauthenticated(Some(e.to_string()))),
            Err(e) => Err(e),
        }
    }

    async fn query(&self, mut options: QueryOptions) -> Result<QueryRun> {
        let binary = resolve_binary(PROVIDER_NAME, BIN_OVERRIDE_ENV)?;
        let auth_env = self.auth_env().await;

        let cancel = options
            .cancellation_token
            .take()
            .unwrap_or_else(CancellationToken::new);
        let queue = Arc::new(TurnQueue::new());
        queue.push(TurnInput {
            text: options.prompt.clone(),
            attachments: Vec::new(),
        });
        let handle = RunHandle::new(Arc::clone(&queue), cancel.clone());
        let on_handle = options.on_handle.take();

        let spec = self.build_spec(binary, &options, auth_env);
        let transport = SubprocessTransport::new(spec, cancel.clone())?;

        if let Some(callback) = on_handle {
            callback(handle.clone());
        }

        let servers: Vec<ToolServerInfo> = options
            .tool_servers
            .iter()
            .map(|s| ToolServerInfo {
                name: s.name.clone(),
                enabled: s.enabled,
            })
            .collect();

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (summary_tx, summary_rx) = oneshot::channel();
        tokio::spawn(async move {
            let summary = run_session(transport, queue, handle, servers, cancel, &msg_tx).await;
            let _ = summary_tx.send(summary);
        });

        Ok(QueryRun::new(msg_rx, summary_rx))
    }

    async fn reset_auth(&self) -> Result<()> {
        self.store.delete(API_KEY_ACCOUNT)?;
        self.tokens.logout()
    }

    fn subscribe_reconnect(&self) -> broadcast::Receiver<ReconnectNotice> {
        self.tokens.subscribe()
    }

    async fn dispose(&self) {
        self.tokens.dispose();
    }
}

/// Session controls implemented as `control_request` lines on stdin
struct ClaudeControls {
    transport: Arc<tokio::sync::Mutex<SubprocessTransport>>,
    request_seq: AtomicU64,
    servers: std::sync::Mutex<Vec<ToolServerInfo>>,
}

impl ClaudeControls {
    async fn send(&self, request: serde_json::Value) -> Result<()> {
        let id = self.request_seq.fetch_add(1, Ordering::SeqCst);
        let payload = serde_json::json!({
            "type": "control_request",
            "request_id": format!("req_{id}"),
            "request": request,
        });
        let mut transport = self.transport.lock().await;
        transport.write(&format!("{payload}\n")).await
    }
}

#[async_trait]
impl SessionControls for ClaudeControls {
    async fn interrupt(&self) -> Result<()> {
        self.send(serde_json::json!({ "subtype": "interrupt" })).await
    }

    async fn set_model(&self, model: &str) -> Result<()> {
        self.send(serde_json::json!({ "subtype": "set_model", "model": model }))
            .await
    }

    async fn set_permission_mode(&self, mode: &str) -> Result<()> {
        self.send(serde_json::json!({ "subtype": "set_permission_mode", "mode": mode }))
            .await
    }

    async fn list_tool_servers(&self) -> Result<Vec<ToolServerInfo>> {
        Ok(self
            .servers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    async fn set_tool_server_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        {
            let mut servers = self.servers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(server) = servers.iter_mut().find(|s| s.name == name) {
                server.enabled = enabled;
            }
        }
        self.send(serde_json::json!({
            "subtype": "mcp_set_enabled",
            "server_name": name,
            "enabled": enabled,
        }))
        .await
    }
}

fn user_message(turn: &TurnInput) -> serde_json::Value {
    let mut content = vec![serde_json::json!({ "type": "text", "text": turn.text })];
    for path in &turn.attachments {
        content.push(serde_json::json!({
            "type": "text",
            "text": format!("[attachment] {path}"),
        }));
    }
    serde_json::json!({
        "type": "user",
        "message": { "role": "user", "content": content },
    })
}

/// The per-session loop: writer feeds turns, reader normalizes the stream
async fn run_session(
    mut transport: SubprocessTransport,
    queue: Arc<TurnQueue>,
    handle: RunHandle,
    servers: Vec<ToolServerInfo>,
    cancel: CancellationToken,
    tx: &mpsc::UnboundedSender<CanonicalMessage>,
) -> QuerySummary {
    let mut normalizer = StreamNormalizer::new();

    if let Err(e) = transport.connect().await {
        let _ = tx.send(CanonicalMessage::Error {
            message: e.to_string(),
        });
        return QuerySummary::default();
    }
    let mut event_rx = transport.read_messages();
    let transport = Arc::new(tokio::sync::Mutex::new(transport));

    handle.attach_controls(Arc::new(ClaudeControls {
        transport: Arc::clone(&transport),
        request_seq: AtomicU64::new(0),
        servers: std::sync::Mutex::new(servers),
    }));

    let writer = {
        let queue = Arc::clone(&queue);
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            while let Some(turn) = queue.next().await {
                let line = format!("{}\n", user_message(&turn));
                if transport.lock().await.write(&line).await.is_err() {
                    break;
                }
            }
            let _ = transport.lock().await.end_input().await;
        })
    };

    'stream: while let Some(item) = event_rx.recv().await {
        match item {
            Ok(value) => {
                // Control acknowledgements are plumbing, not agent activity
                if value.get("type").and_then(|v| v.as_str()) == Some("control_response") {
                    continue;
                }
                match serde_json::from_value::<NativeStreamMessage>(value) {
                    Ok(native) => {
                        for message in normalizer.handle(native) {
                            if tx.send(message).is_err() {
                                // Consumer is gone, stop draining the backend
                                break 'stream;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Ignoring unrecognized backend message");
                    }
                }
            }
            Err(e) => {
                if !cancel.is_cancelled() {
                    let _ = tx.send(CanonicalMessage::Error {
                        message: e.to_string(),
                    });
                }
                break;
            }
        }
    }

    // Stream ended: release the writer if it is parked on the queue
    queue.close();
    let _ = writer.await;
    let _ = transport.lock().await.close().await;
    normalizer.summary()
}
