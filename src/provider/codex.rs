//! Turn-based backend provider
//!
//! Drives the `codex` CLI in its JSON-lines protocol mode. The CLI's native
//! contract is one finished turn per request, so the session loop pulls
//! injected turns from the [`TurnQueue`] and feeds them to the subprocess
//! one at a time, normalizing thread events into canonical messages as each
//! turn streams back.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::auth::oauth::{CallbackParams, LoginStart, OAuthClient, OAuthConfig};
use crate::auth::token::{HttpTokenRefresher, ReconnectNotice, TokenManager};
use crate::credentials::{CredentialStore, StorageBackend};
use crate::error::{Result, SessionError};
use crate::normalize::turn::{ThreadEvent, TurnNormalizer};
use crate::protocol::{CanonicalMessage, QuerySummary};
use crate::runtime::resolve_binary;
use crate::session::{RunHandle, SessionControls, ToolServerInfo, TurnInput, TurnQueue};
use crate::transport::{ProcessSpec, SubprocessTransport, Transport};

use super::{AuthMethod, AuthStatus, Provider, QueryOptions, QueryRun};

const PROVIDER_NAME: &str = "codex";
const API_KEY_ACCOUNT: &str = "codex/api_key";
const OAUTH_ACCOUNT: &str = "codex/oauth";
const API_KEY_ENV: &str = "OPENAI_API_KEY";
const BIN_OVERRIDE_ENV: &str = "CODEX_BIN";

const OAUTH_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
const OAUTH_AUTH_URL: &str = "https://auth.openai.com/oauth/authorize";
const OAUTH_TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
const OAUTH_CALLBACK_PORT: u16 = 1455;
const OAUTH_SCOPES: &str = "openid profile email offline_access";

fn oauth_config() -> OAuthConfig {
    OAuthConfig {
        client_id: OAUTH_CLIENT_ID.to_string(),
        auth_url: OAUTH_AUTH_URL.to_string(),
        token_url: OAUTH_TOKEN_URL.to_string(),
        redirect_uri: format!("http://127.0.0.1:{OAUTH_CALLBACK_PORT}/callback"),
        scopes: OAUTH_SCOPES.to_string(),
        callback_port: Some(OAUTH_CALLBACK_PORT),
    }
}

/// Provider for the turn-based `codex` backend
pub struct CodexProvider {
    store: CredentialStore,
    tokens: TokenManager,
    oauth: OAuthClient,
}

impl CodexProvider {
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

    /// CLI-native auth file written by `codex login`
    fn cli_auth_file() -> Option<std::path::PathBuf> {
        let path = dirs::home_dir()?.join(".codex/auth.json");
        path.is_file().then_some(path)
    }

    /// Auth-related environment for the subprocess, by precedence:
    /// ambient API key, stored API key, OAuth access token, CLI-delegated
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
            env.insert("CODEX_ACCESS_TOKEN".to_string(), access_token);
            if let Some(account_id) = self.tokens.tokens().and_then(|t| t.account_id) {
                env.insert("CODEX_ACCOUNT_ID".to_string(), account_id);
            }
        }
        // Otherwise fall through to the CLI's own credential file, if any
        env
    }

    fn build_spec(
        &self,
        binary: std::path::PathBuf,
        options: &QueryOptions,
        auth_env: HashMap<String, String>,
    ) -> ProcessSpec {
        let mut args = vec!["proto".to_string()];
        if let Some(model) = &options.model {
            args.push("-c".to_string());
            args.push(format!("model={model}"));
        }
        if let Some(effort) = &options.reasoning_effort {
            args.push("-c".to_string());
            args.push(format!("model_reasoning_effort={effort}"));
        }
        if let Some(mode) = &options.permission_mode {
            args.push("-c".to_string());
            args.push(format!("approval_policy={mode}"));
        }
        for server in &options.tool_servers {
            args.push("-c".to_string());
            args.push(format!("mcp_servers.{}.command={}", server.name, server.command));
            if !server.args.is_empty() {
                args.push("-c".to_string());
                args.push(format!(
                    "mcp_servers.{}.args={}",
                    server.name,
                    serde_json::to_string(&server.args).unwrap_or_default()
                ));
            }
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
impl Provider for CodexProvider {
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
        self.oauth.start_login_with_callback().await
    }

    async fn complete_oauth_login(
        &self,
        login_id: &str,
        callback: Option<CallbackParams>,
    ) -> Result<AuthStatus> {
        let params = match callback {
            Some(params) => params,
            None => match self.oauth.await_callback(login_id).await {
                Ok(params) => params,
                Err(e) => return Ok(AuthStatus::unauthenticated(Some(e.to_string()))),
            },
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
        // Seed the first turn before the backend exists so it can never be
        // raced against startup.
        queue.push(TurnInput {
            text: options.prompt.clone(),
            attachments: Vec::new(),
        });
        let handle = RunHandle::new(Arc::clone(&queue), cancel.clone());
        let on_handle = options.on_handle.take();

        let spec = self.build_spec(binary, &options, auth_env);
        let transport = SubprocessTransport::new(spec, cancel.clone())?;

        // The handle goes out before any backend work starts
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
        let model = options.model.clone();
        tokio::spawn(async move {
            let summary =
                run_session(transport, queue, handle, servers, model, cancel, &msg_tx).await;
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

/// Session controls backed by protocol writes on the shared transport
struct CodexControls {
    transport: Arc<tokio::sync::Mutex<SubprocessTransport>>,
    servers: std::sync::Mutex<Vec<ToolServerInfo>>,
}

impl CodexControls {
    async fn send(&self, payload: serde_json::Value) -> Result<()> {
        let mut transport = self.transport.lock().await;
        transport.write(&format!("{payload}\n")).await
    }
}

#[async_trait]
impl SessionControls for CodexControls {
    async fn interrupt(&self) -> Result<()> {
        self.send(serde_json::json!({ "type": "turn.interrupt" })).await
    }

    async fn set_model(&self, model: &str) -> Result<()> {
        self.send(serde_json::json!({ "type": "session.configure", "model": model }))
            .await
    }

    async fn set_permission_mode(&self, mode: &str) -> Result<()> {
        self.send(serde_json::json!({ "type": "session.configure", "approval_policy": mode }))
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
            "type": "tool_server.set_enabled",
            "name": name,
            "enabled": enabled,
        }))
        .await
    }
}

/// The per-session loop: feed one queued turn at a time, stream its events
async fn run_session(
    mut transport: SubprocessTransport,
    queue: Arc<TurnQueue>,
    handle: RunHandle,
    servers: Vec<ToolServerInfo>,
    model: Option<String>,
    cancel: CancellationToken,
    tx: &mpsc::UnboundedSender<CanonicalMessage>,
) -> QuerySummary {
    let mut normalizer = TurnNormalizer::new(model);

    if let Err(e) = transport.connect().await {
        let _ = tx.send(CanonicalMessage::Error {
            message: e.to_string(),
        });
        return QuerySummary::default();
    }
    let mut event_rx = transport.read_messages();
    let transport = Arc::new(tokio::sync::Mutex::new(transport));

    handle.attach_controls(Arc::new(CodexControls {
        transport: Arc::clone(&transport),
        servers: std::sync::Mutex::new(servers),
    }));

    'turns: loop {
        let Some(turn) = queue.next().await else {
            break;
        };

        let request = serde_json::json!({
            "type": "turn.run",
            "text": turn.text,
            "attachments": turn.attachments,
        });
        if let Err(e) = transport.lock().await.write(&format!("{request}\n")).await {
            if !cancel.is_cancelled() {
                let _ = tx.send(CanonicalMessage::Error {
                    message: e.to_string(),
                });
            }
            break;
        }

        // Drain this turn's events up to its terminal result
        loop {
            let Some(item) = event_rx.recv().await else {
                break 'turns;
            };
            match item {
                Ok(value) => match serde_json::from_value::<ThreadEvent>(value) {
                    Ok(event) => {
                        let mut turn_done = false;
                        for message in normalizer.handle(event) {
                            turn_done |= message.is_turn_result();
                            if tx.send(message).is_err() {
                                break 'turns;
                            }
                        }
                        if turn_done {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Ignoring unrecognized backend event");
                    }
                },
                Err(e) => {
                    // Aborted streams end quietly, not as errors
                    if !cancel.is_cancelled() {
                        let _ = tx.send(CanonicalMessage::Error {
                            message: e.to_string(),
                        });
                    }
                    break 'turns;
                }
            }
        }
    }

    let _ = transport.lock().await.close().await;
    QuerySummary {
        result_text: normalizer.last_agent_message().map(String::from),
        session_id: normalizer.thread_id().map(String::from),
        usage: normalizer.usage().clone(),
        total_cost_usd: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn provider(dir: &TempDir) -> CodexProvider {
        CodexProvider::new(CredentialStore::with_fallback_dir(
            "\0",
            dir.path().to_path_buf(),
        ))
    }

    #[tokio::test]
    async fn test_stored_api_key_authenticates() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir);
        p.login_with_api_key("sk-test-123").await.unwrap();

        let status = p.auth_status().await;
        assert!(status.authenticated);
        assert_eq!(status.method, AuthMethod::ApiKey);
        assert_eq!(status.storage_backend, Some(StorageBackend::File));
    }

    #[tokio::test]
    async fn test_reset_auth_clears_credentials() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir);
        p.login_with_api_key("sk-test-123").await.unwrap();
        p.reset_auth().await.unwrap();

        let status = p.auth_status().await;
        assert!(!status.authenticated || status.method == AuthMethod::CliDelegated);
        assert!(dir.path().read_dir().unwrap().next().is_none() || p.store.load(API_KEY_ACCOUNT).is_none());
    }

    #[tokio::test]
    async fn test_state_mismatch_reported_in_status_not_thrown() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir);
        let start = p.oauth.start_login();

        let status = p
            .complete_oauth_login(
                &start.login_id,
                Some(CallbackParams {
                    code: "some_code".to_string(),
                    state: Some("wrong_state".to_string()),
                }),
            )
            .await
            .unwrap();

        assert!(!status.authenticated);
        assert!(status.error.unwrap().contains("state mismatch"));
        // No credential was written
        assert!(p.store.load(OAUTH_ACCOUNT).is_none());
    }

    #[test]
    fn test_build_spec_carries_model_and_permission_config() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir);
        let options = QueryOptions::builder()
            .prompt("hi")
            .model("gpt-5-codex")
            .permission_mode("never")
            .build();
        let spec = p.build_spec(std::path::PathBuf::from("/usr/bin/codex"), &options, HashMap::new());

        assert_eq!(spec.args[0], "proto");
        assert!(spec.args.contains(&"model=gpt-5-codex".to_string()));
        assert!(spec.args.contains(&"approval_policy=never".to_string()));
    }
}
