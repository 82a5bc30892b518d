//! OAuth 2.0 login with PKCE
//!
//! A login is a two-step protocol: `start_login` generates a PKCE verifier
//! and a state nonce and returns the authorization URL; `complete_login`
//! validates the returned state, exchanges the code, and yields the token
//! set. Pending flows live only in memory and self-expire after a bounded
//! timeout, so an abandoned browser tab never leaks state.
//!
//! Retry policy: every completion failure (state mismatch, exchange failure)
//! preserves the pending flow so the user can retry, until the flow's own
//! timeout discards it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use super::token::{OAuthTokenSet, TokenErrorResponse, TokenResponse};
use crate::error::{Result, SessionError};

/// How long a pending login flow stays valid
pub const LOGIN_FLOW_TTL: Duration = Duration::from_secs(120);

/// OAuth endpoint configuration for one provider
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    /// OAuth client ID
    pub client_id: String,
    /// Authorization endpoint URL
    pub auth_url: String,
    /// Token endpoint URL
    pub token_url: String,
    /// Redirect URI for the code callback
    pub redirect_uri: String,
    /// Space-separated scopes to request
    pub scopes: String,
    /// Fixed loopback port for providers that require a local redirect target
    pub callback_port: Option<u16>,
}

/// PKCE code challenge data
#[derive(Debug, Clone)]
struct PkceChallenge {
    verifier: String,
    challenge: String,
}

impl PkceChallenge {
    /// Generate a verifier and its S256 challenge
    fn generate() -> Self {
        let verifier = random_urlsafe();

        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

        Self {
            verifier,
            challenge,
        }
    }
}

/// 43-character base64url string from hashed entropy sources
fn random_urlsafe() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos();

    let mut hasher = Sha256::new();
    hasher.update(timestamp.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(format!("{:?}", std::thread::current().id()).as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Result of starting a login flow
#[derive(Debug, Clone)]
pub struct LoginStart {
    /// Identifier to pass back to `complete_login`
    pub login_id: String,
    /// URL the user opens in a browser
    pub auth_url: String,
}

/// Code and state delivered by the loopback redirect
#[derive(Debug, Clone)]
pub struct CallbackParams {
    /// Authorization code
    pub code: String,
    /// State echoed by the authorization server
    pub state: Option<String>,
}

/// Ephemeral, in-memory state of one in-progress login
struct PendingFlow {
    verifier: String,
    state_nonce: String,
    redirect_uri: String,
    started_at: Instant,
    /// Present for loopback flows; resolves when the redirect arrives
    callback_rx: Option<oneshot::Receiver<CallbackParams>>,
}

impl PendingFlow {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.started_at.elapsed() >= ttl
    }
}

/// OAuth client for one provider
pub struct OAuthClient {
    config: OAuthConfig,
    http_client: reqwest::Client,
    flows: Arc<Mutex<HashMap<String, PendingFlow>>>,
    flow_ttl: Duration,
}

impl OAuthClient {
    /// Create a client for the given endpoint configuration
    #[must_use]
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            config,
            http_client: reqwest::Client::new(),
            flows: Arc::new(Mutex::new(HashMap::new())),
            flow_ttl: LOGIN_FLOW_TTL,
        }
    }

    /// Override the pending-flow timeout (used by tests)
    #[must_use]
    pub fn with_flow_ttl(mut self, ttl: Duration) -> Self {
        self.flow_ttl = ttl;
        self
    }

    /// The endpoint configuration
    #[must_use]
    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Start a manual-paste login flow
    ///
    /// Returns the authorization URL and a login identifier. The pending flow
    /// self-expires after [`LOGIN_FLOW_TTL`].
    pub fn start_login(&self) -> LoginStart {
        self.register_flow(None, &self.config.redirect_uri)
    }

    /// Start a loopback-redirect login flow
    ///
    /// Binds the listener on the configured fixed port and only builds the
    /// authorization URL once the bind has succeeded, so the external browser
    /// redirect can never race listener startup.
    ///
    /// # Errors
    ///
    /// Returns an error if the loopback port cannot be bound.
    pub async fn start_login_with_callback(&self) -> Result<LoginStart> {
        let port = self.config.callback_port.ok_or_else(|| {
            SessionError::invalid_config("provider has no loopback callback port configured")
        })?;

        let listener = TcpListener::bind(("127.0.0.1", port)).await.map_err(|e| {
            SessionError::auth(format!("could not bind loopback callback on port {port}: {e}"))
        })?;
        let bound_port = listener.local_addr()?.port();
        let redirect_uri = format!("http://127.0.0.1:{bound_port}/callback");

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            if let Err(e) = serve_one_callback(listener, tx).await {
                tracing::debug!(error = %e, "Loopback callback listener ended");
            }
        });

        Ok(self.register_flow(Some(rx), &redirect_uri))
    }

    fn register_flow(
        &self,
        callback_rx: Option<oneshot::Receiver<CallbackParams>>,
        redirect_uri: &str,
    ) -> LoginStart {
        let pkce = PkceChallenge::generate();
        let state_nonce = random_urlsafe();
        let login_id = format!("login_{}", &state_nonce[..16]);

        let auth_url = self.build_auth_url(&pkce.challenge, &state_nonce, redirect_uri);

        let flow = PendingFlow {
            verifier: pkce.verifier,
            state_nonce,
            redirect_uri: redirect_uri.to_string(),
            started_at: Instant::now(),
            callback_rx,
        };

        {
            let mut flows = lock_flows(&self.flows);
            let ttl = self.flow_ttl;
            flows.retain(|_, f| !f.is_expired(ttl));
            flows.insert(login_id.clone(), flow);
        }

        // Self-expiry: discard the flow after its TTL regardless of outcome.
        let flows = Arc::clone(&self.flows);
        let expire_id = login_id.clone();
        let ttl = self.flow_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if lock_flows(&flows).remove(&expire_id).is_some() {
                tracing::debug!(login_id = %expire_id, "Login flow expired");
            }
        });

        tracing::debug!(login_id = %login_id, "Login flow started");
        LoginStart {
            login_id,
            auth_url,
        }
    }

    /// Wait for the loopback redirect of a pending flow to deliver code+state
    ///
    /// # Errors
    ///
    /// Returns an error if the flow is unknown, was not started with a
    /// callback listener, or times out.
    pub async fn await_callback(&self, login_id: &str) -> Result<CallbackParams> {
        let rx = {
            let mut flows = lock_flows(&self.flows);
            let flow = flows
                .get_mut(login_id)
                .ok_or_else(|| SessionError::LoginFlowExpired(login_id.to_string()))?;
            flow.callback_rx.take().ok_or_else(|| {
                SessionError::invalid_config("login flow has no loopback listener")
            })?
        };

        match tokio::time::timeout(self.flow_ttl, rx).await {
            Ok(Ok(params)) => Ok(params),
            Ok(Err(_)) => Err(SessionError::auth("callback listener closed unexpectedly")),
            Err(_) => Err(SessionError::timeout("timed out waiting for OAuth callback")),
        }
    }

    /// Complete a pending login flow
    ///
    /// Validates the state nonce, exchanges the code for a token set, and
    /// derives the account identifier embedded in the access token. The flow
    /// is consumed on success; any failure leaves it pending until its TTL.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::StateMismatch`] on a missing or mismatched
    /// state nonce,
    /// [`SessionError::LoginFlowExpired`] for unknown/expired flows, and
    /// [`SessionError::TokenExchange`] when the server rejects the code.
    pub async fn complete_login(
        &self,
        login_id: &str,
        code: &str,
        state: Option<&str>,
    ) -> Result<OAuthTokenSet> {
        let (verifier, expected_state, redirect_uri) = {
            let mut flows = lock_flows(&self.flows);
            match flows.get(login_id) {
                Some(flow) if flow.is_expired(self.flow_ttl) => {
                    flows.remove(login_id);
                    return Err(SessionError::LoginFlowExpired(login_id.to_string()));
                }
                Some(flow) => (
                    flow.verifier.clone(),
                    flow.state_nonce.clone(),
                    flow.redirect_uri.clone(),
                ),
                None => return Err(SessionError::LoginFlowExpired(login_id.to_string())),
            }
        };

        // Every flow mints a nonce, so a callback that omits state is
        // treated the same as one that contradicts it.
        if state != Some(expected_state.as_str()) {
            tracing::warn!(login_id, "OAuth state missing or mismatched on callback");
            return Err(SessionError::StateMismatch);
        }

        let mut tokens = self.exchange_code(code, &verifier, &redirect_uri).await?;
        if tokens.account_id.is_none() {
            tokens.account_id = account_id_from_access_token(&tokens.access_token);
        }

        lock_flows(&self.flows).remove(login_id);
        tracing::info!(login_id, "OAuth login completed");
        Ok(tokens)
    }

    /// Number of flows currently pending (for tests and diagnostics)
    #[must_use]
    pub fn pending_flows(&self) -> usize {
        let ttl = self.flow_ttl;
        let mut flows = lock_flows(&self.flows);
        flows.retain(|_, f| !f.is_expired(ttl));
        flows.len()
    }

    fn build_auth_url(&self, code_challenge: &str, state: &str, redirect_uri: &str) -> String {
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("response_type", "code"),
            ("redirect_uri", redirect_uri),
            ("scope", self.config.scopes.as_str()),
            ("code_challenge", code_challenge),
            ("code_challenge_method", "S256"),
            ("state", state),
        ];

        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencode(v)))
            .collect::<Vec<_>>()
            .join("&");

        format!("{}?{query}", self.config.auth_url)
    }

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<OAuthTokenSet> {
        let body = serde_json::json!({
            "grant_type": "authorization_code",
            "code": code,
            "redirect_uri": redirect_uri,
            "client_id": self.config.client_id,
            "code_verifier": code_verifier,
        });

        let response = self
            .http_client
            .post(&self.config.token_url)
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
            SessionError::token_exchange(format!("invalid token response: {e}"))
        })?;

        use std::time::{SystemTime, UNIX_EPOCH};
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();

        Ok(OAuthTokenSet {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token.unwrap_or_default(),
            expires_at: now + parsed.expires_in.unwrap_or(3600),
            account_id: parsed.account_id,
        })
    }
}

fn lock_flows(
    flows: &Arc<Mutex<HashMap<String, PendingFlow>>>,
) -> std::sync::MutexGuard<'_, HashMap<String, PendingFlow>> {
    flows.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Accept a single loopback connection, parse the redirect query, respond
/// with a closing page, and resolve the flow's callback channel
async fn serve_one_callback(
    listener: TcpListener,
    tx: oneshot::Sender<CallbackParams>,
) -> Result<()> {
    let (mut socket, _) = listener.accept().await?;

    let mut buf = vec![0u8; 4096];
    let n = socket.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    let params = parse_callback_request(&request);
    let body = match &params {
        Some(_) => "<html><body>Login complete. You can close this window.</body></html>",
        None => "<html><body>Login failed: missing authorization code.</body></html>",
    };
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await.ok();

    if let Some(params) = params {
        let _ = tx.send(params);
    }
    Ok(())
}

/// Extract `code` and `state` from the request line of the redirect
fn parse_callback_request(request: &str) -> Option<CallbackParams> {
    let request_line = request.lines().next()?;
    let path = request_line.split_whitespace().nth(1)?;
    let query = path.split_once('?')?.1;

    let mut code = None;
    let mut state = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("code", v)) => code = Some(urldecode(v)),
            Some(("state", v)) => state = Some(urldecode(v)),
            _ => {}
        }
    }

    code.map(|code| CallbackParams { code, state })
}

/// Pull the account identifier out of a JWT-shaped access token payload
fn account_id_from_access_token(access_token: &str) -> Option<String> {
    let payload_b64 = access_token.split('.').nth(1)?;
    let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&payload).ok()?;

    for key in ["account_id", "chatgpt_account_id", "sub"] {
        if let Some(id) = claims.get(key).and_then(|v| v.as_str()) {
            return Some(id.to_string());
        }
    }
    // Some providers nest the account under an auth claims object
    claims
        .get("https://api.openai.com/auth")
        .and_then(|auth| auth.get("chatgpt_account_id"))
        .and_then(|v| v.as_str())
        .map(String::from)
}

/// URL-encode preserving unreserved characters per RFC 3986
fn urlencode(s: &str) -> String {
    use std::fmt::Write;
    let mut result = String::with_capacity(s.len() * 3);
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                write!(result, "%{byte:02X}").unwrap();
            }
        }
    }
    result
}

/// Minimal percent-decoding for callback query values
fn urldecode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                if let Ok(v) = u8::from_str_radix(hex, 16) {
                    out.push(v);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> OAuthConfig {
        OAuthConfig {
            client_id: "client_123".to_string(),
            auth_url: "https://auth.example.com/oauth/authorize".to_string(),
            token_url: "https://auth.example.com/oauth/token".to_string(),
            redirect_uri: "https://example.com/callback".to_string(),
            scopes: "openid profile".to_string(),
            callback_port: None,
        }
    }

    #[test]
    fn test_pkce_challenge_shape() {
        let pkce = PkceChallenge::generate();
        assert_eq!(pkce.verifier.len(), 43);
        assert_eq!(pkce.challenge.len(), 43);
        assert!(
            pkce.verifier
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[tokio::test]
    async fn test_start_login_builds_url_with_state_and_challenge() {
        let client = OAuthClient::new(test_config());
        let start = client.start_login();

        assert!(start.auth_url.starts_with("https://auth.example.com/oauth/authorize?"));
        assert!(start.auth_url.contains("code_challenge_method=S256"));
        assert!(start.auth_url.contains("state="));
        assert!(start.login_id.starts_with("login_"));
        assert_eq!(client.pending_flows(), 1);
    }

    #[tokio::test]
    async fn test_state_mismatch_hard_fails_and_preserves_flow() {
        let client = OAuthClient::new(test_config());
        let start = client.start_login();

        let err = client
            .complete_login(&start.login_id, "some_code", Some("wrong_state"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::StateMismatch));
        // Flow stays pending for retry until its own timeout
        assert_eq!(client.pending_flows(), 1);
    }

    #[tokio::test]
    async fn test_missing_state_hard_fails_without_code_exchange() {
        let client = OAuthClient::new(test_config());
        let start = client.start_login();

        // A redirect stripped of its state parameter must fail the nonce
        // check before any token request goes out.
        let err = client
            .complete_login(&start.login_id, "attacker_code", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::StateMismatch));
        assert_eq!(client.pending_flows(), 1);
    }

    #[tokio::test]
    async fn test_unknown_login_id_is_expired() {
        let client = OAuthClient::new(test_config());
        let err = client
            .complete_login("login_nope", "code", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::LoginFlowExpired(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_self_expires() {
        let client = OAuthClient::new(test_config()).with_flow_ttl(Duration::from_secs(2));
        let start = client.start_login();
        assert_eq!(client.pending_flows(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        let err = client
            .complete_login(&start.login_id, "code", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::LoginFlowExpired(_)));
        assert_eq!(client.pending_flows(), 0);
    }

    #[test]
    fn test_parse_callback_request() {
        let req = "GET /callback?code=abc%2B1&state=xyz HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n";
        let params = parse_callback_request(req).unwrap();
        assert_eq!(params.code, "abc+1");
        assert_eq!(params.state.as_deref(), Some("xyz"));
    }

    #[test]
    fn test_parse_callback_request_without_code() {
        let req = "GET /callback?error=access_denied HTTP/1.1\r\n\r\n";
        assert!(parse_callback_request(req).is_none());
    }

    #[test]
    fn test_account_id_from_jwt_payload() {
        let claims = serde_json::json!({ "sub": "user_42", "exp": 0 });
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
        let token = format!("hdr.{payload}.sig");
        assert_eq!(account_id_from_access_token(&token).as_deref(), Some("user_42"));
    }

    #[test]
    fn test_account_id_prefers_explicit_claim() {
        let claims = serde_json::json!({ "sub": "user_42", "account_id": "acct_7" });
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
        let token = format!("hdr.{payload}.sig");
        assert_eq!(account_id_from_access_token(&token).as_deref(), Some("acct_7"));
    }

    #[test]
    fn test_urlencode() {
        assert_eq!(urlencode("hello"), "hello");
        assert_eq!(urlencode("a b+c"), "a%20b%2Bc");
        assert_eq!(urlencode("openid profile"), "openid%20profile");
    }

    #[tokio::test]
    async fn test_loopback_listener_bound_before_url_returned() {
        let mut config = test_config();
        // Port 0 lets the OS choose; bind must succeed before the URL exists.
        config.callback_port = Some(0);
        let client = OAuthClient::new(config);
        let start = client.start_login_with_callback().await.unwrap();
        assert!(start.auth_url.contains("redirect_uri=http%3A%2F%2F127.0.0.1%3A"));
    }
}
