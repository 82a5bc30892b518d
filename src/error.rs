//! Error types for the provider session layer

use thiserror::Error;

/// Main error type for the provider session layer
#[derive(Error, Debug)]
pub enum SessionError {
    /// Backend binary (CLI/SDK runtime) not found or not installed
    #[error("Backend binary not found: {0}")]
    BinaryNotFound(String),

    /// Unknown provider name requested from the registry
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// Authentication error (invalid credential, exchange failure)
    #[error("Authentication error: {0}")]
    Auth(String),

    /// OAuth callback state did not match the stored nonce
    #[error("state mismatch - possible CSRF; login flow aborted")]
    StateMismatch,

    /// OAuth login flow expired or was never started
    #[error("Login flow {0} not found or expired")]
    LoginFlowExpired(String),

    /// Token exchange or refresh rejected by the authorization server
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    /// Transport layer error (pipe closed, write failure)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Process execution error with exit code and stderr
    #[error("Process error (exit code {exit_code}): {message}")]
    Process {
        /// Error message
        message: String,
        /// Process exit code
        exit_code: i32,
        /// Standard error output
        stderr: Option<String>,
    },

    /// Secret storage failed in both the OS keychain and the file fallback
    #[error("Credential storage failed: keychain: {keychain}; file: {file}")]
    CredentialStorage {
        /// Keychain-side failure
        keychain: String,
        /// File-fallback failure
        file: String,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Session or channel was closed
    #[error("Session closed: {0}")]
    Closed(String),

    /// Invalid configuration passed by the application layer
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for provider session operations
pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a process error
    pub fn process(msg: impl Into<String>, exit_code: i32, stderr: Option<String>) -> Self {
        Self::Process {
            message: msg.into(),
            exit_code,
            stderr,
        }
    }

    /// Create a token exchange error
    pub fn token_exchange(msg: impl Into<String>) -> Self {
        Self::TokenExchange(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a closed-session error
    pub fn closed(msg: impl Into<String>) -> Self {
        Self::Closed(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a binary-not-found error with install guidance
    #[must_use]
    pub fn binary_not_found(name: &str) -> Self {
        Self::BinaryNotFound(format!(
            "{name} not found on PATH or in known install locations. \
             Install it or point the corresponding *_BIN environment variable at it."
        ))
    }

    /// True for errors that mean stored credentials are no longer usable
    /// and the user must re-run the interactive login flow
    #[must_use]
    pub fn is_reconnect_required(&self) -> bool {
        matches!(self, Self::TokenExchange(_) | Self::Auth(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mismatch_message() {
        let err = SessionError::StateMismatch;
        assert!(err.to_string().contains("state mismatch"));
        assert!(err.to_string().contains("CSRF"));
    }

    #[test]
    fn test_reconnect_required_classification() {
        assert!(SessionError::token_exchange("invalid_grant").is_reconnect_required());
        assert!(SessionError::auth("revoked").is_reconnect_required());
        assert!(!SessionError::transport("pipe closed").is_reconnect_required());
    }
}
