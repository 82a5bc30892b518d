//! # Provider Session Layer
//!
//! Drives two structurally different agent backends (a turn-based SDK
//! process and a token-streaming CLI process) through one uniform
//! interface, while managing per-provider credential lifecycles (API keys,
//! OAuth with PKCE, refreshable tokens, CLI-delegated auth) and normalizing
//! each backend's event stream into one canonical wire protocol.
//!
//! ## Quick Start
//!
//! ```no_run
//! use provider_session::{ProviderRegistry, QueryOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = ProviderRegistry::new("my-app");
//!     let provider = registry.get("claude").await?;
//!
//!     let options = QueryOptions::builder()
//!         .prompt("Summarize the open TODOs in this project")
//!         .model("claude-sonnet-4-5")
//!         .on_handle(Box::new(|handle| {
//!             // Inject follow-up turns or abort while streaming
//!             handle.inject("Also check the tests", Vec::new());
//!         }))
//!         .build();
//!
//!     let mut run = provider.query(options).await?;
//!     while let Some(message) = run.next_message().await {
//!         println!("{message:?}");
//!     }
//!     let summary = run.finish().await?;
//!     println!("final: {:?}", summary.result_text);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`]: the canonical message schema, the only shape crossing
//!   the provider boundary
//! - [`normalize`]: per-backend event translation onto that schema
//! - [`session`]: the live run handle and turn-injection channel
//! - [`credentials`]: secret persistence, OS keychain with file fallback
//! - [`auth`]: OAuth PKCE login and background token refresh
//! - [`runtime`]: backend binary resolution under a restricted PATH
//! - [`transport`]: JSON-lines subprocess plumbing
//! - [`provider`]: the `Provider` contract, both backends, and the registry
//!
//! ## Logging
//!
//! This crate uses [`tracing`](https://crates.io/crates/tracing) for
//! structured logging. Attach a subscriber in your application to see logs:
//!
//! ```rust,ignore
//! tracing_subscriber::fmt::init();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod credentials;
pub mod error;
pub mod normalize;
pub mod protocol;
pub mod provider;
pub mod runtime;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use auth::{
    CallbackParams, LoginStart, OAuthClient, OAuthConfig, OAuthTokenSet, ReconnectNotice,
    TokenHealth, TokenManager,
};
pub use credentials::{CredentialStore, StorageBackend};
pub use error::{Result, SessionError};
pub use protocol::{
    CanonicalMessage, ContentBlock, Delta, QuerySummary, ResultSubtype, StreamEvent, Usage,
};
pub use provider::{
    AuthMethod, AuthStatus, ClaudeProvider, CodexProvider, Provider, ProviderRegistry,
    QueryOptions, QueryRun, ToolServerConfig,
};
pub use session::{RunHandle, SessionControls, ToolServerInfo, TurnInput, TurnQueue};
pub use transport::{ProcessSpec, SubprocessTransport, Transport};

/// Version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
