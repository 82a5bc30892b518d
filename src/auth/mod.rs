//! Credential lifecycle: OAuth PKCE login and token refresh scheduling
//!
//! Split into two halves the way the rest of the crate consumes them:
//!
//! - [`oauth`] runs the interactive two-step login protocol (authorization
//!   URL out, code exchange in), including the loopback-redirect variant.
//! - [`token`] owns everything after login: persisted token sets, proactive
//!   background refresh, and reconnect-required signaling.

pub mod oauth;
pub mod token;

pub use oauth::{CallbackParams, LOGIN_FLOW_TTL, LoginStart, OAuthClient, OAuthConfig};
pub use token::{
    DEFAULT_LEAD_TIME, HttpTokenRefresher, OAuthTokenSet, ReconnectNotice, TokenHealth,
    TokenManager, TokenRefresher,
};
