//! Backend binary resolution
//!
//! The host process (a packaged desktop app) often runs with a restricted
//! PATH, so subprocess-backed SDKs cannot rely on shell lookup alone. Order
//! of precedence: explicit environment override, PATH lookup, then the
//! well-known install locations for each packaging ecosystem.

use std::env;
use std::path::PathBuf;

use crate::error::{Result, SessionError};

/// Locate a backend executable by name
///
/// `env_override` names an environment variable that, when set, wins over
/// all lookup (e.g. `CODEX_BIN`, `CLAUDE_BIN`).
///
/// # Errors
///
/// Returns [`SessionError::BinaryNotFound`] when nothing usable is found.
pub fn resolve_binary(name: &str, env_override: &str) -> Result<PathBuf> {
    if let Ok(path) = env::var(env_override) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
        tracing::warn!(%env_override, path = %path.display(), "Environment override does not point at a file");
    }

    if let Ok(path) = which::which(name) {
        return Ok(path);
    }

    for path in known_locations(name) {
        if path.is_file() {
            tracing::debug!(binary = name, path = %path.display(), "Resolved from known install location");
            return Ok(path);
        }
    }

    Err(SessionError::binary_not_found(name))
}

/// Well-known install locations across npm, homebrew, and user-local setups
fn known_locations(name: &str) -> Vec<PathBuf> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
    vec![
        home.join(".npm-global/bin").join(name),
        home.join(".local/bin").join(name),
        home.join("node_modules/.bin").join(name),
        home.join(".yarn/bin").join(name),
        PathBuf::from("/usr/local/bin").join(name),
        PathBuf::from("/opt/homebrew/bin").join(name),
    ]
}
