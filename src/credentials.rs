//! Secret persistence with OS keychain and file fallback
//!
//! Secrets (API keys, serialized OAuth token sets) are written to the OS-native
//! secret store first. On any keychain failure (unsupported platform, locked
//! store, permission error) the store falls back transparently to a file under
//! a private application directory with owner-only permissions. A keychain
//! failure is never surfaced to the caller if the file fallback succeeds.
//!
//! No other component persists secrets directly.

use std::path::PathBuf;

use crate::error::{Result, SessionError};

/// Which storage mechanism actually holds a secret
///
/// Exposed so callers (and tests) can assert which path was used and the UI
/// can display storage provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// OS-native secret store
    Keychain,
    /// Owner-only file under the application config directory
    File,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Keychain => write!(f, "system keychain"),
            StorageBackend::File => write!(f, "local file"),
        }
    }
}

/// Key/value secret store keyed by provider+account
#[derive(Debug, Clone)]
pub struct CredentialStore {
    service: String,
    fallback_dir: PathBuf,
}

impl CredentialStore {
    /// Create a store for the given service name, with the file fallback under
    /// the platform config directory
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        let service = service.into();
        let fallback_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(&service)
            .join("credentials");
        Self {
            service,
            fallback_dir,
        }
    }

    /// Create a store with a custom fallback directory (used by tests)
    #[must_use]
    pub fn with_fallback_dir(service: impl Into<String>, dir: PathBuf) -> Self {
        Self {
            service: service.into(),
            fallback_dir: dir,
        }
    }

    fn fallback_path(&self, account: &str) -> PathBuf {
        // Account keys are provider-internal ("codex/oauth", "claude/api_key");
        // flatten the separator so each credential lands in one file.
        self.fallback_dir.join(format!(
            "{}.cred",
            account.replace(['/', '\\', ':'], "_")
        ))
    }

    /// Persist a secret, returning the backend that actually stored it
    ///
    /// # Errors
    ///
    /// Only errors when both the keychain write and the file fallback fail.
    pub fn store(&self, account: &str, secret: &str) -> Result<StorageBackend> {
        let keychain_err = match self.keychain_entry(account) {
            Ok(entry) => match entry.set_password(secret) {
                Ok(()) => {
                    tracing::debug!(account, "Credential stored in system keychain");
                    return Ok(StorageBackend::Keychain);
                }
                Err(e) => e.to_string(),
            },
            Err(e) => e.to_string(),
        };

        tracing::debug!(account, error = %keychain_err, "Keychain write failed, using file fallback");
        match self.write_fallback(account, secret) {
            Ok(()) => Ok(StorageBackend::File),
            Err(file_err) => Err(SessionError::CredentialStorage {
                keychain: keychain_err,
                file: file_err.to_string(),
            }),
        }
    }

    /// Load a secret, trying the keychain first then the file fallback
    ///
    /// Returns `None` when no secret is stored under this account.
    #[must_use]
    pub fn load(&self, account: &str) -> Option<String> {
        self.load_with_backend(account).map(|(secret, _)| secret)
    }

    /// Load a secret along with the backend it was read from
    #[must_use]
    pub fn load_with_backend(&self, account: &str) -> Option<(String, StorageBackend)> {
        if let Ok(entry) = self.keychain_entry(account) {
            match entry.get_password() {
                Ok(secret) => return Some((secret, StorageBackend::Keychain)),
                Err(keyring::Error::NoEntry) => {}
                Err(e) => {
                    tracing::debug!(account, error = %e, "Keychain read failed, trying file fallback");
                }
            }
        }

        let path = self.fallback_path(account);
        match std::fs::read_to_string(&path) {
            Ok(secret) => Some((secret, StorageBackend::File)),
            Err(_) => None,
        }
    }

    /// Delete a secret from both backends
    ///
    /// # Errors
    ///
    /// Returns an error only if the fallback file exists but cannot be removed.
    pub fn delete(&self, account: &str) -> Result<()> {
        if let Ok(entry) = self.keychain_entry(account) {
            match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(e) => tracing::debug!(account, error = %e, "Keychain delete failed"),
            }
        }

        let path = self.fallback_path(account);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn keychain_entry(&self, account: &str) -> keyring::Result<keyring::Entry> {
        keyring::Entry::new(&self.service, account)
    }

    fn write_fallback(&self, account: &str, secret: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.fallback_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            std::fs::set_permissions(&self.fallback_dir, perms)?;
        }

        let path = self.fallback_path(account);
        std::fs::write(&path, secret)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }

        Ok(())
    }
}
