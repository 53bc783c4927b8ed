//! Age identity discovery chain

use std::path::{Path, PathBuf};

use gitcrypt_core::config::{expand_tilde, IdentityConfig};
use gitcrypt_core::{GitCryptError, GitCryptResult};
use secrecy::SecretString;

pub const IDENTITY_FILE_ENV: &str = "GITCRYPT_AGE_IDENTITY_FILE";
pub const IDENTITY_ENV: &str = "GITCRYPT_AGE_IDENTITY";

/// A loaded age identity file (private keys)
pub struct IdentityProvider {
    pub key_data: SecretString,
    pub source: String,
}

impl std::fmt::Debug for IdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityProvider")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// The places an identity may come from, resolved up front so the chain can
/// be exercised without touching the process environment.
#[derive(Debug, Default)]
pub struct IdentitySearch {
    pub file_env: Option<PathBuf>,
    pub literal_env: Option<SecretString>,
    pub config_path: Option<PathBuf>,
    pub default_path: Option<PathBuf>,
}

impl IdentitySearch {
    pub fn from_env(config: &IdentityConfig) -> Self {
        Self {
            file_env: std::env::var_os(IDENTITY_FILE_ENV).map(PathBuf::from),
            literal_env: std::env::var(IDENTITY_ENV)
                .ok()
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
            config_path: config.age_identity.as_deref().map(expand_tilde),
            default_path: default_identity_path(),
        }
    }

    /// Walk the chain:
    ///   1. $GITCRYPT_AGE_IDENTITY_FILE  (explicit path env var)
    ///   2. $GITCRYPT_AGE_IDENTITY  (literal identity, may be multi-line)
    ///   3. config.age_identity path (from git-crypt.toml)
    ///   4. ~/.config/git-crypt/identity.txt
    pub fn find(self) -> GitCryptResult<IdentityProvider> {
        if let Some(path) = &self.file_env {
            if path.exists() {
                return read_identity(path, IDENTITY_FILE_ENV);
            }
            tracing::warn!(path = %path.display(), "{IDENTITY_FILE_ENV} points at a missing file");
        }

        if let Some(key_data) = self.literal_env {
            return Ok(IdentityProvider {
                key_data,
                source: format!("{IDENTITY_ENV} (env)"),
            });
        }

        if let Some(path) = &self.config_path {
            if path.exists() {
                return read_identity(path, "config");
            }
        }

        if let Some(path) = &self.default_path {
            if path.exists() {
                return read_identity(path, "default");
            }
        }

        Err(GitCryptError::KeyNotFound(format!(
            "no age identity found. Tried: ${IDENTITY_FILE_ENV}, ${IDENTITY_ENV}, \
             config path, and {}",
            self.default_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "~/.config/git-crypt/identity.txt".into())
        )))
    }
}

/// Discover and load the age identity for the current process.
pub fn find_age_identity(config: &IdentityConfig) -> GitCryptResult<IdentityProvider> {
    let provider = IdentitySearch::from_env(config).find()?;
    tracing::debug!(source = %provider.source, "found age identity");
    Ok(provider)
}

fn read_identity(path: &Path, label: &str) -> GitCryptResult<IdentityProvider> {
    let key_data = std::fs::read_to_string(path).map_err(|e| {
        GitCryptError::Config(format!("reading age identity {}: {e}", path.display()))
    })?;
    Ok(IdentityProvider {
        key_data: SecretString::from(key_data),
        source: format!("{label}:{}", path.display()),
    })
}

fn default_identity_path() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .map(|home| home.join(".config/git-crypt/identity.txt"))
}
