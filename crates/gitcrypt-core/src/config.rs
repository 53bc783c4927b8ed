use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{GitCryptError, GitCryptResult};

/// Top-level configuration (loaded from git-crypt.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GitCryptConfig {
    pub repo: RepoConfig,
    pub crypto: CryptoConfig,
    pub identity: IdentityConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Private state directory; unwrapped key files live in `<state_dir>/keys/`
    pub state_dir: PathBuf,
    /// Committed directory holding per-collaborator wrapped keys
    pub keys_dir: PathBuf,
}

/// File codec tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Plaintext bytes buffered in memory before spilling to a scratch file
    pub spill_threshold_bytes: usize,
    /// Read size for streaming encrypt/decrypt
    pub io_buffer_size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// age identity file (default: ~/.config/git-crypt/identity.txt)
    pub age_identity: Option<PathBuf>,
    /// Wrap keys for recipients without any trust check
    pub trust_recipients: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".git/git-crypt"),
            keys_dir: PathBuf::from(".git-crypt"),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            spill_threshold_bytes: 8 * 1024 * 1024,
            io_buffer_size: 1024,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl GitCryptConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> GitCryptResult<Self> {
        if !path.exists() {
            tracing::debug!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|e| GitCryptError::Config(format!("parsing {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> GitCryptResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| GitCryptError::Config(e.to_string()))?;
        if config.crypto.io_buffer_size == 0 {
            return Err(GitCryptError::Config(
                "crypto.io_buffer_size must be non-zero".into(),
            ));
        }
        Ok(config)
    }

    /// Directory holding local (unwrapped) key files.
    pub fn internal_keys_dir(&self) -> PathBuf {
        expand_tilde(&self.repo.state_dir).join("keys")
    }
}

/// Expand `~` in path to the user's home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(rest)
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[repo]
state_dir = "/tmp/repo/.git/git-crypt"
keys_dir = "/tmp/repo/.git-crypt"

[crypto]
spill_threshold_bytes = 4096
io_buffer_size = 65536

[identity]
age_identity = "/home/user/.age/key.txt"
trust_recipients = true

[log]
level = "debug"
format = "json"
"#;
        let config = GitCryptConfig::from_toml(toml_str).unwrap();

        assert_eq!(config.repo.state_dir, PathBuf::from("/tmp/repo/.git/git-crypt"));
        assert_eq!(config.crypto.spill_threshold_bytes, 4096);
        assert_eq!(config.crypto.io_buffer_size, 65536);
        assert_eq!(
            config.identity.age_identity,
            Some(PathBuf::from("/home/user/.age/key.txt"))
        );
        assert!(config.identity.trust_recipients);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.format, "json");
        assert_eq!(
            config.internal_keys_dir(),
            PathBuf::from("/tmp/repo/.git/git-crypt/keys")
        );
    }

    #[test]
    fn test_parse_defaults() {
        let config = GitCryptConfig::from_toml("").unwrap();

        assert_eq!(config.repo.state_dir, PathBuf::from(".git/git-crypt"));
        assert_eq!(config.repo.keys_dir, PathBuf::from(".git-crypt"));
        assert_eq!(config.crypto.spill_threshold_bytes, 8 * 1024 * 1024);
        assert_eq!(config.crypto.io_buffer_size, 1024);
        assert!(config.identity.age_identity.is_none());
        assert!(!config.identity.trust_recipients);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[crypto]
spill_threshold_bytes = 1
"#;
        let config = GitCryptConfig::from_toml(toml_str).unwrap();

        // Overridden
        assert_eq!(config.crypto.spill_threshold_bytes, 1);
        // Defaults
        assert_eq!(config.crypto.io_buffer_size, 1024);
        assert_eq!(config.log.format, "text");
    }

    #[test]
    fn test_zero_io_buffer_rejected() {
        let result = GitCryptConfig::from_toml("[crypto]\nio_buffer_size = 0\n");
        assert!(matches!(result, Err(GitCryptError::Config(_))));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GitCryptConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.repo.keys_dir, PathBuf::from(".git-crypt"));
    }

    #[test]
    fn test_load_unparsable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("git-crypt.toml");
        std::fs::write(&path, "[repo\nstate_dir = ").unwrap();
        assert!(matches!(
            GitCryptConfig::load(&path),
            Err(GitCryptError::Config(_))
        ));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = GitCryptConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed = GitCryptConfig::from_toml(&toml_str).unwrap();

        assert_eq!(config.repo.state_dir, parsed.repo.state_dir);
        assert_eq!(
            config.crypto.spill_threshold_bytes,
            parsed.crypto.spill_threshold_bytes
        );
    }
}
