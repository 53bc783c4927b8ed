use thiserror::Error;

pub type GitCryptResult<T> = Result<T, GitCryptError>;

#[derive(Debug, Error)]
pub enum GitCryptError {
    /// Structurally invalid serialized data: bad magic, truncated field,
    /// invalid key name, trailing bytes after a legacy key.
    #[error("malformed data: {0}")]
    Malformed(String),

    /// Well-formed data written by a newer format, or an unknown critical field.
    #[error("incompatible format: {0} (you may need to upgrade git-crypt)")]
    Incompatible(String),

    #[error("input is not encrypted")]
    NotEncrypted,

    #[error("file has been tampered with")]
    Tampered,

    #[error("input too large to encrypt securely")]
    CapacityExceeded,

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("invalid key name {name:?}: {reason}")]
    InvalidKeyName { name: String, reason: &'static str },

    /// Failure of something outside the crypto logic: the age wrap service,
    /// the secure random source.
    #[error("external failure ({service}): {message}")]
    External {
        service: &'static str,
        message: String,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GitCryptError {
    pub fn external(service: &'static str, message: impl std::fmt::Display) -> Self {
        Self::External {
            service,
            message: message.to_string(),
        }
    }

    /// Short label for structured log fields.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::Incompatible(_) => "incompatible",
            Self::NotEncrypted => "not_encrypted",
            Self::Tampered => "tampered",
            Self::CapacityExceeded => "capacity_exceeded",
            Self::KeyNotFound(_) => "key_not_found",
            Self::InvalidKeyName { .. } => "invalid_key_name",
            Self::External { .. } => "external",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}
