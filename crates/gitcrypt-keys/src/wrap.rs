//! Asymmetric wrapping of key files (age 0.11 API)

use std::io::Read;

use age::x25519;
use gitcrypt_core::{GitCryptError, GitCryptResult};
use secrecy::ExposeSecret;
use zeroize::Zeroizing;

use crate::identity::IdentityProvider;

/// Encrypts key-file bytes to a collaborator and back.
///
/// A fingerprint names a recipient on disk, so it must be usable as a file
/// name and stable for a given public key.
pub trait KeyWrapper {
    /// File extension of wrapped blobs, without the dot.
    fn extension(&self) -> &'static str;

    /// Check a user-supplied recipient and return its canonical fingerprint.
    fn fingerprint(&self, recipient: &str) -> GitCryptResult<String>;

    /// Wrap `plaintext` so that only `recipient` can unwrap it.
    ///
    /// `trusted` records that the caller vouched for the recipient without
    /// further verification.
    fn wrap(&self, plaintext: &[u8], recipient: &str, trusted: bool) -> GitCryptResult<Vec<u8>>;

    /// Fingerprints of every private identity available locally.
    fn secret_fingerprints(&self) -> GitCryptResult<Vec<String>>;

    /// Unwrap a blob addressed to the local identity `fingerprint`.
    fn unwrap(&self, blob: &[u8], fingerprint: &str) -> GitCryptResult<Zeroizing<Vec<u8>>>;
}

/// age X25519 wrapping. The fingerprint is the `age1...` public key.
pub struct AgeWrapper {
    identities: Vec<x25519::Identity>,
}

impl AgeWrapper {
    /// A wrapper that can only wrap (no local identities).
    pub fn recipients_only() -> Self {
        Self {
            identities: Vec::new(),
        }
    }

    pub fn new(identities: Vec<x25519::Identity>) -> Self {
        Self { identities }
    }

    /// Parse every identity in a discovered identity file.
    pub fn from_provider(provider: &IdentityProvider) -> GitCryptResult<Self> {
        let identities = parse_identities(provider.key_data.expose_secret())
            .map_err(|e| GitCryptError::external("age", format!("{}: {e}", provider.source)))?;
        if identities.is_empty() {
            return Err(GitCryptError::external(
                "age",
                format!("{}: no X25519 identities found", provider.source),
            ));
        }
        tracing::debug!(source = %provider.source, count = identities.len(), "loaded age identities");
        Ok(Self::new(identities))
    }

    fn identity(&self, fingerprint: &str) -> Option<&x25519::Identity> {
        self.identities
            .iter()
            .find(|identity| identity.to_public().to_string() == fingerprint)
    }
}

impl std::fmt::Debug for AgeWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let public: Vec<String> = self
            .identities
            .iter()
            .map(|i| i.to_public().to_string())
            .collect();
        f.debug_struct("AgeWrapper").field("identities", &public).finish()
    }
}

impl KeyWrapper for AgeWrapper {
    fn extension(&self) -> &'static str {
        "age"
    }

    fn fingerprint(&self, recipient: &str) -> GitCryptResult<String> {
        let parsed = parse_recipient(recipient)?;
        Ok(parsed.to_string())
    }

    fn wrap(&self, plaintext: &[u8], recipient: &str, trusted: bool) -> GitCryptResult<Vec<u8>> {
        let parsed = parse_recipient(recipient)?;
        // age has no web of trust; the flag only shows up in the logs.
        tracing::debug!(recipient = %parsed, trusted, "wrapping key for recipient");
        age::encrypt(&parsed, plaintext).map_err(|e| GitCryptError::external("age", e))
    }

    fn secret_fingerprints(&self) -> GitCryptResult<Vec<String>> {
        Ok(self
            .identities
            .iter()
            .map(|identity| identity.to_public().to_string())
            .collect())
    }

    fn unwrap(&self, blob: &[u8], fingerprint: &str) -> GitCryptResult<Zeroizing<Vec<u8>>> {
        let identity = self.identity(fingerprint).ok_or_else(|| {
            GitCryptError::KeyNotFound(format!("no local age identity for {fingerprint}"))
        })?;

        let decryptor =
            age::Decryptor::new(blob).map_err(|e| GitCryptError::external("age", e))?;
        if decryptor.is_scrypt() {
            return Err(GitCryptError::external(
                "age",
                "passphrase-protected blobs are not supported",
            ));
        }

        let mut reader = decryptor
            .decrypt(std::iter::once(identity as &dyn age::Identity))
            .map_err(|e| GitCryptError::external("age", e))?;

        let mut plaintext = Zeroizing::new(Vec::new());
        reader
            .read_to_end(&mut plaintext)
            .map_err(|e| GitCryptError::external("age", e))?;
        Ok(plaintext)
    }
}

fn parse_recipient(recipient: &str) -> GitCryptResult<x25519::Recipient> {
    recipient
        .trim()
        .parse::<x25519::Recipient>()
        .map_err(|e| GitCryptError::external("age", format!("invalid recipient {recipient:?}: {e}")))
}

/// Parse an identity file: one `AGE-SECRET-KEY-1...` per line, `#` comments.
///
/// `age::IdentityFile` only hands back boxed `dyn Identity` values; fingerprints
/// need the concrete X25519 key to derive its public recipient.
fn parse_identities(data: &str) -> Result<Vec<x25519::Identity>, String> {
    data.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .enumerate()
        .map(|(i, line)| {
            line.parse::<x25519::Identity>()
                .map_err(|e| format!("identity #{}: {e}", i + 1))
        })
        .collect()
}
