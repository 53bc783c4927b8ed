//! Versioned key files
//!
//! Key file format (v2):
//! ```text
//! [12 bytes: "\0GITCRYPTKEY"][4 bytes: format version = 2, BE]
//! header fields ... END        KEY_NAME(1)
//! entry fields ... END         VERSION(1) AES_KEY(3) HMAC_KEY(5)
//! entry fields ... END
//! ...                          (entries run to end of input, newest first)
//! ```
//!
//! Legacy format (pre-versioning): exactly 32 bytes AES key + 64 bytes HMAC
//! key, nothing else. It loads as version 0, but only through an explicit
//! `KeyFile::load_legacy` call; file loading never guesses it.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::Path;

use gitcrypt_core::{GitCryptError, GitCryptResult};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use crate::fields::{self, FieldReader};
use crate::random::fill_random;
use crate::{AES_KEY_LEN, HMAC_KEY_LEN};

pub const KEY_FILE_MAGIC: &[u8; 12] = b"\0GITCRYPTKEY";
pub const FORMAT_VERSION: u32 = 2;
pub const KEY_NAME_MAX_LEN: usize = 128;

const LEGACY_KEY_LEN: usize = AES_KEY_LEN + HMAC_KEY_LEN;

const HEADER_FIELD_KEY_NAME: u32 = 1;

const KEY_FIELD_VERSION: u32 = 1;
const KEY_FIELD_AES_KEY: u32 = 3;
const KEY_FIELD_HMAC_KEY: u32 = 5;

/// One numbered pair of (AES key, HMAC key). Zeroized on drop.
#[derive(Clone)]
pub struct KeyEntry {
    version: u32,
    aes_key: [u8; AES_KEY_LEN],
    hmac_key: [u8; HMAC_KEY_LEN],
}

impl KeyEntry {
    pub fn from_parts(version: u32, aes_key: [u8; AES_KEY_LEN], hmac_key: [u8; HMAC_KEY_LEN]) -> Self {
        Self {
            version,
            aes_key,
            hmac_key,
        }
    }

    /// Fresh random key material for `version`.
    pub fn generate(version: u32) -> GitCryptResult<Self> {
        let mut entry = Self::from_parts(version, [0u8; AES_KEY_LEN], [0u8; HMAC_KEY_LEN]);
        fill_random(&mut entry.aes_key)?;
        fill_random(&mut entry.hmac_key)?;
        Ok(entry)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn aes_key(&self) -> &[u8; AES_KEY_LEN] {
        &self.aes_key
    }

    pub fn hmac_key(&self) -> &[u8; HMAC_KEY_LEN] {
        &self.hmac_key
    }

    /// Parse one tagged entry, up to and including its END marker.
    pub fn load<R: BufRead>(input: &mut R) -> GitCryptResult<Self> {
        let mut reader = FieldReader::new(input, "key entry");
        let mut version = None;
        let mut aes_key = None;
        let mut hmac_key = None;

        while let Some((field_id, field_len)) = reader.next_field()? {
            match field_id {
                KEY_FIELD_VERSION => version = Some(reader.read_u32(field_len)?),
                KEY_FIELD_AES_KEY => {
                    let mut buf = [0u8; AES_KEY_LEN];
                    reader.read_fixed(field_len, &mut buf)?;
                    aes_key = Some(buf);
                }
                KEY_FIELD_HMAC_KEY => {
                    let mut buf = [0u8; HMAC_KEY_LEN];
                    reader.read_fixed(field_len, &mut buf)?;
                    hmac_key = Some(buf);
                }
                _ => reader.skip_unknown(field_id, field_len)?,
            }
        }

        match (version, aes_key, hmac_key) {
            (Some(version), Some(aes_key), Some(hmac_key)) => {
                Ok(Self::from_parts(version, aes_key, hmac_key))
            }
            (_, mut aes_key, mut hmac_key) => {
                aes_key.zeroize();
                hmac_key.zeroize();
                Err(GitCryptError::Malformed(
                    "key entry is missing a required field".into(),
                ))
            }
        }
    }

    /// Parse the unframed 96-byte legacy layout. Trailing bytes are rejected.
    pub fn load_legacy<R: BufRead>(version: u32, input: &mut R) -> GitCryptResult<Self> {
        let mut entry = Self::from_parts(version, [0u8; AES_KEY_LEN], [0u8; HMAC_KEY_LEN]);
        fields::read_exact(input, &mut entry.aes_key, "legacy key")?;
        fields::read_exact(input, &mut entry.hmac_key, "legacy key")?;
        if !fields::at_eof(input)? {
            return Err(GitCryptError::Malformed(format!(
                "legacy key: trailing data after {LEGACY_KEY_LEN} bytes"
            )));
        }
        Ok(entry)
    }

    pub fn store<W: Write>(&self, out: &mut W) -> GitCryptResult<()> {
        fields::write_field(out, KEY_FIELD_VERSION, &self.version.to_be_bytes())?;
        fields::write_field(out, KEY_FIELD_AES_KEY, &self.aes_key)?;
        fields::write_field(out, KEY_FIELD_HMAC_KEY, &self.hmac_key)?;
        fields::write_end(out)?;
        Ok(())
    }
}

impl PartialEq for KeyEntry {
    fn eq(&self, other: &Self) -> bool {
        let keys_equal =
            self.aes_key[..].ct_eq(&other.aes_key[..]) & self.hmac_key[..].ct_eq(&other.hmac_key[..]);
        self.version == other.version && bool::from(keys_equal)
    }
}

impl Eq for KeyEntry {}

impl Drop for KeyEntry {
    fn drop(&mut self) {
        self.aes_key.zeroize();
        self.hmac_key.zeroize();
    }
}

impl std::fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEntry")
            .field("version", &self.version)
            .field("aes_key", &"[REDACTED]")
            .field("hmac_key", &"[REDACTED]")
            .finish()
    }
}

/// Serialized key layouts, told apart by the first bytes of the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    Legacy,
    Tagged,
}

impl KeyFormat {
    pub fn detect(prefix: &[u8]) -> Self {
        if prefix.starts_with(KEY_FILE_MAGIC) {
            Self::Tagged
        } else {
            Self::Legacy
        }
    }
}

/// A key name plus its key versions.
///
/// Entries are kept in a `BTreeMap` keyed by version; iteration and
/// serialization are in **descending** version order, so `store` output is
/// stable for an unmodified file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFile {
    key_name: Option<String>,
    entries: BTreeMap<u32, KeyEntry>,
}

impl KeyFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_name(key_name: Option<&str>) -> GitCryptResult<Self> {
        let mut key_file = Self::new();
        key_file.set_key_name(key_name)?;
        Ok(key_file)
    }

    pub fn key_name(&self) -> Option<&str> {
        self.key_name.as_deref()
    }

    /// `None` means the default key.
    pub fn set_key_name(&mut self, key_name: Option<&str>) -> GitCryptResult<()> {
        if let Some(name) = key_name {
            validate_key_name(name)?;
        }
        self.key_name = key_name.map(str::to_owned);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Greatest version number, or `None` for an empty file.
    pub fn latest(&self) -> Option<u32> {
        self.entries.keys().next_back().copied()
    }

    pub fn get(&self, version: u32) -> Option<&KeyEntry> {
        self.entries.get(&version)
    }

    pub fn get_latest(&self) -> Option<&KeyEntry> {
        self.entries.values().next_back()
    }

    /// Like [`KeyFile::get`], but a missing version is a `KeyNotFound` error.
    pub fn require(&self, version: u32) -> GitCryptResult<&KeyEntry> {
        self.get(version).ok_or_else(|| {
            GitCryptError::KeyNotFound(format!(
                "key version {version} of {} is not available",
                self.display_name()
            ))
        })
    }

    pub fn require_latest(&self) -> GitCryptResult<&KeyEntry> {
        self.get_latest().ok_or_else(|| {
            GitCryptError::KeyNotFound(format!("key file {} has no entries", self.display_name()))
        })
    }

    /// Entries, newest first.
    pub fn entries(&self) -> impl Iterator<Item = &KeyEntry> {
        self.entries.values().rev()
    }

    /// Add an entry. An existing version is never overwritten.
    pub fn add(&mut self, entry: KeyEntry) -> GitCryptResult<()> {
        let version = entry.version();
        if self.entries.contains_key(&version) {
            return Err(GitCryptError::Malformed(format!(
                "duplicate key version {version}"
            )));
        }
        self.entries.insert(version, entry);
        Ok(())
    }

    /// Append a fresh entry at `latest + 1` (or 0). Returns the new version.
    pub fn generate(&mut self) -> GitCryptResult<u32> {
        let version = match self.latest() {
            None => 0,
            Some(latest) => latest.checked_add(1).ok_or_else(|| {
                GitCryptError::Other(anyhow::anyhow!("key version space exhausted"))
            })?,
        };
        self.add(KeyEntry::generate(version)?)?;
        tracing::debug!(version, key_name = self.display_name(), "generated key version");
        Ok(version)
    }

    /// Parse a legacy 96-byte key into a file holding version 0.
    pub fn load_legacy<R: BufRead>(mut input: R) -> GitCryptResult<Self> {
        let mut key_file = Self::new();
        key_file.add(KeyEntry::load_legacy(0, &mut input)?)?;
        Ok(key_file)
    }

    /// Parse the tagged v2 format.
    pub fn load<R: BufRead>(mut input: R) -> GitCryptResult<Self> {
        let mut preamble = [0u8; 16];
        fields::read_exact(&mut input, &mut preamble, "key file header")?;
        if &preamble[..12] != KEY_FILE_MAGIC {
            return Err(GitCryptError::Malformed("not a git-crypt key file".into()));
        }
        let format_version = u32::from_be_bytes([preamble[12], preamble[13], preamble[14], preamble[15]]);
        if format_version != FORMAT_VERSION {
            return Err(GitCryptError::Incompatible(format!(
                "key file format version {format_version}, expected {FORMAT_VERSION}"
            )));
        }

        let mut key_file = Self::new();
        key_file.load_header(&mut input)?;
        while !fields::at_eof(&mut input)? {
            key_file.add(KeyEntry::load(&mut input)?)?;
        }
        Ok(key_file)
    }

    pub fn load_from_slice(data: &[u8]) -> GitCryptResult<Self> {
        Self::load(data)
    }

    fn load_header<R: BufRead>(&mut self, input: &mut R) -> GitCryptResult<()> {
        let mut reader = FieldReader::new(input, "key file header");
        while let Some((field_id, field_len)) = reader.next_field()? {
            if field_id == HEADER_FIELD_KEY_NAME {
                if field_len as usize > KEY_NAME_MAX_LEN {
                    return Err(GitCryptError::Malformed(format!(
                        "key name field is {field_len} bytes"
                    )));
                }
                let mut buf = vec![0u8; field_len as usize];
                reader.read_payload(&mut buf)?;
                let name = String::from_utf8(buf)
                    .map_err(|_| GitCryptError::Malformed("key name is not UTF-8".into()))?;
                validate_key_name(&name)
                    .map_err(|e| GitCryptError::Malformed(e.to_string()))?;
                self.key_name = Some(name);
            } else {
                reader.skip_unknown(field_id, field_len)?;
            }
        }
        Ok(())
    }

    pub fn store<W: Write>(&self, mut out: W) -> GitCryptResult<()> {
        out.write_all(KEY_FILE_MAGIC)?;
        out.write_all(&FORMAT_VERSION.to_be_bytes())?;
        if let Some(name) = &self.key_name {
            fields::write_field(&mut out, HEADER_FIELD_KEY_NAME, name.as_bytes())?;
        }
        fields::write_end(&mut out)?;
        for entry in self.entries() {
            entry.store(&mut out)?;
        }
        out.flush()?;
        Ok(())
    }

    pub fn store_to_vec(&self) -> GitCryptResult<Vec<u8>> {
        let mut out = Vec::new();
        self.store(&mut out)?;
        Ok(out)
    }

    /// Load a tagged key file from disk.
    ///
    /// Legacy keys carry no magic, so they are never guessed here; they must
    /// be converted with `git-crypt migrate-key` first.
    pub fn load_from_file(path: &Path) -> GitCryptResult<Self> {
        let data = Zeroizing::new(std::fs::read(path)?);
        if KeyFormat::detect(&data) == KeyFormat::Legacy {
            return Err(GitCryptError::Malformed(format!(
                "{}: not a git-crypt key file (legacy keys must be converted with \
                 `git-crypt migrate-key`)",
                path.display()
            )));
        }
        Self::load(data.as_slice())
    }

    /// Write atomically with owner-only permissions.
    ///
    /// The data goes to a temp file in the destination directory (created
    /// 0600) which is renamed over `path`, so a failure never leaves a partial
    /// key file behind.
    pub fn store_to_file(&self, path: &Path) -> GitCryptResult<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".git-crypt-key")
            .tempfile_in(parent)?;
        self.store(tmp.as_file_mut())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| GitCryptError::Io(e.error))?;

        tracing::info!(
            path = %path.display(),
            key_name = self.display_name(),
            versions = self.len(),
            "key file written"
        );
        Ok(())
    }

    fn display_name(&self) -> &str {
        self.key_name.as_deref().unwrap_or("default")
    }
}

/// Key names: 1..=128 chars of `[A-Za-z0-9_-]`, and not `default`.
pub fn validate_key_name(name: &str) -> GitCryptResult<()> {
    let invalid = |reason| GitCryptError::InvalidKeyName {
        name: name.to_owned(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("key name may not be empty"));
    }
    if name == "default" {
        return Err(invalid("`default' is not a legal key name"));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(invalid("key names may contain only A-Z, a-z, 0-9, '-', and '_'"));
    }
    if name.len() > KEY_NAME_MAX_LEN {
        return Err(invalid("key name is too long"));
    }
    Ok(())
}
