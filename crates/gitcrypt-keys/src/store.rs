//! Wrapped key files committed to the repository, one per collaborator

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use gitcrypt_core::{GitCryptError, GitCryptResult};
use gitcrypt_crypto::{validate_key_name, KeyFile};
use zeroize::Zeroizing;

use crate::wrap::KeyWrapper;

const DEFAULT_KEY_DIR: &str = "default";

/// One wrapped blob found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorBlob {
    pub key_name: Option<String>,
    pub version: u32,
    pub fingerprint: String,
    pub path: PathBuf,
}

/// Collaborator key directory rooted at `base` (normally `.git-crypt`).
#[derive(Debug)]
pub struct RepoKeyStore<W> {
    base: PathBuf,
    wrapper: W,
}

impl<W: KeyWrapper> RepoKeyStore<W> {
    pub fn new(base: impl Into<PathBuf>, wrapper: W) -> Self {
        Self {
            base: base.into(),
            wrapper,
        }
    }

    pub fn wrapper(&self) -> &W {
        &self.wrapper
    }

    fn keys_root(&self) -> PathBuf {
        self.base.join("keys")
    }

    /// `<base>/keys/<key name or "default">/<version>/<fingerprint>.<ext>`
    pub fn blob_path(&self, key_name: Option<&str>, version: u32, fingerprint: &str) -> PathBuf {
        self.keys_root()
            .join(key_name.unwrap_or(DEFAULT_KEY_DIR))
            .join(version.to_string())
            .join(format!("{fingerprint}.{}", self.wrapper.extension()))
    }

    /// Wrap the latest entry of `key_file` for each recipient.
    ///
    /// Every recipient is validated before anything is written. Recipients
    /// that already have a blob for this key version are skipped. Returns the
    /// paths of the blobs written by this call.
    pub fn add_collaborators(
        &self,
        key_file: &KeyFile,
        recipients: &[&str],
        trusted: bool,
    ) -> GitCryptResult<Vec<PathBuf>> {
        let fingerprints = recipients
            .iter()
            .map(|r| self.wrapper.fingerprint(r))
            .collect::<GitCryptResult<Vec<_>>>()?;

        let entry = key_file.require_latest()?;
        let mut single = KeyFile::with_key_name(key_file.key_name())?;
        single.add(entry.clone())?;
        let plaintext = Zeroizing::new(single.store_to_vec()?);

        let mut written = Vec::new();
        for fingerprint in fingerprints {
            let path = self.blob_path(key_file.key_name(), entry.version(), &fingerprint);
            if path.exists() {
                tracing::debug!(path = %path.display(), "collaborator already has this key version");
                continue;
            }
            let blob = self.wrapper.wrap(&plaintext, &fingerprint, trusted)?;
            write_atomic(&path, &blob)?;
            tracing::info!(
                fingerprint = %fingerprint,
                key_name = key_file.key_name().unwrap_or(DEFAULT_KEY_DIR),
                version = entry.version(),
                "added collaborator"
            );
            written.push(path);
        }
        Ok(written)
    }

    /// Unwrap key `key_name` at `version` with whichever local identity has a
    /// blob for it.
    ///
    /// Identities are tried in order and the first success wins. If none
    /// succeeds, the last unwrap error is returned, or `KeyNotFound` when no
    /// local identity has a blob at all.
    pub fn unwrap_key(&self, key_name: Option<&str>, version: u32) -> GitCryptResult<KeyFile> {
        let mut last_error = None;
        for fingerprint in self.wrapper.secret_fingerprints()? {
            let path = self.blob_path(key_name, version, &fingerprint);
            if !path.exists() {
                continue;
            }
            match self.unwrap_blob(&path, &fingerprint, key_name, version) {
                Ok(key_file) => {
                    tracing::info!(
                        path = %path.display(),
                        key_name = key_name.unwrap_or(DEFAULT_KEY_DIR),
                        version,
                        "unwrapped key"
                    );
                    return Ok(key_file);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "could not unwrap key");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            GitCryptError::KeyNotFound(format!(
                "no wrapped copy of key {} version {version} for any local identity",
                key_name.unwrap_or(DEFAULT_KEY_DIR)
            ))
        }))
    }

    fn unwrap_blob(
        &self,
        path: &Path,
        fingerprint: &str,
        key_name: Option<&str>,
        version: u32,
    ) -> GitCryptResult<KeyFile> {
        let blob = std::fs::read(path)?;
        let plaintext = self.wrapper.unwrap(&blob, fingerprint)?;
        let key_file = KeyFile::load(plaintext.as_slice())?;

        if key_file.get(version).is_none() {
            return Err(GitCryptError::Malformed(format!(
                "{}: does not contain key version {version}",
                path.display()
            )));
        }
        if key_file.key_name() != key_name {
            return Err(GitCryptError::Malformed(format!(
                "{}: key name {:?} does not match its directory",
                path.display(),
                key_file.key_name()
            )));
        }
        Ok(key_file)
    }

    /// Unwrap every key name that has a blob at `version` for a local
    /// identity. Directories that are not valid key names are ignored.
    pub fn unwrap_all(&self, version: u32) -> GitCryptResult<Vec<KeyFile>> {
        let mut key_files = Vec::new();
        for key_name in self.key_names()? {
            match self.unwrap_key(key_name.as_deref(), version) {
                Ok(key_file) => key_files.push(key_file),
                Err(GitCryptError::KeyNotFound(reason)) => {
                    tracing::debug!(%reason, "skipping key");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(key_files)
    }

    /// Every wrapped blob on disk, sorted by key name, version, fingerprint.
    pub fn list(&self) -> GitCryptResult<Vec<CollaboratorBlob>> {
        let mut blobs = Vec::new();
        let suffix = format!(".{}", self.wrapper.extension());

        for key_name in self.key_names()? {
            let key_dir = self.keys_root().join(key_name.as_deref().unwrap_or(DEFAULT_KEY_DIR));
            let mut versions = BTreeMap::new();
            for entry in std::fs::read_dir(&key_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                if let Some(version) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
                    versions.insert(version, entry.path());
                }
            }

            for (version, version_dir) in versions {
                let mut fingerprints = Vec::new();
                for entry in std::fs::read_dir(&version_dir)? {
                    let entry = entry?;
                    let file_name = entry.file_name();
                    let Some(fingerprint) = file_name.to_str().and_then(|s| s.strip_suffix(&suffix))
                    else {
                        continue;
                    };
                    if fingerprint.is_empty() || fingerprint.starts_with('.') {
                        continue;
                    }
                    fingerprints.push((fingerprint.to_owned(), entry.path()));
                }
                fingerprints.sort();
                blobs.extend(fingerprints.into_iter().map(|(fingerprint, path)| CollaboratorBlob {
                    key_name: key_name.clone(),
                    version,
                    fingerprint,
                    path,
                }));
            }
        }
        Ok(blobs)
    }

    /// Key names with a directory under `<base>/keys`, default first.
    fn key_names(&self) -> GitCryptResult<Vec<Option<String>>> {
        let root = self.keys_root();
        if !root.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(dir_name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if dir_name == DEFAULT_KEY_DIR {
                names.push(None);
            } else if validate_key_name(&dir_name).is_ok() {
                names.push(Some(dir_name));
            } else {
                tracing::debug!(dir = %dir_name, "ignoring directory with invalid key name");
            }
        }
        names.sort();
        Ok(names)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> GitCryptResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| GitCryptError::Config(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".git-crypt-blob")
        .tempfile_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| GitCryptError::Io(e.error))?;
    Ok(())
}
