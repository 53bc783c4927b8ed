//! gitcrypt-keys: distributing repository keys to collaborators
//!
//! A collaborator's copy of a key version is the one-entry key file for that
//! version, wrapped to the collaborator's public key and committed at
//!
//! ```text
//! <keys_dir>/keys/<key name or "default">/<version>/<fingerprint>.<ext>
//! ```
//!
//! Wrapping is pluggable through [`KeyWrapper`]; [`AgeWrapper`] is the
//! implementation shipped here.
//!
//! Identity discovery chain (in order of precedence):
//!   1. $GITCRYPT_AGE_IDENTITY_FILE env var (path to identity file)
//!   2. $GITCRYPT_AGE_IDENTITY env var (literal identity)
//!   3. `[identity].age_identity` from git-crypt.toml
//!   4. ~/.config/git-crypt/identity.txt (default fallback)

pub mod identity;
pub mod store;
pub mod wrap;

pub use identity::{find_age_identity, IdentityProvider, IdentitySearch};
pub use store::{CollaboratorBlob, RepoKeyStore};
pub use wrap::{AgeWrapper, KeyWrapper};
