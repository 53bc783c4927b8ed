//! Secure random bytes for key generation

use gitcrypt_core::{GitCryptError, GitCryptResult};
use rand::rngs::OsRng;
use rand::RngCore;

/// Fill `buf` from the operating system CSPRNG.
///
/// An unavailable RNG is an error, never a silent fallback.
pub fn fill_random(buf: &mut [u8]) -> GitCryptResult<()> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| GitCryptError::external("random", e))
}
