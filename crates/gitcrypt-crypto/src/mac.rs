//! Incremental HMAC-SHA1 over file plaintext

use hmac::digest::generic_array::GenericArray;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;

use crate::{HMAC_DIGEST_LEN, HMAC_KEY_LEN, NONCE_LEN};

type HmacSha1 = Hmac<Sha1>;

/// Running HMAC-SHA1 state. `finish` consumes it, so one instance hashes
/// exactly one message.
pub struct HmacSha1State {
    mac: HmacSha1,
}

impl HmacSha1State {
    pub fn new(key: &[u8; HMAC_KEY_LEN]) -> Self {
        // HMAC_KEY_LEN equals the SHA-1 block size, so the key is used as-is.
        Self {
            mac: <HmacSha1 as Mac>::new(GenericArray::from_slice(key)),
        }
    }

    pub fn add(&mut self, data: &[u8]) {
        self.mac.update(data);
    }

    pub fn finish(self) -> [u8; HMAC_DIGEST_LEN] {
        let mut digest = [0u8; HMAC_DIGEST_LEN];
        digest.copy_from_slice(&self.mac.finalize().into_bytes());
        digest
    }
}

/// Synthetic nonce: the first `NONCE_LEN` bytes of the digest.
pub fn nonce_from_digest(digest: &[u8; HMAC_DIGEST_LEN]) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&digest[..NONCE_LEN]);
    nonce
}

/// Constant-time check that `digest` starts with `nonce`.
pub fn digest_matches_nonce(digest: &[u8; HMAC_DIGEST_LEN], nonce: &[u8; NONCE_LEN]) -> bool {
    digest[..NONCE_LEN].ct_eq(&nonce[..]).into()
}
