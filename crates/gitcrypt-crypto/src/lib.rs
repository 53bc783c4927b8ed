//! gitcrypt-crypto: transparent file encryption for git-crypt
//!
//! Scheme: deterministic AES-256-CTR with a synthetic nonce
//!
//! Pipeline (clean): plaintext → HMAC-SHA1(mac_key) → nonce = digest[..12] → AES-256-CTR(aes_key, nonce) → envelope
//!
//! Envelope layout:
//! ```text
//! [10 bytes: "\0GITCRYPT\0"][12 bytes: nonce][N bytes: ciphertext]
//! CTR block i = nonce (12 bytes) || i (4 bytes, big-endian)
//! ```
//!
//! The same plaintext always yields the same envelope, so git sees no spurious
//! changes. On smudge the recovered plaintext is re-hashed and compared to the
//! stored nonce, which doubles as the integrity tag.
//!
//! Key material lives in a [`KeyFile`]: numbered [`KeyEntry`] versions
//! (AES key + HMAC key) plus an optional key name.

pub mod block;
pub mod codec;
pub mod ctr;
pub mod fields;
pub mod key;
pub mod mac;
pub mod random;

pub use block::AesEcbEncryptor;
pub use codec::{
    decrypt, decrypt_with, decrypt_with_entry, encrypt, encrypt_with, is_encrypted, CodecOptions,
    DecryptStatus, ENVELOPE_KEY_VERSION,
};
pub use ctr::{process_stream, AesCtrEncryptor};
pub use key::{validate_key_name, KeyEntry, KeyFile, KeyFormat};
pub use mac::HmacSha1State;
pub use random::fill_random;

/// Size of an AES-256 key in bytes
pub const AES_KEY_LEN: usize = 32;

/// Size of the HMAC-SHA1 key in bytes
pub const HMAC_KEY_LEN: usize = 64;

/// Size of an HMAC-SHA1 digest
pub const HMAC_DIGEST_LEN: usize = 20;

/// Size of the CTR nonce (truncated HMAC digest)
pub const NONCE_LEN: usize = 12;

/// AES block size
pub const BLOCK_LEN: usize = 16;

/// Largest byte count a single CTR stream may process: 2^32 blocks of 16 bytes.
pub const MAX_CRYPT_BYTES: u64 = (1u64 << 32) * BLOCK_LEN as u64;

/// Magic prefix of every encrypted file
pub const ENCRYPTED_FILE_MAGIC: &[u8; 10] = b"\0GITCRYPT\0";

/// Magic plus nonce
pub const ENCRYPTED_FILE_HEADER_LEN: usize = ENCRYPTED_FILE_MAGIC.len() + NONCE_LEN;
