//! Property tests for the clean/smudge envelope.

use gitcrypt_crypto::{decrypt, encrypt, DecryptStatus, KeyFile, ENCRYPTED_FILE_HEADER_LEN};
use proptest::prelude::*;

fn key_file() -> KeyFile {
    let mut kf = KeyFile::new();
    kf.generate().expect("generate key");
    kf
}

fn clean(kf: &KeyFile, plaintext: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    encrypt(kf, plaintext, &mut out).expect("encrypt");
    out
}

fn smudge(kf: &KeyFile, envelope: &[u8]) -> (DecryptStatus, Vec<u8>) {
    let mut out = Vec::new();
    let status = decrypt(kf, envelope, &mut out).expect("decrypt");
    (status, out)
}

#[test]
fn single_bit_flips_change_the_nonce() {
    let kf = key_file();
    let base: Vec<u8> = (0..257u32).map(|i| (i * 13 + 1) as u8).collect();
    let base_nonce = clean(&kf, &base)[10..ENCRYPTED_FILE_HEADER_LEN].to_vec();

    for i in 0..100usize {
        let mut flipped = base.clone();
        flipped[(i * 37) % base.len()] ^= 1 << (i % 8);
        let envelope = clean(&kf, &flipped);
        assert_ne!(
            &envelope[10..ENCRYPTED_FILE_HEADER_LEN],
            base_nonce.as_slice(),
            "flip #{i} produced the same nonce"
        );
    }
}

proptest! {
    #[test]
    fn roundtrip_is_authentic(data in proptest::collection::vec(any::<u8>(), 0..=8192)) {
        let kf = key_file();
        let envelope = clean(&kf, &data);
        prop_assert_eq!(envelope.len(), ENCRYPTED_FILE_HEADER_LEN + data.len());

        let (status, plaintext) = smudge(&kf, &envelope);
        prop_assert_eq!(status, DecryptStatus::Authentic { bytes: data.len() as u64 });
        prop_assert_eq!(plaintext, data);
    }

    #[test]
    fn encryption_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..=4096)) {
        let kf = key_file();
        prop_assert_eq!(clean(&kf, &data), clean(&kf, &data));
    }

    #[test]
    fn any_bit_flip_is_tampered(
        data in proptest::collection::vec(any::<u8>(), 1..=2048),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let kf = key_file();
        let mut envelope = clean(&kf, &data);
        // Only nonce and ciphertext bytes; flipping the magic makes it plain text.
        let index = 10 + position.index(envelope.len() - 10);
        envelope[index] ^= 1 << bit;

        let (status, _) = smudge(&kf, &envelope);
        prop_assert!(matches!(status, DecryptStatus::Tampered { .. }), "flip at {} undetected", index);
    }

    #[test]
    fn plain_text_passes_through(data in proptest::collection::vec(any::<u8>(), 0..=1024)) {
        prop_assume!(!data.starts_with(b"\0GITCRYPT\0"));
        let kf = key_file();
        let (status, out) = smudge(&kf, &data);
        prop_assert_eq!(status, DecryptStatus::NotEncrypted { bytes: data.len() as u64 });
        prop_assert_eq!(out, data);
    }
}
