//! AES-256-GCM codec
//!
//! Encoded format (binary):
//! ```text
//! [12 bytes: random nonce][N bytes: ciphertext][16 bytes: GCM tag]
//! ```
//!
//! Associated data is optional. Callers bind a key id when wrapping a DEK and
//! a relative file name when encrypting a dataset member. Job payloads carry
//! none; see `payload`.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::{rngs::OsRng, RngCore};

use crate::error::{CryptoError, CryptoResult};
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Encrypt `plaintext` under `key` with a fresh OS-random nonce.
///
/// Returns: `[12-byte nonce][ciphertext][16-byte tag]`
pub fn encrypt(
    key: &[u8; KEY_SIZE],
    plaintext: &[u8],
    associated_data: Option<&[u8]>,
) -> CryptoResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: associated_data.unwrap_or_default(),
            },
        )
        .map_err(|e| CryptoError::Other(anyhow::anyhow!("AES-GCM encryption failed: {e}")))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt an encoded blob produced by [`encrypt`].
///
/// A blob too short to hold nonce and tag is `Malformed`; a tag that does not
/// verify is `Authentication`.
pub fn decrypt(
    key: &[u8; KEY_SIZE],
    encoded: &[u8],
    associated_data: Option<&[u8]>,
) -> CryptoResult<Vec<u8>> {
    if encoded.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Malformed(format!(
            "{} bytes (minimum {})",
            encoded.len(),
            NONCE_SIZE + TAG_SIZE
        )));
    }

    let (nonce_bytes, ciphertext) = encoded.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(key.into());

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad: associated_data.unwrap_or_default(),
            },
        )
        .map_err(|_| {
            CryptoError::Authentication(
                "wrong key, wrong associated data, or tampered ciphertext".to_string(),
            )
        })
}

/// Size of the encoded output for a plaintext of `len` bytes.
pub fn encoded_len(len: usize) -> usize {
    NONCE_SIZE + len + TAG_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(b: u8) -> [u8; KEY_SIZE] {
        [b; KEY_SIZE]
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let k = key(7);
        let plaintext = b"hello, encrypted world!";

        let encrypted = encrypt(&k, plaintext, None).unwrap();
        let decrypted = decrypt(&k, &encrypted, None).unwrap();

        assert_eq!(&decrypted, plaintext);
    }

    #[test]
    fn test_encrypt_decrypt_empty() {
        let k = key(1);
        let encrypted = encrypt(&k, b"", None).unwrap();
        assert_eq!(encrypted.len(), NONCE_SIZE + TAG_SIZE);
        assert_eq!(decrypt(&k, &encrypted, None).unwrap(), b"");
    }

    #[test]
    fn test_decrypt_wrong_key() {
        let encrypted = encrypt(&key(1), b"secret data", None).unwrap();
        let result = decrypt(&key(2), &encrypted, None);
        assert!(matches!(result, Err(CryptoError::Authentication(_))));
    }

    #[test]
    fn test_decrypt_wrong_associated_data() {
        let k = key(3);
        let encrypted = encrypt(&k, b"secret data", Some(b"reads.fastq")).unwrap();

        let swapped = decrypt(&k, &encrypted, Some(b"other.fastq"));
        assert!(matches!(swapped, Err(CryptoError::Authentication(_))));

        let missing = decrypt(&k, &encrypted, None);
        assert!(matches!(missing, Err(CryptoError::Authentication(_))));
    }

    #[test]
    fn test_truncated_is_malformed() {
        let result = decrypt(&key(1), &[0u8; NONCE_SIZE + TAG_SIZE - 1], None);
        assert!(matches!(result, Err(CryptoError::Malformed(_))));
    }

    #[test]
    fn test_encrypted_size() {
        let encrypted = encrypt(&key(0), &[0u8; 1000], None).unwrap();
        // nonce (12) + plaintext (1000) + tag (16) = 1028
        assert_eq!(encrypted.len(), 12 + 1000 + 16);
        assert_eq!(encoded_len(1000), encrypted.len());
    }

    #[test]
    fn test_tampered_nonce_fails() {
        let k = key(9);
        let mut encrypted = encrypt(&k, b"secret data", None).unwrap();
        encrypted[0] ^= 0x01;
        assert!(matches!(
            decrypt(&k, &encrypted, None),
            Err(CryptoError::Authentication(_))
        ));
    }

    proptest! {
        #[test]
        fn roundtrip_any_plaintext(
            k in any::<[u8; 32]>(),
            data in proptest::collection::vec(any::<u8>(), 0..=2048),
        ) {
            let encrypted = encrypt(&k, &data, None).unwrap();
            prop_assert_eq!(decrypt(&k, &encrypted, None).unwrap(), data);
        }

        #[test]
        fn nonce_is_fresh_per_call(
            data in proptest::collection::vec(any::<u8>(), 1..=256),
        ) {
            let k = [0x42u8; 32];
            let a = encrypt(&k, &data, None).unwrap();
            let b = encrypt(&k, &data, None).unwrap();
            prop_assert_ne!(a, b, "two encryptions must not be identical");
        }

        #[test]
        fn any_flipped_ciphertext_byte_fails_authentication(
            data in proptest::collection::vec(any::<u8>(), 1..=512),
            idx in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let k = [0x24u8; 32];
            let mut encrypted = encrypt(&k, &data, Some(b"aad")).unwrap();
            let pos = NONCE_SIZE + idx.index(encrypted.len() - NONCE_SIZE);
            encrypted[pos] ^= flip;
            let result = decrypt(&k, &encrypted, Some(b"aad"));
            prop_assert!(matches!(result, Err(CryptoError::Authentication(_))));
        }
    }
}
