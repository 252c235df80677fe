//! Data keys, master keys, and DEK wrapping bound to a key id

use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, Zeroizing};

use crate::aead;
use crate::error::{CryptoError, CryptoResult};
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// A 256-bit data encryption key.
///
/// The bytes are wiped when the handle drops, including on early return,
/// error and task cancellation. This is best effort: copies made by the
/// allocator or by a cipher's internal key schedule are outside our reach.
pub struct DataKey {
    bytes: [u8; KEY_SIZE],
}

impl DataKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Copy a key out of a buffer handed over by a KMS backend.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "data key has wrong size: {} bytes (expected {KEY_SIZE})",
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for DataKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A locally held master key (128, 192 or 256 bits). Zeroized on drop.
pub struct MasterKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl MasterKey {
    pub fn from_bytes(bytes: Vec<u8>) -> CryptoResult<Self> {
        match bytes.len() {
            16 | 24 | 32 => Ok(Self {
                bytes: Zeroizing::new(bytes),
            }),
            n => {
                let mut bytes = bytes;
                bytes.zeroize();
                Err(CryptoError::InvalidKey(format!(
                    "master key must be 16, 24 or 32 bytes, got {n}"
                )))
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn size_bits(&self) -> u32 {
        (self.bytes.len() * 8) as u32
    }

    /// The AES-256 key view. Wrapping is AES-256-GCM only, so 128 and 192
    /// bit master keys are refused here rather than silently padded.
    fn aead_key(&self) -> CryptoResult<&[u8; KEY_SIZE]> {
        self.bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "DEK wrapping needs a 256-bit master key, this one is {} bits",
                self.size_bits()
            ))
        })
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bits", &self.size_bits())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A DEK wrapped under a master key: the nonce and `ciphertext || tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedDek {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl WrappedDek {
    pub fn from_parts(nonce: &[u8], ciphertext: Vec<u8>) -> CryptoResult<Self> {
        let nonce: [u8; NONCE_SIZE] = nonce.try_into().map_err(|_| {
            CryptoError::Malformed(format!(
                "DEK nonce has {} bytes (expected {NONCE_SIZE})",
                nonce.len()
            ))
        })?;
        Ok(Self { nonce, ciphertext })
    }
}

/// Generate a random 256-bit data encryption key.
pub fn generate_dek() -> DataKey {
    let mut bytes = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut bytes);
    DataKey::from_bytes(bytes)
}

/// Wrap a DEK under `master`, binding `key_id` as associated data so the
/// wrapped key cannot be replayed under another key id.
pub fn wrap_dek(dek: &DataKey, master: &MasterKey, key_id: &str) -> CryptoResult<WrappedDek> {
    let mut encoded = aead::encrypt(master.aead_key()?, dek.as_bytes(), Some(key_id.as_bytes()))?;
    let ciphertext = encoded.split_off(NONCE_SIZE);
    WrappedDek::from_parts(&encoded, ciphertext)
}

/// Unwrap a DEK. Fails with `Authentication` under a different master key or
/// a different `key_id`.
pub fn unwrap_dek(wrapped: &WrappedDek, master: &MasterKey, key_id: &str) -> CryptoResult<DataKey> {
    if wrapped.ciphertext.len() != KEY_SIZE + TAG_SIZE {
        return Err(CryptoError::Malformed(format!(
            "wrapped DEK has {} bytes (expected {})",
            wrapped.ciphertext.len(),
            KEY_SIZE + TAG_SIZE
        )));
    }

    let mut encoded = Vec::with_capacity(NONCE_SIZE + wrapped.ciphertext.len());
    encoded.extend_from_slice(&wrapped.nonce);
    encoded.extend_from_slice(&wrapped.ciphertext);

    let plaintext = Zeroizing::new(aead::decrypt(
        master.aead_key()?,
        &encoded,
        Some(key_id.as_bytes()),
    )?);
    DataKey::from_slice(&plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_master_key() -> MasterKey {
        MasterKey::from_bytes(vec![42u8; KEY_SIZE]).unwrap()
    }

    #[test]
    fn test_dek_generation() {
        let k1 = generate_dek();
        let k2 = generate_dek();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let master = test_master_key();
        let dek = generate_dek();

        let wrapped = wrap_dek(&dek, &master, "default-20250101000000").unwrap();
        let unwrapped = unwrap_dek(&wrapped, &master, "default-20250101000000").unwrap();

        assert_eq!(dek.as_bytes(), unwrapped.as_bytes());
    }

    #[test]
    fn test_unwrap_wrong_master() {
        let master1 = MasterKey::from_bytes(vec![1u8; KEY_SIZE]).unwrap();
        let master2 = MasterKey::from_bytes(vec![2u8; KEY_SIZE]).unwrap();
        let dek = generate_dek();

        let wrapped = wrap_dek(&dek, &master1, "k").unwrap();
        let result = unwrap_dek(&wrapped, &master2, "k");

        assert!(matches!(result, Err(CryptoError::Authentication(_))));
    }

    #[test]
    fn test_unwrap_wrong_key_id() {
        let master = test_master_key();
        let dek = DataKey::from_bytes([7u8; KEY_SIZE]);

        let wrapped_a = wrap_dek(&dek, &master, "profile-a").unwrap();
        let wrapped_b = wrap_dek(&dek, &master, "profile-b").unwrap();

        assert!(unwrap_dek(&wrapped_a, &master, "profile-a").is_ok());
        assert!(matches!(
            unwrap_dek(&wrapped_a, &master, "profile-b"),
            Err(CryptoError::Authentication(_))
        ));
        assert!(matches!(
            unwrap_dek(&wrapped_b, &master, "profile-a"),
            Err(CryptoError::Authentication(_))
        ));
    }

    #[test]
    fn test_wrapped_size() {
        let wrapped = wrap_dek(&generate_dek(), &test_master_key(), "k").unwrap();
        // key (32) + tag (16)
        assert_eq!(wrapped.ciphertext.len(), KEY_SIZE + TAG_SIZE);
    }

    #[test]
    fn test_short_master_key_cannot_wrap() {
        let master = MasterKey::from_bytes(vec![5u8; 16]).unwrap();
        assert_eq!(master.size_bits(), 128);
        let result = wrap_dek(&generate_dek(), &master, "k");
        assert!(matches!(result, Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn test_invalid_master_key_length() {
        assert!(MasterKey::from_bytes(vec![0u8; 20]).is_err());
    }

    #[test]
    fn test_data_key_from_slice_checks_len() {
        assert!(DataKey::from_slice(&[0u8; 31]).is_err());
        assert!(DataKey::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_debug_redacts() {
        let rendered = format!("{:?}", DataKey::from_bytes([0xAB; KEY_SIZE]));
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("171"));
    }
}
