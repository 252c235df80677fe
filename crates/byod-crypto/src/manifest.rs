//! Dataset manifest (`encryption-manifest.json`)
//!
//! Records the wrapped DEK and, for each member file, its encrypted name,
//! sizes, nonce and the SHA-256 of its plaintext. `decrypt_path` needs it;
//! `encrypt_path` writes it last.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, CryptoResult};
use crate::keys::WrappedDek;

pub const MANIFEST_FILE_NAME: &str = "encryption-manifest.json";
pub const MANIFEST_VERSION: &str = "1.0";
pub const ALGORITHM: &str = "AES-256-GCM";

/// One encrypted member of a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the dataset root, `/` separated
    pub original_name: String,
    /// `original_name` + ".enc"
    pub encrypted_name: String,
    pub original_size: u64,
    pub encrypted_size: u64,
    /// SHA-256 of the plaintext (hex)
    pub checksum: String,
    /// Nonce prefix of the encrypted file (hex)
    pub nonce: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionManifest {
    pub version: String,
    pub encryption_algorithm: String,
    pub key_id: String,
    /// Nonce used to wrap the DEK (hex)
    pub dek_nonce: String,
    /// Wrapped DEK, ciphertext || tag (hex)
    pub wrapped_dek: String,
    pub timestamp: DateTime<Utc>,
    pub files: Vec<FileEntry>,
    pub total_files: usize,
    pub total_size_bytes: u64,
}

impl EncryptionManifest {
    pub fn new(key_id: &str, wrapped: &WrappedDek, files: Vec<FileEntry>) -> Self {
        let total_size_bytes = files.iter().map(|f| f.original_size).sum();
        Self {
            version: MANIFEST_VERSION.to_string(),
            encryption_algorithm: ALGORITHM.to_string(),
            key_id: key_id.to_string(),
            dek_nonce: hex::encode(wrapped.nonce),
            wrapped_dek: hex::encode(&wrapped.ciphertext),
            timestamp: Utc::now(),
            total_files: files.len(),
            total_size_bytes,
            files,
        }
    }

    pub fn wrapped_dek(&self) -> CryptoResult<WrappedDek> {
        let nonce = hex::decode(&self.dek_nonce)
            .map_err(|e| CryptoError::Malformed(format!("manifest dek_nonce: {e}")))?;
        let ciphertext = hex::decode(&self.wrapped_dek)
            .map_err(|e| CryptoError::Malformed(format!("manifest wrapped_dek: {e}")))?;
        WrappedDek::from_parts(&nonce, ciphertext)
    }

    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| CryptoError::Other(anyhow::anyhow!("manifest serialization: {e}")))
    }

    pub fn from_bytes(data: &[u8]) -> CryptoResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| CryptoError::Malformed(format!("manifest deserialization: {e}")))
    }

    /// Load `encryption-manifest.json` from a dataset directory.
    pub fn load(dir: &Path) -> CryptoResult<Self> {
        let path = dir.join(MANIFEST_FILE_NAME);
        if !path.is_file() {
            return Err(CryptoError::ManifestNotFound(path));
        }
        Self::from_bytes(&std::fs::read(&path)?)
    }
}
