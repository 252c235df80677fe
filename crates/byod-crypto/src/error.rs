use std::path::PathBuf;

use byod_core::ByodError;
use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Tag did not verify: wrong key, wrong associated data, or tampered bytes.
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    #[error("checksum mismatch for {file}: manifest says {expected}, recovered {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("encryption manifest not found at {}", .0.display())]
    ManifestNotFound(PathBuf),

    #[error("no files to encrypt under {}", .0.display())]
    NoInputFiles(PathBuf),

    #[error("master key not found: {0}")]
    KeyNotFound(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("{0}")]
    ConfirmationRequired(String),

    #[error("path '{0}' would escape the destination directory")]
    PathTraversal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<CryptoError> for ByodError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Authentication(msg) => ByodError::Integrity(msg),
            CryptoError::ChecksumMismatch {
                file,
                expected,
                actual,
            } => ByodError::ChecksumMismatch {
                file,
                expected,
                actual,
            },
            CryptoError::ManifestNotFound(path) => ByodError::MissingArtifact {
                path,
                hint: "Run `byod encrypt` first.".to_string(),
            },
            CryptoError::KeyNotFound(id) => ByodError::NotFound(format!("master key {id}")),
            CryptoError::NoInputFiles(_)
            | CryptoError::ConfirmationRequired(_)
            | CryptoError::PathTraversal(_)
            | CryptoError::InvalidKey(_) => ByodError::Validation(err.to_string()),
            CryptoError::Io(e) => ByodError::Io(e),
            CryptoError::Malformed(msg) => {
                ByodError::Other(anyhow::anyhow!("malformed ciphertext: {msg}"))
            }
            CryptoError::Other(e) => ByodError::Other(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decrypt, encrypt};

    #[test]
    fn test_tag_mismatch_maps_to_integrity() {
        let key = [7u8; 32];
        let mut sealed = encrypt(&key, b"payload", None).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        let err: ByodError = decrypt(&key, &sealed, None).unwrap_err().into();
        assert!(matches!(err, ByodError::Integrity(_)));
        assert!(err.public_message().contains("wrong key or tampered data"));
        assert_ne!(err.exit_code(), byod_core::error::exit_code::AUTH);
    }
}
