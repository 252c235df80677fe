//! byod-crypto: client-side encryption for BYOD job submission
//!
//! Every encrypted blob uses one wire format:
//! ```text
//! [12 bytes: random nonce][N bytes: AES-256-GCM ciphertext][16 bytes: tag]
//! ```
//!
//! Key hierarchy:
//! ```text
//! Master Key (local, 256-bit, ~/.byod/keys/{key_id}.key)   or   hosted KMS key
//!   └── Data Encryption Key (per dataset / per job, 256-bit random)
//!       ├── wrapped: AEAD(master, DEK, AAD=key_id)          (local datasets)
//!       ├── wrapped: KMS GenerateDataKey ciphertext blob     (job payloads)
//!       ├── dataset members: AEAD(DEK, file, AAD=relative file name)
//!       └── job payload: AEAD(DEK, file-or-tar.gz, no AAD)
//! ```

pub mod aead;
pub mod dataset;
pub mod error;
pub mod keys;
pub mod keystore;
pub mod manifest;
pub mod payload;

pub use aead::{decrypt, encrypt};
pub use dataset::{decrypt_path, encrypt_path, DecryptSummary, EncryptOptions, EncryptSummary};
pub use error::{CryptoError, CryptoResult};
pub use keys::{generate_dek, unwrap_dek, wrap_dek, DataKey, MasterKey, WrappedDek};
pub use keystore::{KeyMetadata, KeyStore};
pub use manifest::{EncryptionManifest, FileEntry, MANIFEST_FILE_NAME};
pub use payload::{bundle, extract_results, is_gzip, open_payload, seal_payload, Payload};

/// Size of an AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;
