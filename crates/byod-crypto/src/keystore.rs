//! Local master keys under `{config_dir}/keys`
//!
//! Layout:
//! ```text
//! keys/                       (0700)
//!   {key_id}.key              (0600, raw key bytes)
//!   {key_id}.meta.json        (0600, KeyMetadata)
//! ```
//!
//! Key material never leaves this directory. Rotation only mints a new key
//! and records the link on the old one; nothing is re-encrypted.

use std::io::Write;
use std::path::{Path, PathBuf};

use byod_core::config::set_owner_only;
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::MasterKey;

const KEY_EXT: &str = ".key";
const META_EXT: &str = ".meta.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub key_id: String,
    pub profile: String,
    pub key_size_bits: u32,
    pub created_at: DateTime<Utc>,
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_to: Option<String>,
}

impl KeyMetadata {
    pub fn is_rotated(&self) -> bool {
        self.rotated_to.is_some()
    }
}

/// File-backed master key store.
#[derive(Debug, Clone)]
pub struct KeyStore {
    keys_dir: PathBuf,
}

impl KeyStore {
    /// Open (creating if needed) the key directory under `config_dir`.
    pub fn open(config_dir: &Path) -> CryptoResult<Self> {
        let keys_dir = config_dir.join("keys");
        std::fs::create_dir_all(&keys_dir)?;
        if let Err(e) = set_owner_only(&keys_dir, 0o700) {
            warn!(dir = %keys_dir.display(), "could not restrict key directory: {e}");
        }
        Ok(Self { keys_dir })
    }

    pub fn keys_dir(&self) -> &Path {
        &self.keys_dir
    }

    fn key_path(&self, key_id: &str) -> PathBuf {
        self.keys_dir.join(format!("{key_id}{KEY_EXT}"))
    }

    fn meta_path(&self, key_id: &str) -> PathBuf {
        self.keys_dir.join(format!("{key_id}{META_EXT}"))
    }

    /// Mint a master key for `profile`. Returns the new key id,
    /// `{profile}-{YYYYmmddHHMMSS}`, suffixed `-{n}` when that second is taken.
    pub fn generate_master_key(&self, profile: &str, key_size_bits: u32) -> CryptoResult<String> {
        validate_profile(profile)?;
        if !matches!(key_size_bits, 128 | 192 | 256) {
            return Err(CryptoError::InvalidKey(format!(
                "key size must be 128, 192, or 256 bits, got {key_size_bits}"
            )));
        }

        let now = Utc::now();
        let key_id = self.unused_key_id(&format!("{profile}-{}", now.format("%Y%m%d%H%M%S")));

        let mut bytes = Zeroizing::new(vec![0u8; (key_size_bits / 8) as usize]);
        OsRng.fill_bytes(&mut bytes);

        let metadata = KeyMetadata {
            key_id: key_id.clone(),
            profile: profile.to_string(),
            key_size_bits,
            created_at: now,
            algorithm: format!("AES-{key_size_bits}"),
            rotated_at: None,
            rotated_to: None,
        };

        write_private(&self.key_path(&key_id), &bytes)?;
        self.write_metadata(&metadata)?;

        info!(key_id = %key_id, bits = key_size_bits, "generated master key");
        Ok(key_id)
    }

    fn unused_key_id(&self, base: &str) -> String {
        if !self.key_exists(base) && !self.meta_path(base).exists() {
            return base.to_string();
        }
        (1u32..)
            .map(|n| format!("{base}-{n}"))
            .find(|candidate| !self.key_exists(candidate) && !self.meta_path(candidate).exists())
            .unwrap_or_else(|| base.to_string())
    }

    pub fn get_master_key(&self, key_id: &str) -> CryptoResult<MasterKey> {
        let path = self.key_path(key_id);
        if !path.is_file() {
            return Err(CryptoError::KeyNotFound(key_id.to_string()));
        }
        MasterKey::from_bytes(std::fs::read(&path)?)
    }

    pub fn key_exists(&self, key_id: &str) -> bool {
        self.key_path(key_id).is_file()
    }

    pub fn get_key_metadata(&self, key_id: &str) -> CryptoResult<KeyMetadata> {
        let path = self.meta_path(key_id);
        if !path.is_file() {
            return Err(CryptoError::KeyNotFound(key_id.to_string()));
        }
        read_metadata(&path)
    }

    /// All key metadata, newest first. Unreadable metadata files are skipped.
    pub fn list_keys(&self) -> CryptoResult<Vec<KeyMetadata>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.keys_dir)? {
            let path = entry?.path();
            let is_meta = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(META_EXT));
            if !is_meta {
                continue;
            }
            match read_metadata(&path) {
                Ok(meta) => keys.push(meta),
                Err(e) => warn!(path = %path.display(), "skipping key metadata: {e}"),
            }
        }
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.key_id.cmp(&a.key_id)));
        Ok(keys)
    }

    /// Mint a successor to `old_key_id` of the same size and mark the old key
    /// rotated. Existing data stays encrypted under the old key.
    pub fn rotate_key(&self, old_key_id: &str, profile: &str) -> CryptoResult<String> {
        let mut old = self.get_key_metadata(old_key_id)?;
        let new_key_id = self.generate_master_key(profile, old.key_size_bits)?;

        old.rotated_at = Some(Utc::now());
        old.rotated_to = Some(new_key_id.clone());
        self.write_metadata(&old)?;

        info!(old = %old_key_id, new = %new_key_id, "rotated master key");
        Ok(new_key_id)
    }

    /// Destroy a key. Data encrypted under it becomes unrecoverable, so the
    /// caller must pass `confirm`.
    pub fn delete_key(&self, key_id: &str, confirm: bool) -> CryptoResult<()> {
        if !confirm {
            return Err(CryptoError::ConfirmationRequired(format!(
                "deleting {key_id} makes its data unrecoverable"
            )));
        }

        let key_path = self.key_path(key_id);
        let meta_path = self.meta_path(key_id);
        if !key_path.exists() && !meta_path.exists() {
            return Err(CryptoError::KeyNotFound(key_id.to_string()));
        }

        if key_path.exists() {
            let len = std::fs::metadata(&key_path)?.len() as usize;
            let mut noise = Zeroizing::new(vec![0u8; len]);
            OsRng.fill_bytes(&mut noise);
            let mut file = std::fs::OpenOptions::new().write(true).open(&key_path)?;
            file.write_all(&noise)?;
            file.sync_all()?;
            drop(file);
            std::fs::remove_file(&key_path)?;
        }
        if meta_path.exists() {
            std::fs::remove_file(&meta_path)?;
        }

        warn!(key_id = %key_id, "deleted master key");
        Ok(())
    }

    fn write_metadata(&self, metadata: &KeyMetadata) -> CryptoResult<()> {
        let json = serde_json::to_vec_pretty(metadata)
            .map_err(|e| CryptoError::Other(anyhow::anyhow!("key metadata: {e}")))?;
        write_private(&self.meta_path(&metadata.key_id), &json)
    }
}

fn read_metadata(path: &Path) -> CryptoResult<KeyMetadata> {
    let data = std::fs::read(path)?;
    serde_json::from_slice(&data)
        .map_err(|e| CryptoError::Malformed(format!("{}: {e}", path.display())))
}

/// Write via tmp + rename. The tmp file is created 0600, so key bytes are
/// never readable by anyone else, not even briefly.
fn write_private(path: &Path, data: &[u8]) -> CryptoResult<()> {
    let tmp = path.with_extension("tmp");
    // Leftover from an interrupted write; its mode is unknown.
    match std::fs::remove_file(&tmp) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
        _ => {}
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Profile names end up in file names; keep them to `[A-Za-z0-9_.-]`.
fn validate_profile(profile: &str) -> CryptoResult<()> {
    let ok = !profile.is_empty()
        && !profile.starts_with('.')
        && profile
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if ok {
        Ok(())
    } else {
        Err(CryptoError::InvalidKey(format!(
            "invalid profile name {profile:?}: use letters, digits, '_', '.', '-'"
        )))
    }
}
