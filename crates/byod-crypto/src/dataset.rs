//! Dataset encryption: a file or directory tree under one DEK plus a manifest

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::aead;
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{generate_dek, unwrap_dek, wrap_dek, DataKey, MasterKey};
use crate::manifest::{EncryptionManifest, FileEntry, MANIFEST_FILE_NAME};
use crate::NONCE_SIZE;

/// Progress callback: (files_done, files_total, current file name)
pub type ProgressFn = Box<dyn Fn(u64, u64, &str) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct EncryptOptions {
    /// Keep only files whose name matches one of these globs
    pub include: Vec<String>,
    /// Then drop files whose name matches one of these globs
    pub exclude: Vec<String>,
    /// Keep paths relative to the input directory instead of flattening
    pub preserve_structure: bool,
}

#[derive(Debug, Clone)]
pub struct EncryptSummary {
    pub files_encrypted: usize,
    pub total_size_bytes: u64,
    pub manifest_path: PathBuf,
    pub key_id: String,
}

#[derive(Debug, Clone)]
pub struct DecryptSummary {
    pub files_decrypted: usize,
    pub total_size_bytes: u64,
    pub verified: bool,
}

/// Encrypt `input` (a file or a directory) into `output`.
///
/// One DEK covers the whole dataset; it is wrapped under `master` with
/// `key_id` bound as associated data. Each file is encrypted separately with
/// its relative name as associated data. The manifest is written only after
/// every member is on disk.
pub fn encrypt_path(
    input: &Path,
    output: &Path,
    master: &MasterKey,
    key_id: &str,
    options: &EncryptOptions,
    progress: Option<&ProgressFn>,
) -> CryptoResult<EncryptSummary> {
    let files = if input.is_file() {
        vec![input.to_path_buf()]
    } else {
        collect_files(input, &options.include, &options.exclude)?
    };
    if files.is_empty() {
        return Err(CryptoError::NoInputFiles(input.to_path_buf()));
    }

    let names = member_names(input, &files, options.preserve_structure)?;

    let dek = generate_dek();
    let wrapped = wrap_dek(&dek, master, key_id)?;

    std::fs::create_dir_all(output)?;
    let total = files.len() as u64;
    let mut entries = Vec::with_capacity(files.len());

    for (i, (path, name)) in files.iter().zip(&names).enumerate() {
        let entry = encrypt_member(path, name, output, &dek)?;
        debug!(file = %name, size = entry.original_size, "encrypted");
        entries.push(entry);
        if let Some(cb) = progress {
            cb(i as u64 + 1, total, name);
        }
    }

    let manifest = EncryptionManifest::new(key_id, &wrapped, entries);
    let manifest_path = output.join(MANIFEST_FILE_NAME);
    std::fs::write(&manifest_path, manifest.to_bytes()?)?;

    info!(
        files = manifest.total_files,
        bytes = manifest.total_size_bytes,
        output = %output.display(),
        "dataset encrypted"
    );

    Ok(EncryptSummary {
        files_encrypted: manifest.total_files,
        total_size_bytes: manifest.total_size_bytes,
        manifest_path,
        key_id: key_id.to_string(),
    })
}

/// Decrypt a dataset written by [`encrypt_path`] into `output`.
///
/// With `verify`, each recovered plaintext is hashed and compared with the
/// manifest; a disagreement is `ChecksumMismatch`, separate from the
/// `Authentication` error a tampered ciphertext produces.
pub fn decrypt_path(
    encrypted_dir: &Path,
    output: &Path,
    master: &MasterKey,
    verify: bool,
    progress: Option<&ProgressFn>,
) -> CryptoResult<DecryptSummary> {
    let manifest = EncryptionManifest::load(encrypted_dir)?;
    let dek = unwrap_dek(&manifest.wrapped_dek()?, master, &manifest.key_id)?;

    std::fs::create_dir_all(output)?;
    let total = manifest.files.len() as u64;
    let mut total_size_bytes = 0u64;

    for (i, entry) in manifest.files.iter().enumerate() {
        let plaintext = decrypt_member(encrypted_dir, entry, &dek, verify)?;
        let out_file = output.join(checked_relative(&entry.original_name)?);
        if let Some(parent) = out_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&out_file, plaintext.as_slice())?;
        total_size_bytes += plaintext.len() as u64;
        if let Some(cb) = progress {
            cb(i as u64 + 1, total, &entry.original_name);
        }
    }

    info!(
        files = manifest.files.len(),
        bytes = total_size_bytes,
        verified = verify,
        output = %output.display(),
        "dataset decrypted"
    );

    Ok(DecryptSummary {
        files_decrypted: manifest.files.len(),
        total_size_bytes,
        verified: verify,
    })
}

/// Decrypt one manifest member without writing it anywhere.
pub fn decrypt_member(
    encrypted_dir: &Path,
    entry: &FileEntry,
    dek: &DataKey,
    verify: bool,
) -> CryptoResult<Zeroizing<Vec<u8>>> {
    let enc_path = encrypted_dir.join(checked_relative(&entry.encrypted_name)?);
    let encoded = std::fs::read(&enc_path)?;

    let plaintext = aead::decrypt(
        dek.as_bytes(),
        &encoded,
        Some(entry.original_name.as_bytes()),
    )
    .map_err(|e| match e {
        CryptoError::Authentication(_) => CryptoError::Authentication(format!(
            "{}: wrong key or tampered ciphertext",
            entry.original_name
        )),
        other => other,
    })?;
    let plaintext = Zeroizing::new(plaintext);

    if verify {
        let actual = sha256_hex(&plaintext);
        if !actual.eq_ignore_ascii_case(&entry.checksum) {
            return Err(CryptoError::ChecksumMismatch {
                file: entry.original_name.clone(),
                expected: entry.checksum.clone(),
                actual,
            });
        }
    }
    Ok(plaintext)
}

/// Unwrap the dataset DEK recorded in a manifest.
pub fn unwrap_manifest_dek(
    manifest: &EncryptionManifest,
    master: &MasterKey,
) -> CryptoResult<DataKey> {
    unwrap_dek(&manifest.wrapped_dek()?, master, &manifest.key_id)
}

fn encrypt_member(path: &Path, name: &str, output: &Path, dek: &DataKey) -> CryptoResult<FileEntry> {
    let plaintext = Zeroizing::new(std::fs::read(path)?);
    let checksum = sha256_hex(&plaintext);

    let encoded = aead::encrypt(dek.as_bytes(), &plaintext, Some(name.as_bytes()))?;

    let encrypted_name = format!("{name}.enc");
    let out_file = output.join(checked_relative(&encrypted_name)?);
    if let Some(parent) = out_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&out_file, &encoded)?;

    Ok(FileEntry {
        original_name: name.to_string(),
        encrypted_name,
        original_size: plaintext.len() as u64,
        encrypted_size: encoded.len() as u64,
        checksum,
        nonce: hex::encode(&encoded[..NONCE_SIZE]),
    })
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Collect regular files under `root`, recursively.
///
/// Include globs narrow the set first, then exclude globs remove from it.
/// Both match the file name only. Output is sorted and de-duplicated.
pub fn collect_files(root: &Path, include: &[String], exclude: &[String]) -> CryptoResult<Vec<PathBuf>> {
    let include = compile_patterns(include);
    let exclude = compile_patterns(exclude);

    let mut all = Vec::new();
    walk(root, &mut all)?;

    let files: BTreeSet<PathBuf> = all
        .into_iter()
        .filter(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            (include.is_empty() || include.iter().any(|p| p.matches(&name)))
                && !exclude.iter().any(|p| p.matches(&name))
        })
        .collect();

    Ok(files.into_iter().collect())
}

fn compile_patterns(patterns: &[String]) -> Vec<glob::Pattern> {
    patterns
        .iter()
        .filter_map(|p| match glob::Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!(pattern = %p, error = %e, "ignoring invalid glob pattern");
                None
            }
        })
        .collect()
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> CryptoResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}

/// Manifest names for each collected file: relative `/`-separated paths when
/// preserving structure, bare file names otherwise.
fn member_names(input: &Path, files: &[PathBuf], preserve_structure: bool) -> CryptoResult<Vec<String>> {
    let mut seen = BTreeSet::new();
    let mut names = Vec::with_capacity(files.len());

    for path in files {
        let name = if preserve_structure && input.is_dir() {
            let rel = path
                .strip_prefix(input)
                .map_err(|e| CryptoError::Other(anyhow::anyhow!("{}: {e}", path.display())))?;
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        } else {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };

        if !seen.insert(name.clone()) {
            return Err(CryptoError::Other(anyhow::anyhow!(
                "two input files flatten to the same name '{name}'; use preserve_structure"
            )));
        }
        names.push(name);
    }
    Ok(names)
}

/// Reject absolute paths and `..` so manifest names stay inside their root.
fn checked_relative(name: &str) -> CryptoResult<PathBuf> {
    let path = Path::new(name);
    let safe = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !safe {
        return Err(CryptoError::PathTraversal(name.to_string()));
    }
    Ok(path.to_path_buf())
}
