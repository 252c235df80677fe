//! Job payloads: one opaque AEAD blob per submission, no manifest
//!
//! A single file is sent as-is; a directory or several files are bundled
//! into one tar.gz first. Results come back the same way and are told apart
//! by the gzip magic prefix alone.
//!
//! Job payloads are sealed WITHOUT associated data. The enclave decrypts
//! them that way, so binding a name here would make every job fail.

use std::path::{Component, Path, PathBuf};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::aead;
use crate::error::{CryptoError, CryptoResult};
use crate::keys::DataKey;

/// Bookkeeping file the enclave adds to result archives; never extracted.
pub const RESERVED_MANIFEST_NAME: &str = "__manifest__.json";
/// Where non-archive results are written.
pub const RAW_OUTPUT_NAME: &str = "output.bin";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Plaintext ready to seal.
pub struct Payload {
    /// Name the upload is derived from (file name, or `<dir>.tar.gz`)
    pub name: String,
    pub bytes: Zeroizing<Vec<u8>>,
    pub is_archive: bool,
}

impl Payload {
    pub fn upload_name(&self) -> String {
        format!("{}.enc", self.name)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("name", &self.name)
            .field("len", &self.bytes.len())
            .field("is_archive", &self.is_archive)
            .finish()
    }
}

/// Build the plaintext payload for `inputs`.
pub fn bundle(inputs: &[PathBuf]) -> CryptoResult<Payload> {
    match inputs {
        [] => Err(CryptoError::NoInputFiles(PathBuf::from("."))),
        [single] if single.is_file() => Ok(Payload {
            name: file_name(single),
            bytes: Zeroizing::new(std::fs::read(single)?),
            is_archive: false,
        }),
        [dir] => {
            let name = format!("{}.tar.gz", file_name(dir));
            Ok(Payload {
                name,
                bytes: build_archive(inputs)?,
                is_archive: true,
            })
        }
        _ => Ok(Payload {
            name: "input.tar.gz".to_string(),
            bytes: build_archive(inputs)?,
            is_archive: true,
        }),
    }
}

fn build_archive(inputs: &[PathBuf]) -> CryptoResult<Zeroizing<Vec<u8>>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for path in inputs {
        let name = file_name(path);
        if path.is_dir() {
            builder.append_dir_all(&name, path)?;
        } else if path.is_file() {
            builder.append_path_with_name(path, &name)?;
        } else {
            return Err(CryptoError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("input not found: {}", path.display()),
            )));
        }
    }

    let bytes = builder.into_inner()?.finish()?;
    debug!(inputs = inputs.len(), bytes = bytes.len(), "payload archived");
    Ok(Zeroizing::new(bytes))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string())
}

/// Seal a payload under the job DEK. No associated data; see module docs.
pub fn seal_payload(plaintext: &[u8], dek: &DataKey) -> CryptoResult<Vec<u8>> {
    aead::encrypt(dek.as_bytes(), plaintext, None)
}

/// Open a sealed job payload or job result.
pub fn open_payload(encoded: &[u8], dek: &DataKey) -> CryptoResult<Zeroizing<Vec<u8>>> {
    aead::decrypt(dek.as_bytes(), encoded, None).map(Zeroizing::new)
}

pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= GZIP_MAGIC.len() && bytes[..2] == GZIP_MAGIC
}

/// Write decrypted results under `dest` and return the written names.
///
/// gzip-prefixed plaintext is unpacked as a tar.gz, skipping the reserved
/// bookkeeping member. A member that would land outside `dest` aborts with
/// `PathTraversal`. An archive that turns out to be unreadable is written
/// raw to `output.bin` instead, as is any non-gzip plaintext.
pub fn extract_results(plaintext: &[u8], dest: &Path) -> CryptoResult<Vec<String>> {
    std::fs::create_dir_all(dest)?;

    if !is_gzip(plaintext) {
        write_raw(plaintext, dest)?;
        return Ok(vec![RAW_OUTPUT_NAME.to_string()]);
    }

    let mut extracted = Vec::new();
    match unpack_archive(plaintext, dest, &mut extracted) {
        Ok(()) => Ok(extracted),
        Err(CryptoError::Io(e)) => {
            warn!(error = %e, "result archive unreadable, writing raw output");
            write_raw(plaintext, dest)?;
            extracted.push(RAW_OUTPUT_NAME.to_string());
            Ok(extracted)
        }
        Err(e) => Err(e),
    }
}

fn unpack_archive(bytes: &[u8], dest: &Path, extracted: &mut Vec<String>) -> CryptoResult<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let name = path.to_string_lossy().into_owned();

        if is_reserved(&path) {
            debug!(member = %name, "skipping reserved member");
            continue;
        }
        if !stays_inside(&path) {
            return Err(CryptoError::PathTraversal(name));
        }

        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            let target = entry.link_name()?.map(|t| t.into_owned()).unwrap_or_default();
            // Symlinks resolve against the member's directory, hard links
            // against the archive root.
            let resolved = if entry_type.is_hard_link() {
                target.clone()
            } else {
                path.parent().unwrap_or(Path::new("")).join(&target)
            };
            if target.is_absolute() || !stays_inside(&resolved) {
                return Err(CryptoError::PathTraversal(name));
            }
        }

        if !entry.unpack_in(dest)? {
            return Err(CryptoError::PathTraversal(name));
        }
        if entry_type.is_file() {
            extracted.push(name);
        }
    }
    Ok(())
}

fn is_reserved(path: &Path) -> bool {
    let trimmed = path.strip_prefix(".").unwrap_or(path);
    trimmed == Path::new(RESERVED_MANIFEST_NAME)
}

/// True when `path` is relative and never climbs above its starting point.
fn stays_inside(path: &Path) -> bool {
    let mut depth: i64 = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

fn write_raw(plaintext: &[u8], dest: &Path) -> CryptoResult<()> {
    std::fs::write(dest.join(RAW_OUTPUT_NAME), plaintext)?;
    Ok(())
}

/// Member names of a tar.gz, without extracting.
pub fn list_archive(bytes: &[u8]) -> CryptoResult<Vec<String>> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        names.push(entry.path()?.to_string_lossy().into_owned());
    }
    Ok(names)
}
