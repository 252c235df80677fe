//! Result retrieval
//!
//! ```text
//! download_results:  status == completed ─► output.enc + output_key.bin + results-manifest.json
//! decrypt_results:   results-manifest.json ─► KMS Decrypt(output_key.bin) ─► open ─► extract
//! get_results:       both in one step; the manifest never touches disk
//! ```

use std::path::{Path, PathBuf};

use byod_core::types::{ResultsManifest, ENCRYPTED_RESULT_NAME, RESULTS_MANIFEST_NAME, WRAPPED_RESULT_KEY_NAME};
use byod_core::{ByodError, ByodResult, JobStatus};
use byod_crypto::{extract_results, open_payload};
use byod_kms::KeyManagementBackend;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::platform::JobPlatform;
use crate::submit::report;
use crate::ProgressFn;

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Leave `output.enc` and `output_key.bin` next to the results
    pub keep_encrypted: bool,
    /// Allow writing into a non-empty output directory
    pub overwrite: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetSummary {
    pub job_id: String,
    pub output_dir: PathBuf,
    pub files: Vec<String>,
    pub decrypted_size: usize,
}

/// Download the encrypted results of a completed job into `out` and write
/// the `results-manifest.json` that [`decrypt_results`] picks up.
pub async fn download_results<P: JobPlatform + ?Sized>(
    platform: &P,
    job_id: &str,
    out: &Path,
    overwrite: bool,
) -> ByodResult<ResultsManifest> {
    ensure_writable(out, overwrite).await?;
    require_completed(platform, job_id).await?;

    let manifest = fetch_results(platform, job_id, out, None).await?;
    let rendered = serde_json::to_vec_pretty(&manifest).map_err(|e| ByodError::Other(e.into()))?;
    let manifest_path = out.join(RESULTS_MANIFEST_NAME);
    tokio::fs::write(&manifest_path, rendered).await?;
    info!(job_id, path = %manifest_path.display(), "results manifest written");
    Ok(manifest)
}

/// Decrypt results previously fetched by [`download_results`] into `output`.
/// Returns the names of the files written.
pub async fn decrypt_results<K: KeyManagementBackend + ?Sized>(
    kms: &K,
    results_dir: &Path,
    output: &Path,
) -> ByodResult<Vec<String>> {
    let manifest_path = results_dir.join(RESULTS_MANIFEST_NAME);
    let raw = match tokio::fs::read(&manifest_path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ByodError::MissingArtifact {
                path: manifest_path,
                hint: "Run 'byod retrieve' first to download results.".into(),
            })
        }
        Err(e) => return Err(e.into()),
    };
    let manifest: ResultsManifest = serde_json::from_slice(&raw)
        .map_err(|e| ByodError::Validation(format!("{} is not a valid results manifest: {e}", manifest_path.display())))?;

    let (files, _) = decrypt_with_manifest(kms, results_dir, &manifest, output, None).await?;
    Ok(files)
}

/// Download, unwrap, decrypt and extract in one step.
///
/// Safe to repeat with `overwrite`: every run rewrites the same files.
pub async fn get_results<P, K>(
    platform: &P,
    kms: &K,
    job_id: &str,
    output: &Path,
    options: GetOptions,
    progress: Option<&ProgressFn>,
) -> ByodResult<GetSummary>
where
    P: JobPlatform + ?Sized,
    K: KeyManagementBackend + ?Sized,
{
    ensure_writable(output, options.overwrite).await?;

    report(progress, 5, "checking");
    require_completed(platform, job_id).await?;

    // Intermediates live outside `output` so an archive member that shares
    // their names is never clobbered or cleaned up.
    let staging = tempfile::tempdir()?;
    let manifest = fetch_results(platform, job_id, staging.path(), progress).await?;
    let result = decrypt_with_manifest(kms, staging.path(), &manifest, output, progress).await;

    if options.keep_encrypted {
        for name in [&manifest.encrypted_file, &manifest.wrapped_key_file] {
            tokio::fs::copy(staging.path().join(name), output.join(name)).await?;
        }
    }
    if let Err(e) = staging.close() {
        warn!("could not remove staging directory: {e}");
    }

    let (files, decrypted_size) = result?;
    info!(job_id, files = files.len(), bytes = decrypted_size, "results retrieved");
    Ok(GetSummary {
        job_id: job_id.to_string(),
        output_dir: output.to_path_buf(),
        files,
        decrypted_size,
    })
}

/// Deprecated alias of [`download_results`].
#[deprecated(note = "use get_results, or download_results directly")]
pub async fn retrieve<P: JobPlatform + ?Sized>(
    platform: &P,
    job_id: &str,
    out: &Path,
    overwrite: bool,
) -> ByodResult<ResultsManifest> {
    warn!("'byod retrieve' is deprecated. Use 'byod get <job-id> -o <dir>' instead.");
    download_results(platform, job_id, out, overwrite).await
}

/// Deprecated alias of [`decrypt_results`].
#[deprecated(note = "use get_results, or decrypt_results directly")]
pub async fn decrypt<K: KeyManagementBackend + ?Sized>(
    kms: &K,
    results_dir: &Path,
    output: &Path,
) -> ByodResult<Vec<String>> {
    warn!("'byod decrypt' is deprecated. Use 'byod get <job-id> -o <dir>' instead.");
    decrypt_results(kms, results_dir, output).await
}

async fn require_completed<P: JobPlatform + ?Sized>(platform: &P, job_id: &str) -> ByodResult<()> {
    let info = platform.job_status(job_id).await?;
    match &info.status {
        JobStatus::Completed => Ok(()),
        JobStatus::NotFound => Err(ByodError::NotFound(format!("job {job_id}"))),
        failed @ (JobStatus::Failed | JobStatus::Cancelled) => Err(ByodError::JobFailed {
            job_id: job_id.to_string(),
            status: failed.to_string(),
            error: info.error.clone().unwrap_or_else(|| "Unknown error".into()),
        }),
        other => Err(ByodError::JobNotReady {
            job_id: job_id.to_string(),
            status: other.to_string(),
        }),
    }
}

async fn ensure_writable(dir: &Path, overwrite: bool) -> ByodResult<()> {
    if !overwrite && dir_has_entries(dir).await? {
        return Err(ByodError::Validation(format!(
            "Output directory {} is not empty. Use --overwrite.",
            dir.display()
        )));
    }
    Ok(())
}

async fn dir_has_entries(dir: &Path) -> ByodResult<bool> {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => Ok(entries.next_entry().await?.is_some()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Write both result objects into `dir` and describe them.
async fn fetch_results<P: JobPlatform + ?Sized>(
    platform: &P,
    job_id: &str,
    dir: &Path,
    progress: Option<&ProgressFn>,
) -> ByodResult<ResultsManifest> {
    tokio::fs::create_dir_all(dir).await?;

    report(progress, 15, "downloading");
    let encrypted = platform.download_result(job_id, ENCRYPTED_RESULT_NAME).await?;
    tokio::fs::write(dir.join(ENCRYPTED_RESULT_NAME), &encrypted).await?;
    debug!(job_id, bytes = encrypted.len(), "saved encrypted results");

    report(progress, 35, "downloading");
    let wrapped = platform.download_result(job_id, WRAPPED_RESULT_KEY_NAME).await?;
    tokio::fs::write(dir.join(WRAPPED_RESULT_KEY_NAME), &wrapped).await?;

    let mut manifest = ResultsManifest::new(job_id, &platform.kms_key_ref().await?, &platform.region().await?);
    manifest.encrypted_size = Some(encrypted.len() as u64);
    manifest.wrapped_key_size = Some(wrapped.len() as u64);
    Ok(manifest)
}

/// Returns the extracted names and the plaintext size.
async fn decrypt_with_manifest<K: KeyManagementBackend + ?Sized>(
    kms: &K,
    results_dir: &Path,
    manifest: &ResultsManifest,
    output: &Path,
    progress: Option<&ProgressFn>,
) -> ByodResult<(Vec<String>, usize)> {
    let key_path = results_dir.join(&manifest.wrapped_key_file);
    let enc_path = results_dir.join(&manifest.encrypted_file);
    for path in [&key_path, &enc_path] {
        if !tokio::fs::try_exists(path).await? {
            return Err(ByodError::MissingArtifact {
                path: path.clone(),
                hint: "Results may be incomplete; download them again.".into(),
            });
        }
    }

    report(progress, 50, "unwrapping");
    let wrapped = tokio::fs::read(&key_path).await?;
    report(progress, 60, "unwrapping");
    let dek = kms.decrypt(&wrapped, &manifest.kms_key_id).await?;

    report(progress, 75, "decrypting");
    let encrypted = tokio::fs::read(&enc_path).await?;
    let plaintext = tokio::task::spawn_blocking(move || {
        let opened = open_payload(&encrypted, &dek);
        drop(dek);
        opened
    })
    .await
    .map_err(|e| ByodError::Other(anyhow::anyhow!("decryption task failed: {e}")))??;
    let decrypted_size = plaintext.len();

    report(progress, 88, "extracting");
    let dest = output.to_path_buf();
    let files = tokio::task::spawn_blocking(move || extract_results(&plaintext, &dest))
        .await
        .map_err(|e| ByodError::Other(anyhow::anyhow!("extraction task failed: {e}")))??;

    info!(job_id = %manifest.job_id, files = files.len(), "results decrypted");
    Ok((files, decrypted_size))
}
