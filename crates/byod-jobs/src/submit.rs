//! Job submission
//!
//! The DEK comes from the hosted KMS (`GenerateDataKey`), so the enclave can
//! unwrap it under attestation. Its plaintext lives only in a [`DataKey`]
//! handle that is dropped, and wiped, as soon as the payload is sealed, on
//! every path out of [`submit`].
//!
//! [`DataKey`]: byod_crypto::DataKey

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use byod_core::types::{Job, JobRequest};
use byod_core::{ByodError, ByodResult};
use byod_crypto::{bundle, seal_payload};
use byod_kms::KeyManagementBackend;
use tracing::{debug, info, warn};

use crate::platform::JobPlatform;
use crate::validation::{find_plugin, validate_files_for_plugin};
use crate::ProgressFn;

#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub plugin: String,
    /// One file, one directory, or several files (bundled as `input.tar.gz`)
    pub inputs: Vec<PathBuf>,
    pub description: Option<String>,
    pub config: Option<serde_json::Value>,
    pub tags: BTreeMap<String, String>,
}

pub(crate) fn report(progress: Option<&ProgressFn>, percent: u64, stage: &str) {
    if let Some(progress) = progress {
        progress(percent, 100, stage);
    }
}

/// Encrypt `request.inputs` client-side, upload them and register the job.
///
/// `progress` receives `(percent, 100, stage)` for each step.
pub async fn submit<P, K>(
    platform: &P,
    kms: &K,
    request: &SubmitRequest,
    progress: Option<&ProgressFn>,
) -> ByodResult<Job>
where
    P: JobPlatform + ?Sized,
    K: KeyManagementBackend + ?Sized,
{
    if request.inputs.is_empty() {
        return Err(ByodError::Validation("no input files given".into()));
    }
    for input in &request.inputs {
        if !input.exists() {
            return Err(ByodError::NotFound(format!("input path {}", input.display())));
        }
    }

    validate_inputs(platform, request).await?;

    let key_ref = platform.kms_key_ref().await?;
    let generated = kms.generate_data_key(&key_ref).await?;
    let wrapped_key = generated.wrapped;
    let dek = generated.key;

    report(progress, 10, "packaging");
    let inputs = request.inputs.clone();
    let packed = tokio::task::spawn_blocking(move || {
        let payload = bundle(&inputs)?;
        Ok::<_, ByodError>((payload, dek))
    })
    .await
    .map_err(|e| ByodError::Other(anyhow::anyhow!("packaging task failed: {e}")))??;
    let (payload, dek) = packed;

    report(progress, 15, "encrypting");
    let upload_name = payload.upload_name();
    let plaintext_len = payload.len();
    let sealed = tokio::task::spawn_blocking(move || {
        let sealed = seal_payload(&payload.bytes, &dek);
        drop(dek);
        sealed
    })
    .await
    .map_err(|e| ByodError::Other(anyhow::anyhow!("encryption task failed: {e}")))??;
    debug!(plaintext = plaintext_len, sealed = sealed.len(), "payload sealed");
    report(progress, 30, "encrypting");

    let hint = platform.job_hint(&request.plugin);

    report(progress, 45, "uploading_data");
    let input_ref = platform.upload_input(&hint, &upload_name, sealed).await?;

    report(progress, 65, "uploading_key");
    let wrapped_ref = platform.upload_wrapped_key(&hint, wrapped_key).await?;

    report(progress, 85, "submitting");
    let job = platform
        .register_job(&JobRequest {
            plugin_name: request.plugin.clone(),
            input_s3_key: input_ref,
            wrapped_key_s3_key: wrapped_ref,
            description: request.description.clone(),
            config: request.config.clone(),
            tags: request.tags.clone(),
        })
        .await?;

    info!(job_id = %job.job_id, plugin = %request.plugin, bytes = plaintext_len, "job submitted");
    Ok(job)
}

/// Plugin and file-type checks. A platform that cannot list plugins skips
/// them rather than blocking the submission.
async fn validate_inputs<P: JobPlatform + ?Sized>(platform: &P, request: &SubmitRequest) -> ByodResult<()> {
    let plugins = match platform.plugins().await {
        Ok(plugins) => plugins,
        Err(e) => {
            warn!("could not list plugins, skipping file-type validation: {e}");
            return Ok(());
        }
    };
    if plugins.is_empty() {
        return Ok(());
    }

    let plugin = find_plugin(&plugins, &request.plugin)?;
    let names = submitted_file_names(&request.inputs)?;
    let errors = validate_files_for_plugin(&names, &plugin.inputs);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ByodError::Validation(format!(
            "File type validation failed:\n  {}",
            errors.join("\n  ")
        )))
    }
}

/// File names a plugin will see: a directory contributes its direct files.
pub fn submitted_file_names(inputs: &[PathBuf]) -> ByodResult<Vec<String>> {
    let mut names = Vec::new();
    for input in inputs {
        if input.is_dir() {
            for entry in std::fs::read_dir(input)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
        } else {
            names.push(display_name(input));
        }
    }
    names.sort();
    Ok(names)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submitted_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let samples = dir.path().join("samples");
        std::fs::create_dir_all(samples.join("nested")).unwrap();
        std::fs::write(samples.join("b.fastq"), b"@r1").unwrap();
        std::fs::write(samples.join("a.fastq"), b"@r2").unwrap();
        std::fs::write(samples.join("nested/c.fastq"), b"@r3").unwrap();
        let single = dir.path().join("notes.txt");
        std::fs::write(&single, b"hi").unwrap();

        let names = submitted_file_names(&[samples, single]).unwrap();
        assert_eq!(names, vec!["a.fastq", "b.fastq", "notes.txt"]);
    }
}
