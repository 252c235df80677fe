//! Progress events for the local companion UI
//!
//! The streaming variants run the same steps as [`submit`] and
//! [`get_results`], emitting [`JobEvent`]s on one unbounded channel per job.
//! The stream always ends with exactly one `complete` or `error` event, and
//! error text is passed through [`ByodError::public_message`] first: the UI is
//! an untrusted surface and never sees ARNs, key ids or account ids.
//!
//! Wire framing (`JobEvent::to_sse`):
//! ```text
//! event: progress
//! data: {"stage":"encrypting","percent":15,"message":"Encrypting (1.2 MB)..."}
//!
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use byod_core::{ByodError, ByodResult};
use byod_kms::KeyManagementBackend;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::error;

use crate::platform::JobPlatform;
use crate::retrieve::{get_results, GetOptions};
use crate::submit::{submit, SubmitRequest};
use crate::ProgressFn;

/// Upper bound on the plaintext a streaming submit will buffer.
pub const MAX_UPLOAD_BYTES: u64 = 500 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Progress {
        stage: String,
        percent: u8,
        message: String,
    },
    Complete(Value),
    Error {
        message: String,
    },
}

impl JobEvent {
    pub fn progress(stage: &str, percent: u8) -> Self {
        JobEvent::Progress {
            stage: stage.to_string(),
            percent,
            message: stage_message(stage, percent).to_string(),
        }
    }

    /// Sanitized error event; the full error goes to the log only.
    pub fn from_error(err: &ByodError) -> Self {
        JobEvent::Error {
            message: err.public_message(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Progress { .. } => "progress",
            JobEvent::Complete(_) => "complete",
            JobEvent::Error { .. } => "error",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            JobEvent::Progress {
                stage,
                percent,
                message,
            } => json!({ "stage": stage, "percent": percent, "message": message }),
            JobEvent::Complete(value) => value.clone(),
            JobEvent::Error { message } => json!({ "message": message }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::Progress { .. })
    }

    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name(), self.data())
    }
}

fn stage_message(stage: &str, percent: u8) -> &'static str {
    match (stage, percent) {
        ("receiving", _) => "Receiving files...",
        ("packaging", _) => "Packaging input files...",
        ("encrypting", p) if p < 30 => "Generating data key via KMS...",
        ("encrypting", _) => "Encrypting data with AES-256-GCM...",
        ("uploading_data", _) => "Uploading encrypted data...",
        ("uploading_key", _) => "Uploading wrapped key...",
        ("submitting", _) => "Creating job...",
        ("done", _) => "Job submitted!",
        ("checking", _) => "Checking job status...",
        ("downloading", p) if p < 35 => "Downloading encrypted results...",
        ("downloading", _) => "Downloading wrapped key...",
        ("unwrapping", p) if p < 60 => "Reading wrapped key...",
        ("unwrapping", _) => "Unwrapping key via KMS...",
        ("decrypting", _) => "Decrypting results...",
        ("extracting", _) => "Extracting results...",
        ("complete", _) => "Results decrypted",
        _ => "Working...",
    }
}

fn progress_sender(tx: &mpsc::UnboundedSender<JobEvent>) -> ProgressFn {
    let tx = tx.clone();
    Box::new(move |done, _total, stage| {
        let percent = u8::try_from(done.min(100)).unwrap_or(100);
        // A dropped receiver means the client went away; the job carries on.
        let _ = tx.send(JobEvent::progress(stage, percent));
    })
}

/// Total size of the files under `paths`, following directories.
pub fn input_size(paths: &[PathBuf]) -> ByodResult<u64> {
    fn walk(path: &Path) -> std::io::Result<u64> {
        let meta = std::fs::symlink_metadata(path)?;
        if meta.is_dir() {
            let mut total = 0;
            for entry in std::fs::read_dir(path)? {
                total += walk(&entry?.path())?;
            }
            Ok(total)
        } else {
            Ok(meta.len())
        }
    }
    paths
        .iter()
        .try_fold(0u64, |acc, p| -> ByodResult<u64> { Ok(acc + walk(p)?) })
}

/// Submit in the background, streaming progress.
pub fn submit_streaming(
    platform: Arc<dyn JobPlatform>,
    kms: Arc<dyn KeyManagementBackend>,
    request: SubmitRequest,
) -> mpsc::UnboundedReceiver<JobEvent> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let _ = tx.send(JobEvent::Progress {
            stage: "receiving".into(),
            percent: 5,
            message: format!("Received {} file(s)...", request.inputs.len()),
        });

        let progress = progress_sender(&tx);
        let outcome = async {
            let inputs = request.inputs.clone();
            let total = tokio::task::spawn_blocking(move || input_size(&inputs))
                .await
                .map_err(|e| ByodError::Other(anyhow::anyhow!("sizing task failed: {e}")))??;
            if total > MAX_UPLOAD_BYTES {
                return Err(ByodError::Validation(format!(
                    "Total upload size exceeds {} MB limit",
                    MAX_UPLOAD_BYTES / (1024 * 1024)
                )));
            }
            submit(platform.as_ref(), kms.as_ref(), &request, Some(&progress)).await
        }
        .await;

        match outcome {
            Ok(job) => {
                let _ = tx.send(JobEvent::progress("done", 100));
                let _ = tx.send(JobEvent::Complete(json!({
                    "job_id": job.job_id,
                    "status": job.status,
                })));
            }
            Err(e) => {
                error!(plugin = %request.plugin, "job submission failed: {e}");
                let _ = tx.send(JobEvent::from_error(&e));
            }
        }
    });

    rx
}

/// Download, decrypt and extract in the background, streaming progress.
pub fn get_results_streaming(
    platform: Arc<dyn JobPlatform>,
    kms: Arc<dyn KeyManagementBackend>,
    job_id: String,
    output: PathBuf,
    options: GetOptions,
) -> mpsc::UnboundedReceiver<JobEvent> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let progress = progress_sender(&tx);
        let outcome = get_results(
            platform.as_ref(),
            kms.as_ref(),
            &job_id,
            &output,
            options,
            Some(&progress),
        )
        .await;

        match outcome {
            Ok(summary) => {
                let _ = tx.send(JobEvent::progress("complete", 100));
                let data = serde_json::to_value(&summary).unwrap_or_else(|_| json!({ "job_id": job_id }));
                let _ = tx.send(JobEvent::Complete(data));
            }
            Err(e) => {
                error!(job_id = %job_id, "retrieving results failed: {e}");
                let _ = tx.send(JobEvent::from_error(&e));
            }
        }
    });

    rx
}
