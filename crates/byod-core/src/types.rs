use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// File name of the bridge manifest written by a results download.
pub const RESULTS_MANIFEST_NAME: &str = "results-manifest.json";
/// Encrypted results object, both remotely and on local disk.
pub const ENCRYPTED_RESULT_NAME: &str = "output.enc";
/// KMS-wrapped result key, both remotely and on local disk.
pub const WRAPPED_RESULT_KEY_NAME: &str = "output_key.bin";

/// Local view of a job's lifecycle.
///
/// The platform reports status as a free-form string. It is parsed into this
/// enum exactly once, at deserialization, and nothing downstream ever sees the
/// raw string again (except inside `Unknown`, for display).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Submitted,
    Downloading,
    Processing,
    Uploading,
    Completed,
    Failed,
    Cancelled,
    /// Direct-storage mode: no job record exists.
    NotFound,
    Unknown(String),
}

impl JobStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => JobStatus::Pending,
            "submitted" => JobStatus::Submitted,
            "downloading" => JobStatus::Downloading,
            "processing" => JobStatus::Processing,
            "uploading" => JobStatus::Uploading,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" | "canceled" => JobStatus::Cancelled,
            "not_found" => JobStatus::NotFound,
            other => JobStatus::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Submitted => "submitted",
            JobStatus::Downloading => "downloading",
            JobStatus::Processing => "processing",
            JobStatus::Uploading => "uploading",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::NotFound => "not_found",
            JobStatus::Unknown(raw) => raw,
        }
    }

    /// Completed, failed and cancelled never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn icon(&self) -> &'static str {
        match self {
            JobStatus::Pending => "⏳",
            JobStatus::Submitted => "📤",
            JobStatus::Downloading => "⬇️",
            JobStatus::Processing => "⚙️",
            JobStatus::Uploading => "⬆️",
            JobStatus::Completed => "✅",
            JobStatus::Failed => "❌",
            JobStatus::Cancelled => "🚫",
            JobStatus::NotFound => "❔",
            JobStatus::Unknown(_) => "•",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            JobStatus::Pending => "Waiting to start...",
            JobStatus::Submitted => "Job queued",
            JobStatus::Downloading => "Downloading encrypted data",
            JobStatus::Processing => "Processing in Nitro Enclave",
            JobStatus::Uploading => "Uploading encrypted results",
            JobStatus::Completed => "Job completed successfully!",
            JobStatus::Failed => "Job failed",
            JobStatus::Cancelled => "Job cancelled",
            JobStatus::NotFound => "Job not found",
            JobStatus::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for JobStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JobStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(JobStatus::parse(&raw))
    }
}

/// A submitted job as the client knows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    #[serde(default)]
    pub plugin_name: String,
    #[serde(default, alias = "input_s3_key")]
    pub input_ref: String,
    #[serde(default, alias = "wrapped_key_s3_key")]
    pub wrapped_key_ref: String,
    pub status: JobStatus,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Status report for one job (platform `GET /jobs/{id}` or derived from
/// storage in direct mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusInfo {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, alias = "plugin", skip_serializing_if = "Option::is_none")]
    pub plugin_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl JobStatusInfo {
    pub fn new(job_id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            error: None,
            created_at: None,
            completed_at: None,
            plugin_name: None,
            description: None,
        }
    }
}

/// Filter for job listings.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub limit: usize,
    pub status: Option<JobStatus>,
    pub plugin: Option<String>,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            limit: 20,
            status: None,
            plugin: None,
        }
    }
}

/// Everything needed to register a job once its payload is uploaded.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobRequest {
    pub plugin_name: String,
    pub input_s3_key: String,
    pub wrapped_key_s3_key: String,
    pub description: Option<String>,
    pub config: Option<serde_json::Value>,
    pub tags: BTreeMap<String, String>,
}

/// A processing plugin advertised by the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plugin {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub inputs: Vec<PluginInput>,
}

/// One declared input of a plugin. Only `type = "file"` inputs constrain
/// which files may be submitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginInput {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default = "default_input_kind")]
    pub kind: String,
    #[serde(default)]
    pub formats: Vec<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

fn default_input_kind() -> String {
    "file".to_string()
}

/// Bridges a results download and the later decrypt step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsManifest {
    pub job_id: String,
    pub encrypted_file: String,
    pub wrapped_key_file: String,
    pub kms_key_id: String,
    pub region: String,
    pub downloaded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_key_size: Option<u64>,
}

impl ResultsManifest {
    pub fn new(job_id: &str, kms_key_id: &str, region: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            encrypted_file: ENCRYPTED_RESULT_NAME.to_string(),
            wrapped_key_file: WRAPPED_RESULT_KEY_NAME.to_string(),
            kms_key_id: kms_key_id.to_string(),
            region: region.to_string(),
            downloaded_at: Utc::now(),
            encrypted_size: None,
            wrapped_key_size: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_statuses() {
        for s in [
            "pending",
            "submitted",
            "downloading",
            "processing",
            "uploading",
            "completed",
            "failed",
            "cancelled",
        ] {
            let status = JobStatus::parse(s);
            assert!(!matches!(status, JobStatus::Unknown(_)), "{s} should be known");
            assert_eq!(status.as_str(), s);
        }
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(JobStatus::parse(" COMPLETED "), JobStatus::Completed);
        assert_eq!(JobStatus::parse("Canceled"), JobStatus::Cancelled);
    }

    #[test]
    fn test_unknown_status_is_contained() {
        let status = JobStatus::parse("warming_up");
        assert_eq!(status, JobStatus::Unknown("warming_up".into()));
        assert!(!status.is_terminal());
        assert_eq!(status.icon(), "•");
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Failed.is_failure());
        assert!(!JobStatus::Completed.is_failure());
    }

    #[test]
    fn test_status_info_deserializes_open_string() {
        let json = r#"{"job_id":"j1","status":"processing","plugin":"demo-count"}"#;
        let info: JobStatusInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.status, JobStatus::Processing);
        assert_eq!(info.plugin_name.as_deref(), Some("demo-count"));
    }

    #[test]
    fn test_plugin_input_defaults_to_file() {
        let input: PluginInput = serde_json::from_str(r#"{"formats":["txt"]}"#).unwrap();
        assert_eq!(input.kind, "file");
        assert_eq!(input.formats, vec!["txt"]);
    }

    #[test]
    fn test_results_manifest_json_shape() {
        let manifest = ResultsManifest::new("job-1", "key-ref", "us-east-1");
        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["encrypted_file"], "output.enc");
        assert_eq!(value["wrapped_key_file"], "output_key.bin");
        assert!(value.get("encrypted_size").is_none());
        let back: ResultsManifest = serde_json::from_value(value).unwrap();
        assert_eq!(back, manifest);
    }
}
