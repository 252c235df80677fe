//! Direct-to-bucket job backend
//!
//! Used when no platform API is configured. The enclave watches the data
//! bucket for job records and writes results back under `results/`:
//! ```text
//! data bucket                          results bucket
//!   data/{id}/input.enc                  results/{id}/output.enc
//!   data/{id}/wrapped_key.bin            results/{id}/output_key.bin
//!   jobs/{id}.json  (job record)
//! ```
//! Status is derived from object presence alone: no record is `not_found`,
//! any result object is `completed`, anything else is `submitted`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use byod_core::types::{Job, JobFilter, JobRequest, JobStatusInfo, Plugin};
use byod_core::{ByodError, ByodResult, JobStatus};
use byod_storage::BucketOperators;
use chrono::{SecondsFormat, Utc};
use opendal::{ErrorKind, Operator};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::JobPlatform;

const INPUT_OBJECT: &str = "input.enc";
const WRAPPED_KEY_OBJECT: &str = "wrapped_key.bin";

/// Job record written to `jobs/{id}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub user_id: String,
    pub plugin_name: String,
    pub input_s3_key: String,
    pub output_s3_key: String,
    pub wrapped_key_s3_key: String,
    pub created_at: String,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl JobRecord {
    fn description(&self) -> Option<String> {
        self.config
            .get("description")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

pub struct StoragePlatform {
    data: Operator,
    results: Operator,
    kms_key_ref: String,
    region: String,
    user_id: String,
}

impl StoragePlatform {
    pub fn new(buckets: BucketOperators, kms_key_ref: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            data: buckets.data,
            results: buckets.results,
            kms_key_ref: kms_key_ref.into(),
            region: region.into(),
            user_id: std::env::var("USER").unwrap_or_else(|_| "cli-user".to_string()),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn input_key(job_id: &str) -> String {
        format!("data/{job_id}/{INPUT_OBJECT}")
    }

    pub fn wrapped_key_key(job_id: &str) -> String {
        format!("data/{job_id}/{WRAPPED_KEY_OBJECT}")
    }

    pub fn record_key(job_id: &str) -> String {
        format!("jobs/{job_id}.json")
    }

    pub fn result_key(job_id: &str, file: &str) -> String {
        format!("results/{job_id}/{file}")
    }

    async fn read_record(&self, job_id: &str) -> ByodResult<Option<JobRecord>> {
        match self.data.read(&Self::record_key(job_id)).await {
            Ok(buf) => {
                let record = serde_json::from_slice(&buf.to_vec()).map_err(|e| {
                    ByodError::Storage(format!("job record for {job_id} is not valid JSON: {e}"))
                })?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error("reading job record", e)),
        }
    }

    /// Result objects for `job_id` and the newest modification time among them.
    async fn result_objects(&self, job_id: &str) -> ByodResult<(usize, Option<String>)> {
        let prefix = format!("results/{job_id}/");
        let entries = match self.results.list(&prefix).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((0, None)),
            Err(e) => return Err(storage_error("listing results", e)),
        };

        let mut count = 0;
        let mut latest: Option<String> = None;
        for entry in entries {
            let rel = entry.path().strip_prefix(&prefix).unwrap_or(entry.path());
            if rel.is_empty() || rel.ends_with('/') {
                continue;
            }
            count += 1;
            if let Some(modified) = entry.metadata().last_modified() {
                let modified = modified.to_string();
                latest = Some(latest.map_or(modified.clone(), |l| l.max(modified)));
            }
        }
        Ok((count, latest))
    }
}

/// Job id from a `data/{id}/input.enc` key.
fn job_id_from_input_key(key: &str) -> Option<&str> {
    key.strip_prefix("data/")?
        .strip_suffix(&format!("/{INPUT_OBJECT}"))
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

fn storage_error(action: &str, err: opendal::Error) -> ByodError {
    ByodError::Storage(format!("{action}: {err}"))
}

#[async_trait]
impl JobPlatform for StoragePlatform {
    async fn upload_input(&self, job_hint: &str, payload_name: &str, bytes: Vec<u8>) -> ByodResult<String> {
        let key = Self::input_key(job_hint);
        let len = bytes.len();
        self.data
            .write(&key, bytes)
            .await
            .map_err(|e| storage_error("uploading encrypted input", e))?;
        info!(job_id = %job_hint, payload = %payload_name, bytes = len, "uploaded encrypted input");
        Ok(key)
    }

    async fn upload_wrapped_key(&self, job_hint: &str, bytes: Vec<u8>) -> ByodResult<String> {
        let key = Self::wrapped_key_key(job_hint);
        self.data
            .write(&key, bytes)
            .await
            .map_err(|e| storage_error("uploading wrapped key", e))?;
        debug!(job_id = %job_hint, "uploaded wrapped key");
        Ok(key)
    }

    async fn register_job(&self, request: &JobRequest) -> ByodResult<Job> {
        let job_id = job_id_from_input_key(&request.input_s3_key)
            .ok_or_else(|| {
                ByodError::Validation(format!(
                    "input key '{}' is not in the data/{{job_id}}/{INPUT_OBJECT} layout",
                    request.input_s3_key
                ))
            })?
            .to_string();

        let mut config = serde_json::Map::new();
        config.insert(
            "description".into(),
            request
                .description
                .clone()
                .unwrap_or_else(|| format!("{} job", request.plugin_name))
                .into(),
        );
        if let Some(serde_json::Value::Object(extra)) = &request.config {
            config.extend(extra.clone());
        }

        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let record = JobRecord {
            job_id: job_id.clone(),
            user_id: self.user_id.clone(),
            plugin_name: request.plugin_name.clone(),
            input_s3_key: request.input_s3_key.clone(),
            output_s3_key: Self::result_key(&job_id, byod_core::types::ENCRYPTED_RESULT_NAME),
            wrapped_key_s3_key: request.wrapped_key_s3_key.clone(),
            created_at: created_at.clone(),
            config,
            tags: request.tags.clone(),
        };
        let body = serde_json::to_vec_pretty(&record).map_err(|e| ByodError::Other(e.into()))?;
        self.data
            .write(&Self::record_key(&job_id), body)
            .await
            .map_err(|e| storage_error("writing job record", e))?;
        info!(job_id = %job_id, plugin = %request.plugin_name, "job record written");

        Ok(Job {
            job_id,
            plugin_name: request.plugin_name.clone(),
            input_ref: request.input_s3_key.clone(),
            wrapped_key_ref: request.wrapped_key_s3_key.clone(),
            status: JobStatus::Submitted,
            created_at: Some(created_at),
            completed_at: None,
            error: None,
        })
    }

    async fn job_status(&self, job_id: &str) -> ByodResult<JobStatusInfo> {
        let Some(record) = self.read_record(job_id).await? else {
            return Ok(JobStatusInfo::new(job_id, JobStatus::NotFound));
        };

        let mut info = JobStatusInfo::new(job_id, JobStatus::Submitted);
        info.plugin_name = Some(record.plugin_name.clone());
        info.created_at = Some(record.created_at.clone());
        info.description = record.description();

        let (count, latest) = self.result_objects(job_id).await?;
        if count > 0 {
            info.status = JobStatus::Completed;
            info.completed_at = latest;
        }
        Ok(info)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> ByodResult<Vec<Job>> {
        let entries = match self.data.list("jobs/").await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_error("listing job records", e)),
        };

        let mut jobs = Vec::new();
        for entry in entries {
            let Some(job_id) = entry
                .path()
                .strip_prefix("jobs/")
                .and_then(|name| name.strip_suffix(".json"))
                .filter(|id| !id.is_empty())
            else {
                continue;
            };
            let Some(record) = (match self.read_record(job_id).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(job_id, "skipping unreadable job record: {e}");
                    continue;
                }
            }) else {
                continue;
            };
            if filter.plugin.as_ref().is_some_and(|p| *p != record.plugin_name) {
                continue;
            }

            let status = self.job_status(job_id).await?;
            if filter.status.as_ref().is_some_and(|s| *s != status.status) {
                continue;
            }
            jobs.push(Job {
                job_id: record.job_id,
                plugin_name: record.plugin_name,
                input_ref: record.input_s3_key,
                wrapped_key_ref: record.wrapped_key_s3_key,
                status: status.status,
                created_at: Some(record.created_at),
                completed_at: status.completed_at,
                error: None,
            });
        }

        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.job_id.cmp(&a.job_id)));
        jobs.truncate(filter.limit);
        Ok(jobs)
    }

    async fn download_result(&self, job_id: &str, file: &str) -> ByodResult<Vec<u8>> {
        match self.results.read(&Self::result_key(job_id, file)).await {
            Ok(buf) => Ok(buf.to_vec()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ByodError::NotFound(format!(
                "{file} for job {job_id}. The job may still be processing."
            ))),
            Err(e) => Err(storage_error("downloading result", e)),
        }
    }

    async fn plugins(&self) -> ByodResult<Vec<Plugin>> {
        Ok(Vec::new())
    }

    async fn kms_key_ref(&self) -> ByodResult<String> {
        if self.kms_key_ref.is_empty() {
            return Err(ByodError::Config(
                "no KMS key configured; run `byod setup` first".to_string(),
            ));
        }
        Ok(self.kms_key_ref.clone())
    }

    async fn region(&self) -> ByodResult<String> {
        Ok(self.region.clone())
    }

    async fn check_ready(&self) -> ByodResult<()> {
        for op in [&self.data, &self.results] {
            byod_storage::check_health(op)
                .await
                .map_err(|e| ByodError::Storage(format!("{e:#}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_platform() -> StoragePlatform {
        let data = Operator::new(opendal::services::Memory::default())
            .expect("memory operator")
            .finish();
        let results = Operator::new(opendal::services::Memory::default())
            .expect("memory operator")
            .finish();
        StoragePlatform::new(BucketOperators { data, results }, "alias/test", "us-east-1")
            .with_user("tester")
    }

    fn request(job_id: &str) -> JobRequest {
        JobRequest {
            plugin_name: "demo-count".into(),
            input_s3_key: StoragePlatform::input_key(job_id),
            wrapped_key_s3_key: StoragePlatform::wrapped_key_key(job_id),
            description: None,
            config: Some(serde_json::json!({"threshold": 3})),
            tags: BTreeMap::from([("experiment".to_string(), "exp001".to_string())]),
        }
    }

    #[test]
    fn test_job_id_from_input_key() {
        assert_eq!(job_id_from_input_key("data/j-1/input.enc"), Some("j-1"));
        assert_eq!(job_id_from_input_key("data//input.enc"), None);
        assert_eq!(job_id_from_input_key("uploads/j-1/input.enc"), None);
        assert_eq!(job_id_from_input_key("data/a/b/input.enc"), None);
    }

    #[test]
    fn test_status_lifecycle() {
        tokio_test::block_on(async {
            let platform = memory_platform();
            assert_eq!(
                platform.job_status("j-1").await.unwrap().status,
                JobStatus::NotFound
            );

            let job = platform.register_job(&request("j-1")).await.unwrap();
            assert_eq!(job.job_id, "j-1");
            let info = platform.job_status("j-1").await.unwrap();
            assert_eq!(info.status, JobStatus::Submitted);
            assert_eq!(info.description.as_deref(), Some("demo-count job"));
            assert_eq!(info.plugin_name.as_deref(), Some("demo-count"));

            platform
                .results
                .write("results/j-1/output.enc", vec![1u8, 2, 3])
                .await
                .unwrap();
            assert_eq!(
                platform.job_status("j-1").await.unwrap().status,
                JobStatus::Completed
            );
        });
    }

    #[test]
    fn test_job_record_shape() {
        tokio_test::block_on(async {
            let platform = memory_platform();
            platform.register_job(&request("j-2")).await.unwrap();
            let raw = platform.data.read("jobs/j-2.json").await.unwrap().to_vec();
            let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
            assert_eq!(value["user_id"], "tester");
            assert_eq!(value["output_s3_key"], "results/j-2/output.enc");
            assert_eq!(value["config"]["description"], "demo-count job");
            assert_eq!(value["config"]["threshold"], 3);
            assert_eq!(value["tags"]["experiment"], "exp001");
        });
    }

    #[test]
    fn test_missing_result_is_not_found() {
        tokio_test::block_on(async {
            let platform = memory_platform();
            let err = platform.download_result("j-3", "output.enc").await.unwrap_err();
            assert!(matches!(err, ByodError::NotFound(_)));
        });
    }

    #[test]
    fn test_list_jobs_filters_and_limits() {
        tokio_test::block_on(async {
            let platform = memory_platform();
            for id in ["j-a", "j-b", "j-c"] {
                platform.register_job(&request(id)).await.unwrap();
            }
            platform
                .results
                .write("results/j-b/output.enc", vec![0u8])
                .await
                .unwrap();

            let all = platform.list_jobs(&JobFilter::default()).await.unwrap();
            assert_eq!(all.len(), 3);

            let done = platform
                .list_jobs(&JobFilter {
                    status: Some(JobStatus::Completed),
                    ..Default::default()
                })
                .await
                .unwrap();
            assert_eq!(done.len(), 1);
            assert_eq!(done[0].job_id, "j-b");

            let limited = platform
                .list_jobs(&JobFilter {
                    limit: 2,
                    ..Default::default()
                })
                .await
                .unwrap();
            assert_eq!(limited.len(), 2);

            let other_plugin = platform
                .list_jobs(&JobFilter {
                    plugin: Some("genomic-qc".into()),
                    ..Default::default()
                })
                .await
                .unwrap();
            assert!(other_plugin.is_empty());
        });
    }
}
