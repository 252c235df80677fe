//! Where jobs go: the platform REST API or the job buckets directly.

pub mod api;
pub mod storage;

use std::sync::Arc;

use async_trait::async_trait;
use byod_core::config::{ByodConfig, JobBackend};
use byod_core::types::{Job, JobFilter, JobRequest, JobStatusInfo, Plugin};
use byod_core::{ByodError, ByodResult};
use rand::RngCore;

/// Remote side of the job lifecycle.
///
/// Uploads return the reference (object key) to pass on in [`JobRequest`].
#[async_trait]
pub trait JobPlatform: Send + Sync {
    /// Identifier used to lay out uploads before a job exists. Platforms that
    /// assign ids server-side may ignore it.
    fn job_hint(&self, plugin: &str) -> String {
        generate_job_id(plugin)
    }

    async fn upload_input(&self, job_hint: &str, payload_name: &str, bytes: Vec<u8>) -> ByodResult<String>;

    async fn upload_wrapped_key(&self, job_hint: &str, bytes: Vec<u8>) -> ByodResult<String>;

    async fn register_job(&self, request: &JobRequest) -> ByodResult<Job>;

    async fn job_status(&self, job_id: &str) -> ByodResult<JobStatusInfo>;

    async fn list_jobs(&self, filter: &JobFilter) -> ByodResult<Vec<Job>>;

    /// Fetch one result object (`output.enc` or `output_key.bin`).
    async fn download_result(&self, job_id: &str, file: &str) -> ByodResult<Vec<u8>>;

    /// Plugins the platform runs. Empty when the platform has no registry.
    async fn plugins(&self) -> ByodResult<Vec<Plugin>>;

    /// KMS key (id, ARN or alias) that job DEKs are generated under.
    async fn kms_key_ref(&self) -> ByodResult<String>;

    async fn region(&self) -> ByodResult<String>;

    /// Cheap reachability check for readiness endpoints.
    async fn check_ready(&self) -> ByodResult<()> {
        Ok(())
    }
}

/// The platform selected by `backend` in the config.
///
/// Storage mode generates DEKs under the active profile's `kms_key_arn` and
/// takes S3 credentials from `credentials`, or from OpenDAL's own loading.
pub fn platform_from_config(
    config: &ByodConfig,
    credentials: Option<(String, String)>,
) -> ByodResult<Arc<dyn JobPlatform>> {
    match config.backend {
        JobBackend::Api => Ok(Arc::new(api::ApiPlatform::from_config(config)?)),
        JobBackend::Storage => {
            let buckets = byod_storage::build_bucket_operators(&config.storage, credentials)
                .map_err(|e| ByodError::Storage(format!("{e:#}")))?;
            let key_ref = config
                .active_profile()
                .and_then(|(_, p)| p.settings.kms_key_arn.clone())
                .unwrap_or_default();
            Ok(Arc::new(storage::StoragePlatform::new(
                buckets,
                key_ref,
                config.storage.region.clone(),
            )))
        }
    }
}

/// `{plugin}-{YYYYmmddHHMMSS}-{8 hex}`
pub fn generate_job_id(plugin: &str) -> String {
    let mut suffix = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!(
        "{plugin}-{}-{}",
        chrono::Utc::now().format("%Y%m%d%H%M%S"),
        hex::encode(suffix)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_shape() {
        let id = generate_job_id("demo-count");
        let rest = id.strip_prefix("demo-count-").unwrap();
        let (stamp, suffix) = rest.split_once('-').unwrap();
        assert_eq!(stamp.len(), 14);
        assert!(stamp.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_storage_backend_from_config() {
        let mut config = ByodConfig::default();
        config.backend = JobBackend::Storage;
        config.storage.region = "eu-west-1".into();
        config.storage.data_bucket = "byod-data".into();
        config.storage.results_bucket = "byod-results".into();

        let platform = platform_from_config(&config, None).unwrap();
        assert_eq!(platform.region().await.unwrap(), "eu-west-1");
        assert!(platform.plugins().await.unwrap().is_empty());
    }

    #[test]
    fn test_storage_backend_needs_buckets() {
        let mut config = ByodConfig::default();
        config.backend = JobBackend::Storage;
        let err = platform_from_config(&config, None).err().unwrap();
        assert!(matches!(err, ByodError::Storage(_)));
    }

    #[test]
    fn test_job_ids_differ() {
        assert_ne!(generate_job_id("p"), generate_job_id("p"));
    }
}
