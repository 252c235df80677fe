//! Per-invocation state: the effective config, where it came from, and how to
//! print. Platform and KMS clients are built from it on demand.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use byod_core::config::{ByodConfig, JobBackend};
use byod_core::{ByodError, OutputContext};
use byod_jobs::{ApiPlatform, JobPlatform};
use byod_kms::KeyManagementBackend;

pub struct AppContext {
    /// File config with BYOD_* environment overrides applied
    pub config: ByodConfig,
    pub config_path: PathBuf,
    pub out: OutputContext,
}

impl AppContext {
    pub fn new(config: ByodConfig, config_path: PathBuf, out: OutputContext) -> Self {
        Self {
            config,
            config_path,
            out,
        }
    }

    /// Directory holding config.toml and keys/.
    pub fn config_dir(&self) -> PathBuf {
        self.config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Load the on-disk config (without env overrides), edit it, save it.
    ///
    /// Environment overrides are never persisted.
    pub fn update_config<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut ByodConfig),
    {
        let mut on_disk = ByodConfig::load(&self.config_path)
            .with_context(|| format!("reading config: {}", self.config_path.display()))?;
        edit(&mut on_disk);
        on_disk
            .save(&self.config_path)
            .with_context(|| format!("writing config: {}", self.config_path.display()))
    }

    pub fn active_profile_name(&self) -> String {
        self.config
            .active_profile
            .clone()
            .unwrap_or_else(|| "default".to_string())
    }

    /// Region for KMS calls made outside a job: active profile, else `[storage]`.
    pub fn default_region(&self) -> String {
        self.config
            .active_profile()
            .map(|(_, p)| p.region.clone())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| self.config.storage.region.clone())
    }

    pub fn api(&self) -> Result<ApiPlatform> {
        Ok(ApiPlatform::from_config(&self.config)?)
    }

    /// The job platform selected by `backend` in the config.
    pub fn platform(&self) -> Result<Arc<dyn JobPlatform>> {
        byod_jobs::platform_from_config(&self.config, byod_storage::credentials_from_env())
            .context("building job platform")
    }

    #[cfg(feature = "aws")]
    pub async fn kms(&self, region: &str) -> Result<Arc<dyn KeyManagementBackend>> {
        let sdk = byod_kms::aws::load_sdk_config(region).await;
        Ok(Arc::new(byod_kms::aws::AwsKms::new(&sdk)))
    }

    #[cfg(not(feature = "aws"))]
    pub async fn kms(&self, _region: &str) -> Result<Arc<dyn KeyManagementBackend>> {
        Err(ByodError::Config(
            "this build has no KMS backend; rebuild byod-cli with the `aws` feature".into(),
        )
        .into())
    }

    /// `--timeout` for `submit --wait`, else the active profile's setting.
    pub fn wait_timeout(&self, flag: Option<u64>) -> u64 {
        flag.or_else(|| self.config.active_profile().map(|(_, p)| p.settings.timeout))
            .unwrap_or(3600)
    }

    pub fn require_api_backend(&self, command: &str) -> Result<()> {
        if self.config.backend == JobBackend::Storage {
            return Err(ByodError::Validation(format!(
                "'byod {command}' needs the platform API; backend is set to \"storage\""
            ))
            .into());
        }
        Ok(())
    }
}
