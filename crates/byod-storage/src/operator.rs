//! OpenDAL Operator factory for the job buckets
//!
//! Direct mode talks to two buckets: one for encrypted inputs and job
//! records, one the enclave writes results into. Each gets its own operator.

use anyhow::{Context, Result};
use byod_core::config::StorageConfig;
use opendal::Operator;

/// Everything needed to build one bucket operator
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Empty means the AWS endpoint for `region`
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    /// Static credentials; `None` defers to the environment / instance profile
    pub credentials: Option<(String, String)>,
}

/// Build an OpenDAL S3 operator with logging and retry layers.
pub fn build_operator(cfg: &OperatorConfig) -> Result<Operator> {
    if cfg.bucket.is_empty() {
        anyhow::bail!("storage bucket is not configured");
    }

    // opendal 0.55: S3 builder uses consuming pattern (methods take `self`, return `Self`)
    let mut builder = opendal::services::S3::default()
        .region(&cfg.region)
        .bucket(&cfg.bucket);
    if !cfg.endpoint.is_empty() {
        builder = builder.endpoint(&cfg.endpoint);
    }
    if let Some((key, secret)) = &cfg.credentials {
        builder = builder.access_key_id(key).secret_access_key(secret);
    }

    let op = Operator::new(builder)
        .with_context(|| format!("creating OpenDAL S3 operator for bucket {}", cfg.bucket))?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}

/// Build an operator for `bucket` from the `[storage]` config section.
///
/// A plaintext HTTP endpoint is an error when `enforce_tls` is set and a
/// warning otherwise.
pub fn build_from_core_config(
    storage: &StorageConfig,
    bucket: &str,
    credentials: Option<(String, String)>,
) -> Result<Operator> {
    if storage.endpoint.starts_with("http://") {
        if storage.enforce_tls {
            anyhow::bail!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                storage.endpoint
            );
        }
        tracing::warn!(
            endpoint = %storage.endpoint,
            "S3 endpoint uses plaintext HTTP; encrypted payloads are safe but request metadata is not"
        );
    }

    build_operator(&OperatorConfig {
        endpoint: storage.endpoint.clone(),
        region: storage.region.clone(),
        bucket: bucket.to_string(),
        credentials,
    })
}

/// Static S3 credentials from `lookup`: the AWS_* pair first, then BYOD_*.
/// `None` leaves credential loading to OpenDAL.
pub fn credentials_from(lookup: impl Fn(&str) -> Option<String>) -> Option<(String, String)> {
    let access = lookup("AWS_ACCESS_KEY_ID").or_else(|| lookup("BYOD_ACCESS_KEY_ID"))?;
    let secret = lookup("AWS_SECRET_ACCESS_KEY").or_else(|| lookup("BYOD_SECRET_ACCESS_KEY"))?;
    Some((access, secret))
}

pub fn credentials_from_env() -> Option<(String, String)> {
    credentials_from(|name| std::env::var(name).ok())
}

/// The two operators direct mode needs.
#[derive(Clone)]
pub struct BucketOperators {
    pub data: Operator,
    pub results: Operator,
}

pub fn build_bucket_operators(
    storage: &StorageConfig,
    credentials: Option<(String, String)>,
) -> Result<BucketOperators> {
    let data = build_from_core_config(storage, &storage.data_bucket, credentials.clone())
        .context("data bucket")?;
    let results = build_from_core_config(storage, &storage.results_bucket, credentials)
        .context("results bucket")?;
    tracing::debug!(
        data = %storage.data_bucket,
        results = %storage.results_bucket,
        "storage operators ready"
    );
    Ok(BucketOperators { data, results })
}
