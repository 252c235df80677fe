//! Platform REST API client
//!
//! The platform owns the buckets and hands out presigned URLs; the client
//! never holds storage credentials in this mode. Every call carries
//! `Authorization: Bearer {api_key}`.
//!
//! Status mapping:
//! ```text
//! 401, 403        -> ByodError::Authentication
//! other non-2xx   -> ByodError::Api { status, detail }   (JSON detail/message, else body)
//! connect/timeout -> ByodError::Backend { Network }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use byod_core::config::ByodConfig;
use byod_core::types::{Job, JobFilter, JobRequest, JobStatusInfo, Plugin};
use byod_core::{ByodError, ByodResult, JobStatus};
use reqwest::{multipart, Method, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::JobPlatform;
use crate::validation::check_job_id;

const USER_AGENT: &str = concat!("byod-cli/", env!("CARGO_PKG_VERSION"));
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);
const KEY_TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

/// Tenant settings served by `GET /api/v1/tenant/config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    #[serde(default)]
    pub organization_name: String,
    pub region: String,
    #[serde(default)]
    pub data_bucket: String,
    #[serde(default)]
    pub results_bucket: String,
    /// Platform-managed key; `None` when the tenant brought their own
    #[serde(default)]
    pub kms_key_arn: Option<String>,
    #[serde(default)]
    pub customer_kms_key_arn: Option<String>,
    #[serde(default)]
    pub tenant_prefix: String,
}

impl TenantConfig {
    /// The customer's own key wins over the platform-managed one.
    pub fn effective_kms_key(&self) -> Option<&str> {
        self.customer_kms_key_arn
            .as_deref()
            .or(self.kms_key_arn.as_deref())
            .filter(|k| !k.is_empty())
    }
}

/// What `byod setup` needs from the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnclaveInfo {
    #[serde(default)]
    pub pcr0_values: Vec<String>,
    #[serde(default)]
    pub pcr0: Option<String>,
    pub account_id: String,
    pub tenant_id: String,
}

impl EnclaveInfo {
    /// All accepted measurements, falling back to the single `pcr0` field.
    pub fn measurements(&self) -> Vec<String> {
        if !self.pcr0_values.is_empty() {
            return self.pcr0_values.clone();
        }
        self.pcr0.iter().filter(|p| !p.is_empty()).cloned().collect()
    }
}

/// Body of `POST /api/tenants/tenant/kms/register`.
#[derive(Debug, Clone, Serialize)]
pub struct KmsRegistration {
    pub kms_key_arn: String,
    pub role_arn: String,
    pub aws_account_id: String,
    pub region: String,
}

#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub limit: usize,
    pub level: Option<String>,
    pub source: Option<String>,
    pub since: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PresignedUpload {
    url: String,
    #[serde(default)]
    fields: BTreeMap<String, String>,
    s3_key: String,
}

#[derive(Debug, Deserialize)]
struct PresignedDownload {
    url: String,
}

#[derive(Debug, Deserialize)]
struct JobSubmission {
    job_id: String,
    #[serde(default = "submitted")]
    status: JobStatus,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    input_s3_key: String,
    #[serde(default)]
    wrapped_key_s3_key: String,
}

fn submitted() -> JobStatus {
    JobStatus::Submitted
}

pub struct ApiPlatform {
    base_url: String,
    api_key: SecretString,
    timeout: Duration,
    http: reqwest::Client,
    tenant: OnceCell<TenantConfig>,
}

impl ApiPlatform {
    pub fn new(api_url: &str, api_key: SecretString, timeout: Duration, verify_tls: bool) -> ByodResult<Self> {
        if !api_url.starts_with("https://") && !is_loopback(api_url) {
            warn!(
                api_url,
                "API URL uses HTTP instead of HTTPS; credentials may be sent in plaintext. \
                 Set BYOD_API_URL to an https:// URL for production use."
            );
        }

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| ByodError::Config(format!("building HTTP client: {e}")))?;

        Ok(Self {
            base_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            timeout,
            http,
            tenant: OnceCell::new(),
        })
    }

    pub fn from_config(config: &ByodConfig) -> ByodResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.expose_secret().is_empty())
            .ok_or_else(|| {
                ByodError::Authentication("Not authenticated. Run 'byod auth login' first.".into())
            })?;
        Self::new(
            &config.api_url,
            api_key,
            Duration::from_secs(config.global.timeout),
            config.global.verify_ssl,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    fn transport_error(&self, err: reqwest::Error, timeout: Duration) -> ByodError {
        if err.is_timeout() {
            ByodError::backend(format!("Request timed out after {}s", timeout.as_secs()))
        } else if err.is_connect() {
            ByodError::backend(format!(
                "Failed to connect to {}. Check your network connection.",
                self.base_url
            ))
        } else {
            ByodError::backend(format!("request failed: {err}"))
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> ByodResult<T> {
        let url = self.url(endpoint);
        debug!(%method, %url, "platform request");

        let mut builder = self
            .http
            .request(method, &url)
            .bearer_auth(self.api_key.expose_secret())
            .timeout(self.timeout);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.transport_error(e, self.timeout))?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| ByodError::Api {
                status: 200,
                detail: format!("unexpected response body: {e}"),
            })
    }

    pub async fn verify_auth(&self) -> ByodResult<Value> {
        self.request(Method::GET, "/api/v1/auth/me", &[], None).await
    }

    /// Tenant settings, fetched once per client.
    pub async fn tenant_config(&self) -> ByodResult<&TenantConfig> {
        self.tenant
            .get_or_try_init(|| async {
                self.request(Method::GET, "/api/v1/tenant/config", &[], None).await
            })
            .await
    }

    pub async fn job_logs(&self, job_id: &str, query: &LogQuery) -> ByodResult<Value> {
        let mut params = vec![("limit", query.limit.max(1).to_string())];
        for (name, value) in [("level", &query.level), ("source", &query.source), ("since", &query.since)] {
            if let Some(value) = value {
                params.push((name, value.clone()));
            }
        }
        check_job_id(job_id)?;
        self.request(Method::GET, &format!("/api/v1/jobs/{job_id}/logs"), &params, None)
            .await
    }

    pub async fn enclave_info(&self) -> ByodResult<EnclaveInfo> {
        self.request(Method::GET, "/api/tenants/enclave/info", &[], None).await
    }

    pub async fn register_kms_setup(&self, registration: &KmsRegistration) -> ByodResult<Value> {
        let body = serde_json::to_value(registration).map_err(|e| ByodError::Other(e.into()))?;
        self.request(Method::POST, "/api/tenants/tenant/kms/register", &[], Some(&body))
            .await
    }

    async fn presigned_upload(&self, filename: &str, bytes: Vec<u8>, timeout: Duration) -> ByodResult<String> {
        let body = json!({
            "filename": filename,
            "content_type": "application/octet-stream",
            "file_size": bytes.len(),
        });
        let presigned: PresignedUpload = self
            .request(Method::POST, "/api/v1/upload/presign", &[], Some(&body))
            .await?;

        let mut form = multipart::Form::new();
        for (name, value) in presigned.fields {
            form = form.text(name, value);
        }
        let len = bytes.len();
        form = form.part(
            "file",
            multipart::Part::bytes(bytes).file_name(filename.to_string()),
        );

        let response = self
            .http
            .post(&presigned.url)
            .multipart(form)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e, timeout))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(ByodError::Api {
                status,
                detail: format!("Upload failed: {status} {text}"),
            });
        }

        info!(s3_key = %presigned.s3_key, bytes = len, "uploaded via presigned URL");
        Ok(presigned.s3_key)
    }
}

fn is_loopback(url: &str) -> bool {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split('/').next().unwrap_or_default();
    let host = authority.rsplit_once(':').map_or(authority, |(host, _)| host);
    matches!(host, "localhost" | "127.0.0.1" | "0.0.0.0")
}

async fn check_status(response: Response) -> ByodResult<Response> {
    match response.status() {
        StatusCode::UNAUTHORIZED => Err(ByodError::Authentication(
            "Invalid or expired API key. Run 'byod auth login' to authenticate.".into(),
        )),
        StatusCode::FORBIDDEN => Err(ByodError::Authentication(
            "Access denied. Check your API key permissions.".into(),
        )),
        status if !status.is_success() => {
            let text = response.text().await.unwrap_or_default();
            Err(ByodError::Api {
                status: status.as_u16(),
                detail: error_detail(&text),
            })
        }
        _ => Ok(response),
    }
}

/// `detail`, else `message`, else the raw body.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            ["detail", "message"].iter().find_map(|field| match v.get(*field) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Null) | None => None,
                Some(other) => Some(other.to_string()),
            })
        })
        .unwrap_or_else(|| body.to_string())
}

#[async_trait]
impl JobPlatform for ApiPlatform {
    async fn upload_input(&self, _job_hint: &str, payload_name: &str, bytes: Vec<u8>) -> ByodResult<String> {
        self.presigned_upload(payload_name, bytes, TRANSFER_TIMEOUT).await
    }

    async fn upload_wrapped_key(&self, _job_hint: &str, bytes: Vec<u8>) -> ByodResult<String> {
        self.presigned_upload("wrapped_key.bin", bytes, KEY_TRANSFER_TIMEOUT)
            .await
    }

    async fn register_job(&self, request: &JobRequest) -> ByodResult<Job> {
        let body = json!({
            "plugin_name": request.plugin_name,
            "input_s3_key": request.input_s3_key,
            "wrapped_key_s3_key": request.wrapped_key_s3_key,
            "description": request.description,
            "config": request.config.clone().unwrap_or_else(|| json!({})),
            "tags": request.tags,
        });
        let submission: JobSubmission = self
            .request(Method::POST, "/api/v1/jobs", &[], Some(&body))
            .await?;
        info!(job_id = %submission.job_id, plugin = %request.plugin_name, "job registered");

        Ok(Job {
            job_id: submission.job_id,
            plugin_name: request.plugin_name.clone(),
            input_ref: submission.input_s3_key,
            wrapped_key_ref: submission.wrapped_key_s3_key,
            status: submission.status,
            created_at: submission.created_at,
            completed_at: None,
            error: None,
        })
    }

    async fn job_status(&self, job_id: &str) -> ByodResult<JobStatusInfo> {
        check_job_id(job_id)?;
        self.request(Method::GET, &format!("/api/v1/jobs/{job_id}"), &[], None)
            .await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> ByodResult<Vec<Job>> {
        let mut params = vec![("limit", filter.limit.to_string())];
        if let Some(status) = &filter.status {
            params.push(("status", status.as_str().to_string()));
        }
        if let Some(plugin) = &filter.plugin {
            params.push(("plugin", plugin.clone()));
        }

        #[derive(Deserialize)]
        struct Listing {
            #[serde(default)]
            jobs: Vec<Job>,
        }
        let listing: Listing = self.request(Method::GET, "/api/v1/jobs", &params, None).await?;
        Ok(listing.jobs)
    }

    async fn download_result(&self, job_id: &str, file: &str) -> ByodResult<Vec<u8>> {
        check_job_id(job_id)?;
        let body = json!({ "filename": file });
        let presigned: PresignedDownload = self
            .request(
                Method::POST,
                &format!("/api/v1/jobs/{job_id}/download"),
                &[],
                Some(&body),
            )
            .await?;

        let response = self
            .http
            .get(&presigned.url)
            .timeout(TRANSFER_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.transport_error(e, TRANSFER_TIMEOUT))?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ByodError::NotFound(format!(
                "{file} for job {job_id}. The job may still be processing."
            ))),
            status if !status.is_success() => Err(ByodError::Api {
                status: status.as_u16(),
                detail: format!("Download failed: {}", status.as_u16()),
            }),
            _ => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| self.transport_error(e, TRANSFER_TIMEOUT))?;
                debug!(job_id, file, bytes = bytes.len(), "downloaded result object");
                Ok(bytes.to_vec())
            }
        }
    }

    async fn plugins(&self) -> ByodResult<Vec<Plugin>> {
        #[derive(Deserialize)]
        struct Listing {
            #[serde(default)]
            plugins: Vec<Plugin>,
        }
        let listing: Listing = self.request(Method::GET, "/api/v1/plugins", &[], None).await?;
        Ok(listing.plugins)
    }

    async fn kms_key_ref(&self) -> ByodResult<String> {
        self.tenant_config()
            .await?
            .effective_kms_key()
            .map(str::to_string)
            .ok_or_else(|| ByodError::Config("No KMS key configured. Contact support.".into()))
    }

    async fn region(&self) -> ByodResult<String> {
        Ok(self.tenant_config().await?.region.clone())
    }

    async fn check_ready(&self) -> ByodResult<()> {
        self.verify_auth().await.map(|_| ())
    }
}
