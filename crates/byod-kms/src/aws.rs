//! AWS KMS / IAM / STS backends
//!
//! Credentials come from the default provider chain (`~/.aws`, env vars,
//! instance profile). Service errors are flattened into `ByodError`:
//! "not found" codes become `NotFound` so teardown can treat them as done,
//! everything else becomes a classified backend error.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_kms::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::{DataKeySpec, KeyUsageType};
use byod_core::{ByodError, ByodResult};
use byod_crypto::DataKey;
use serde_json::Value;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::{GeneratedKey, IdentityBackend, KeyDescription, KeyManagementBackend, KeyState};

const DEFAULT_POLICY_NAME: &str = "default";

/// Load the shared SDK config for `region`.
pub async fn load_sdk_config(region: &str) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .load()
        .await
}

fn sdk_error<E>(operation: &str, err: E) -> ByodError
where
    E: ProvideErrorMetadata + std::error::Error,
{
    match err.code() {
        Some("NotFoundException") | Some("NoSuchEntity") => ByodError::NotFound(format!(
            "{operation}: {}",
            err.message().unwrap_or("resource not found")
        )),
        _ => ByodError::backend(format!("{operation} failed: {}", DisplayErrorContext(&err))),
    }
}

fn to_json(policy: &Value) -> ByodResult<String> {
    serde_json::to_string(policy).map_err(|e| ByodError::Other(e.into()))
}

pub struct AwsKms {
    client: aws_sdk_kms::Client,
}

impl AwsKms {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_kms::Client::new(config),
        }
    }
}

#[async_trait]
impl KeyManagementBackend for AwsKms {
    async fn generate_data_key(&self, key_ref: &str) -> ByodResult<GeneratedKey> {
        let response = self
            .client
            .generate_data_key()
            .key_id(key_ref)
            .key_spec(DataKeySpec::Aes256)
            .send()
            .await
            .map_err(|e| sdk_error("KMS GenerateDataKey", e))?;

        let wrapped = response
            .ciphertext_blob()
            .ok_or_else(|| ByodError::backend("KMS GenerateDataKey returned no ciphertext blob"))?
            .as_ref()
            .to_vec();
        let plaintext = response
            .plaintext()
            .ok_or_else(|| ByodError::backend("KMS GenerateDataKey returned no plaintext key"))?;
        let key = DataKey::from_slice(plaintext.as_ref())?;

        debug!(wrapped_len = wrapped.len(), "generated data key");
        Ok(GeneratedKey { key, wrapped })
    }

    async fn decrypt(&self, wrapped: &[u8], key_ref: &str) -> ByodResult<DataKey> {
        let response = self
            .client
            .decrypt()
            .key_id(key_ref)
            .ciphertext_blob(Blob::new(wrapped))
            .send()
            .await
            .map_err(|e| sdk_error("KMS Decrypt", e))?;

        let plaintext = response
            .plaintext()
            .ok_or_else(|| ByodError::backend("KMS Decrypt returned no plaintext"))?;
        let bytes = Zeroizing::new(plaintext.as_ref().to_vec());
        Ok(DataKey::from_slice(&bytes)?)
    }

    async fn describe_key(&self, key_ref: &str) -> ByodResult<KeyDescription> {
        let response = self
            .client
            .describe_key()
            .key_id(key_ref)
            .send()
            .await
            .map_err(|e| sdk_error("KMS DescribeKey", e))?;

        let meta = response
            .key_metadata()
            .ok_or_else(|| ByodError::backend("KMS DescribeKey returned no metadata"))?;
        Ok(KeyDescription {
            key_id: meta.key_id().to_string(),
            arn: meta.arn().map(str::to_string),
            state: meta
                .key_state()
                .map(|s| KeyState::parse(s.as_str()))
                .unwrap_or(KeyState::Other("unknown".into())),
            usage: meta
                .key_usage()
                .map(|u| u.as_str().to_string())
                .unwrap_or_default(),
        })
    }

    async fn get_policy(&self, key_ref: &str) -> ByodResult<Value> {
        let response = self
            .client
            .get_key_policy()
            .key_id(key_ref)
            .policy_name(DEFAULT_POLICY_NAME)
            .send()
            .await
            .map_err(|e| sdk_error("KMS GetKeyPolicy", e))?;

        let raw = response
            .policy()
            .ok_or_else(|| ByodError::backend("KMS GetKeyPolicy returned no policy"))?;
        serde_json::from_str(raw).map_err(|e| ByodError::backend(format!("KMS key policy is not JSON: {e}")))
    }

    async fn put_policy(&self, key_ref: &str, policy: &Value) -> ByodResult<()> {
        self.client
            .put_key_policy()
            .key_id(key_ref)
            .policy_name(DEFAULT_POLICY_NAME)
            .policy(to_json(policy)?)
            .send()
            .await
            .map_err(|e| sdk_error("KMS PutKeyPolicy", e))?;
        Ok(())
    }

    async fn create_key(
        &self,
        description: &str,
        policy: &Value,
        tags: &[(String, String)],
    ) -> ByodResult<KeyDescription> {
        let mut request = self
            .client
            .create_key()
            .description(description)
            .policy(to_json(policy)?)
            .key_usage(KeyUsageType::EncryptDecrypt);
        for (k, v) in tags {
            let tag = aws_sdk_kms::types::Tag::builder()
                .tag_key(k)
                .tag_value(v)
                .build()
                .map_err(|e| ByodError::Other(anyhow::anyhow!("KMS tag: {e}")))?;
            request = request.tags(tag);
        }

        let response = request
            .send()
            .await
            .map_err(|e| sdk_error("KMS CreateKey", e))?;
        let meta = response
            .key_metadata()
            .ok_or_else(|| ByodError::backend("KMS CreateKey returned no metadata"))?;

        info!(key_id = %meta.key_id(), "created KMS key");
        Ok(KeyDescription {
            key_id: meta.key_id().to_string(),
            arn: meta.arn().map(str::to_string),
            state: KeyState::Enabled,
            usage: "ENCRYPT_DECRYPT".into(),
        })
    }

    async fn create_alias(&self, alias: &str, key_ref: &str) -> ByodResult<()> {
        self.client
            .create_alias()
            .alias_name(alias)
            .target_key_id(key_ref)
            .send()
            .await
            .map_err(|e| sdk_error("KMS CreateAlias", e))?;
        Ok(())
    }

    async fn delete_alias(&self, alias: &str) -> ByodResult<()> {
        self.client
            .delete_alias()
            .alias_name(alias)
            .send()
            .await
            .map_err(|e| sdk_error("KMS DeleteAlias", e))?;
        Ok(())
    }

    async fn schedule_key_deletion(&self, key_ref: &str, pending_days: u8) -> ByodResult<()> {
        crate::check_pending_days(pending_days)?;
        self.client
            .schedule_key_deletion()
            .key_id(key_ref)
            .pending_window_in_days(i32::from(pending_days))
            .send()
            .await
            .map_err(|e| sdk_error("KMS ScheduleKeyDeletion", e))?;
        Ok(())
    }
}

pub struct AwsIdentity {
    iam: aws_sdk_iam::Client,
    sts: aws_sdk_sts::Client,
}

impl AwsIdentity {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            iam: aws_sdk_iam::Client::new(config),
            sts: aws_sdk_sts::Client::new(config),
        }
    }
}

#[async_trait]
impl IdentityBackend for AwsIdentity {
    async fn caller_account_id(&self) -> ByodResult<String> {
        let response = self
            .sts
            .get_caller_identity()
            .send()
            .await
            .map_err(|e| sdk_error("STS GetCallerIdentity (check AWS credentials)", e))?;
        response
            .account()
            .map(str::to_string)
            .ok_or_else(|| ByodError::backend("STS returned no account id; check AWS credentials"))
    }

    async fn create_role(
        &self,
        name: &str,
        trust_policy: &Value,
        description: &str,
        tags: &[(String, String)],
    ) -> ByodResult<String> {
        let mut request = self
            .iam
            .create_role()
            .role_name(name)
            .assume_role_policy_document(to_json(trust_policy)?)
            .description(description);
        for (k, v) in tags {
            let tag = aws_sdk_iam::types::Tag::builder()
                .key(k)
                .value(v)
                .build()
                .map_err(|e| ByodError::Other(anyhow::anyhow!("IAM tag: {e}")))?;
            request = request.tags(tag);
        }

        match request.send().await {
            Ok(response) => response
                .role()
                .map(|r| r.arn().to_string())
                .ok_or_else(|| ByodError::backend("IAM CreateRole returned no role")),
            Err(e) if e.code() == Some("EntityAlreadyExists") => {
                info!(role = %name, "role already exists, reusing");
                let existing = self
                    .iam
                    .get_role()
                    .role_name(name)
                    .send()
                    .await
                    .map_err(|e| sdk_error("IAM GetRole", e))?;
                existing
                    .role()
                    .map(|r| r.arn().to_string())
                    .ok_or_else(|| ByodError::backend("IAM GetRole returned no role"))
            }
            Err(e) => Err(sdk_error("IAM CreateRole", e)),
        }
    }

    async fn put_role_policy(&self, role: &str, policy_name: &str, document: &Value) -> ByodResult<()> {
        self.iam
            .put_role_policy()
            .role_name(role)
            .policy_name(policy_name)
            .policy_document(to_json(document)?)
            .send()
            .await
            .map_err(|e| sdk_error("IAM PutRolePolicy", e))?;
        Ok(())
    }

    async fn list_role_policies(&self, role: &str) -> ByodResult<Vec<String>> {
        let response = self
            .iam
            .list_role_policies()
            .role_name(role)
            .send()
            .await
            .map_err(|e| sdk_error("IAM ListRolePolicies", e))?;
        Ok(response.policy_names().to_vec())
    }

    async fn delete_role_policy(&self, role: &str, policy_name: &str) -> ByodResult<()> {
        self.iam
            .delete_role_policy()
            .role_name(role)
            .policy_name(policy_name)
            .send()
            .await
            .map_err(|e| sdk_error("IAM DeleteRolePolicy", e))?;
        Ok(())
    }

    async fn delete_role(&self, role: &str) -> ByodResult<()> {
        self.iam
            .delete_role()
            .role_name(role)
            .send()
            .await
            .map_err(|e| sdk_error("IAM DeleteRole", e))?;
        Ok(())
    }
}
