//! Provisioning, attestation updates and teardown of a tenant's KMS key and
//! enclave role

use std::time::Duration;

use byod_core::{ByodError, ByodResult};
use serde::Serialize;
use tracing::{info, warn};

use crate::policy::{
    alias_name, build_key_policy, role_access_policy, role_name, trust_policy, update_policy,
    PolicyUpdate, ROLE_POLICY_NAME,
};
use crate::{check_pending_days, IdentityBackend, KeyManagementBackend, KeyState};

#[derive(Debug, Clone)]
pub struct SetupParams {
    pub tenant_id: String,
    /// Account the enclave runs in; it gets to assume the role
    pub platform_account: String,
    pub pcr0_values: Vec<String>,
    pub region: String,
    /// Tear down any existing role and key first
    pub force_new: bool,
    /// Wait after creating the role so IAM can propagate it before the key
    /// policy references it
    pub propagation_delay: Duration,
}

impl SetupParams {
    pub fn new(tenant_id: &str, platform_account: &str, pcr0_values: Vec<String>, region: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            platform_account: platform_account.to_string(),
            pcr0_values,
            region: region.to_string(),
            force_new: false,
            propagation_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupOutcome {
    pub key_arn: String,
    pub key_id: String,
    pub role_arn: String,
    pub alias: String,
    pub account_id: String,
    pub region: String,
}

/// Create the enclave role and the attestation-gated KMS key in the caller's
/// account, then grant the role use of the key.
pub async fn provision(
    kms: &dyn KeyManagementBackend,
    iam: &dyn IdentityBackend,
    params: &SetupParams,
) -> ByodResult<SetupOutcome> {
    if params.tenant_id.is_empty() {
        return Err(ByodError::Validation("tenant id is empty".into()));
    }
    if params.pcr0_values.is_empty() {
        return Err(ByodError::Validation(
            "no enclave PCR0 values to trust; refusing to create a key nobody can decrypt with".into(),
        ));
    }

    let account_id = iam.caller_account_id().await?;
    let role = role_name(&params.tenant_id);
    let alias = alias_name(&params.tenant_id);
    info!(account = %account_id, region = %params.region, role = %role, "provisioning");

    if params.force_new {
        let report = teardown(kms, iam, &params.tenant_id, None, 7).await?;
        for failure in &report.failures {
            warn!(step = %failure.step, "could not remove existing resource: {}", failure.error);
        }
    }

    let tags = vec![
        ("Purpose".to_string(), "BYOD-CrossAccountAccess".to_string()),
        ("TenantId".to_string(), params.tenant_id.clone()),
    ];
    let role_arn = iam
        .create_role(
            &role,
            &trust_policy(&params.platform_account, &params.tenant_id),
            &format!("Allows BYOD enclave to access KMS key (tenant: {})", params.tenant_id),
            &tags,
        )
        .await?;
    info!(role_arn = %role_arn, "enclave role ready");

    if !params.propagation_delay.is_zero() {
        tokio::time::sleep(params.propagation_delay).await;
    }

    let policy = build_key_policy(&account_id, &role_arn, &params.pcr0_values);
    let key_tags = vec![
        ("Purpose".to_string(), "BYOD-DataEncryption".to_string()),
        ("TenantId".to_string(), params.tenant_id.clone()),
    ];
    let key = kms
        .create_key(
            &format!("BYOD encryption key (tenant: {})", params.tenant_id),
            &policy,
            &key_tags,
        )
        .await?;
    let key_arn = key.arn.clone().unwrap_or_else(|| key.key_id.clone());
    info!(key_arn = %key_arn, "KMS key created");

    if let Err(e) = kms.create_alias(&alias, &key.key_id).await {
        warn!(alias = %alias, "alias not created: {e}");
    }

    iam.put_role_policy(&role, ROLE_POLICY_NAME, &role_access_policy(&key_arn))
        .await?;
    info!(policy = ROLE_POLICY_NAME, "role policy attached");

    Ok(SetupOutcome {
        key_arn,
        key_id: key.key_id,
        role_arn,
        alias,
        account_id,
        region: params.region.clone(),
    })
}

/// Bring the attestation statement's PCR0 list in line with `pcr0_values`.
/// The policy is only written back when it changed.
pub async fn update_attestation(
    kms: &dyn KeyManagementBackend,
    key_ref: &str,
    pcr0_values: &[String],
) -> ByodResult<PolicyUpdate> {
    if pcr0_values.is_empty() {
        return Err(ByodError::Validation("no PCR0 values supplied".into()));
    }
    let current = kms.get_policy(key_ref).await?;
    let update = update_policy(&current, pcr0_values)?;
    match &update {
        PolicyUpdate::Updated(policy) => {
            kms.put_policy(key_ref, policy).await?;
            info!(values = pcr0_values.len(), "key policy updated");
        }
        PolicyUpdate::AlreadyUpToDate => info!("key policy already up to date"),
    }
    Ok(update)
}

#[derive(Debug, Clone, Serialize)]
pub struct TeardownFailure {
    pub step: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TeardownReport {
    pub role_deleted: bool,
    pub key_scheduled: bool,
    pub key_arn: Option<String>,
    pub pending_days: u8,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_complete(&self) -> bool {
        self.role_deleted && self.key_scheduled && self.failures.is_empty()
    }

    fn failed(&mut self, step: &str, error: ByodError) {
        warn!(step, "teardown step failed: {error}");
        self.failures.push(TeardownFailure {
            step: step.to_string(),
            error: error.to_string(),
        });
    }
}

/// Remove the tenant's enclave role and alias, and schedule its key for
/// deletion after `pending_days`.
///
/// Every step is attempted. Resources that are already gone count as done;
/// anything else that fails is recorded in the report rather than aborting.
pub async fn teardown(
    kms: &dyn KeyManagementBackend,
    iam: &dyn IdentityBackend,
    tenant_id: &str,
    key_ref: Option<&str>,
    pending_days: u8,
) -> ByodResult<TeardownReport> {
    check_pending_days(pending_days)?;

    let role = role_name(tenant_id);
    let alias = alias_name(tenant_id);
    let mut report = TeardownReport {
        pending_days,
        ..Default::default()
    };

    match delete_role(iam, &role).await {
        Ok(()) => report.role_deleted = true,
        Err(ByodError::NotFound(_)) => {
            info!(role = %role, "role already gone");
            report.role_deleted = true;
        }
        Err(e) => report.failed("delete role", e),
    }

    let key_ref = key_ref.unwrap_or(&alias);
    match kms.describe_key(key_ref).await {
        Ok(key) => {
            report.key_arn = key.arn.clone();
            if key.state == KeyState::PendingDeletion {
                info!(key_id = %key.key_id, "key already pending deletion");
                report.key_scheduled = true;
            } else {
                match kms.delete_alias(&alias).await {
                    Ok(()) | Err(ByodError::NotFound(_)) => {}
                    Err(e) => report.failed("delete alias", e),
                }
                match kms.schedule_key_deletion(&key.key_id, pending_days).await {
                    Ok(()) => {
                        info!(key_id = %key.key_id, pending_days, "key scheduled for deletion");
                        report.key_scheduled = true;
                    }
                    Err(e) => report.failed("schedule key deletion", e),
                }
            }
        }
        Err(ByodError::NotFound(_)) => {
            info!(key = %key_ref, "key already gone");
            report.key_scheduled = true;
        }
        Err(e) => report.failed("describe key", e),
    }

    Ok(report)
}

async fn delete_role(iam: &dyn IdentityBackend, role: &str) -> ByodResult<()> {
    for policy in iam.list_role_policies(role).await? {
        iam.delete_role_policy(role, &policy).await?;
    }
    iam.delete_role(role).await
}
