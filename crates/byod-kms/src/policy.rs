//! Attestation key policy and the IAM documents around it
//!
//! The key policy has exactly four statements, in this order:
//!
//! | Sid                          | Principal     | Grants                                  |
//! |------------------------------|---------------|-----------------------------------------|
//! | `CustomerAdmin`              | account root  | key administration, Encrypt, GenerateDataKey (no Decrypt) |
//! | `CustomerDecrypt`            | account root  | Decrypt, unless the caller is the enclave role |
//! | `RoleOperations`             | enclave role  | GenerateDataKey, DescribeKey            |
//! | `RoleDecryptWithAttestation` | enclave role  | Decrypt only with a matching PCR0       |
//!
//! The enclave role can therefore only decrypt from inside an enclave whose
//! measurement is listed. Updates touch the PCR0 list and nothing else.

use std::collections::BTreeSet;

use byod_core::{ByodError, ByodResult};
use serde_json::{json, Value};

pub const POLICY_VERSION: &str = "2012-10-17";

pub const SID_CUSTOMER_ADMIN: &str = "CustomerAdmin";
pub const SID_CUSTOMER_DECRYPT: &str = "CustomerDecrypt";
pub const SID_ROLE_OPERATIONS: &str = "RoleOperations";
pub const SID_ROLE_DECRYPT: &str = "RoleDecryptWithAttestation";

pub const PCR0_CONDITION_KEY: &str = "kms:RecipientAttestation:PCR0";
const PCR0_OPERATOR: &str = "StringEqualsIgnoreCase";

/// Inline policy attached to the enclave role.
pub const ROLE_POLICY_NAME: &str = "BYODKMSAccess";

const CUSTOMER_ADMIN_ACTIONS: &[&str] = &[
    "kms:Create*",
    "kms:Describe*",
    "kms:Enable*",
    "kms:List*",
    "kms:Put*",
    "kms:Update*",
    "kms:Revoke*",
    "kms:Disable*",
    "kms:Get*",
    "kms:Delete*",
    "kms:TagResource",
    "kms:UntagResource",
    "kms:ScheduleKeyDeletion",
    "kms:CancelKeyDeletion",
    "kms:Encrypt",
    "kms:GenerateDataKey",
    "kms:GenerateDataKeyWithoutPlaintext",
];

fn root_principal(account_id: &str) -> String {
    format!("arn:aws:iam::{account_id}:root")
}

/// Build the four-statement key policy for a tenant's KMS key.
pub fn build_key_policy(customer_account_id: &str, role_arn: &str, pcr0_values: &[String]) -> Value {
    let root = root_principal(customer_account_id);
    json!({
        "Version": POLICY_VERSION,
        "Statement": [
            {
                "Sid": SID_CUSTOMER_ADMIN,
                "Effect": "Allow",
                "Principal": {"AWS": root},
                "Action": CUSTOMER_ADMIN_ACTIONS,
                "Resource": "*",
            },
            {
                "Sid": SID_CUSTOMER_DECRYPT,
                "Effect": "Allow",
                "Principal": {"AWS": root},
                "Action": "kms:Decrypt",
                "Resource": "*",
                "Condition": {"ArnNotEquals": {"aws:PrincipalArn": role_arn}},
            },
            {
                "Sid": SID_ROLE_OPERATIONS,
                "Effect": "Allow",
                "Principal": {"AWS": role_arn},
                "Action": ["kms:GenerateDataKey", "kms:DescribeKey"],
                "Resource": "*",
            },
            {
                "Sid": SID_ROLE_DECRYPT,
                "Effect": "Allow",
                "Principal": {"AWS": role_arn},
                "Action": "kms:Decrypt",
                "Resource": "*",
                "Condition": {PCR0_OPERATOR: {PCR0_CONDITION_KEY: pcr0_values}},
            },
        ],
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyUpdate {
    /// The PCR0 list changed; this is the document to put back.
    Updated(Value),
    AlreadyUpToDate,
}

/// PCR0 values currently allowed by the attestation statement.
///
/// A bare string is read as a one-item list. `None` when the statement or
/// its condition is missing.
pub fn current_pcr0_values(policy: &Value) -> Option<Vec<String>> {
    let statement = find_statement(policy, SID_ROLE_DECRYPT)?;
    match statement.pointer(&pcr0_pointer())? {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ),
        _ => None,
    }
}

/// Replace the PCR0 list in the attestation statement, leaving every other
/// part of the document untouched.
///
/// Comparison ignores order and case (the condition operator is
/// case-insensitive). A policy without the statement, or whose statement has
/// lost its PCR0 condition, is refused rather than repaired.
pub fn update_policy(policy: &Value, new_values: &[String]) -> ByodResult<PolicyUpdate> {
    if find_statement(policy, SID_ROLE_DECRYPT).is_none() {
        return Err(ByodError::PolicyStatementNotFound(SID_ROLE_DECRYPT.to_string()));
    }
    let old = current_pcr0_values(policy).ok_or_else(missing_condition)?;
    if normalized(&old) == normalized(new_values) {
        return Ok(PolicyUpdate::AlreadyUpToDate);
    }

    let mut updated = policy.clone();
    let slot = find_statement_mut(&mut updated, SID_ROLE_DECRYPT)
        .and_then(|statement| statement.pointer_mut(&pcr0_pointer()))
        .ok_or_else(missing_condition)?;
    *slot = json!(new_values);

    Ok(PolicyUpdate::Updated(updated))
}

fn pcr0_pointer() -> String {
    format!("/Condition/{PCR0_OPERATOR}/{}", escape_pointer(PCR0_CONDITION_KEY))
}

fn missing_condition() -> ByodError {
    ByodError::Validation(format!(
        "statement '{SID_ROLE_DECRYPT}' has no {PCR0_OPERATOR} condition on {PCR0_CONDITION_KEY}; \
         the key policy looks hand-edited, refusing to guess a fix"
    ))
}

fn normalized(values: &[String]) -> BTreeSet<String> {
    values.iter().map(|v| v.to_lowercase()).collect()
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn statements(policy: &Value) -> impl Iterator<Item = &Value> {
    policy
        .get("Statement")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn find_statement<'a>(policy: &'a Value, sid: &str) -> Option<&'a Value> {
    statements(policy).find(|s| s.get("Sid").and_then(Value::as_str) == Some(sid))
}

fn find_statement_mut<'a>(policy: &'a mut Value, sid: &str) -> Option<&'a mut Value> {
    policy
        .get_mut("Statement")?
        .as_array_mut()?
        .iter_mut()
        .find(|s| s.get("Sid").and_then(Value::as_str) == Some(sid))
}

/// Trust policy letting the platform account assume the enclave role, gated
/// on the tenant id as external id.
pub fn trust_policy(platform_account_id: &str, external_id: &str) -> Value {
    json!({
        "Version": POLICY_VERSION,
        "Statement": [
            {
                "Effect": "Allow",
                "Principal": {"AWS": root_principal(platform_account_id)},
                "Action": "sts:AssumeRole",
                "Condition": {"StringEquals": {"sts:ExternalId": external_id}},
            }
        ],
    })
}

/// Inline role policy granting the enclave role use of one key.
pub fn role_access_policy(key_arn: &str) -> Value {
    json!({
        "Version": POLICY_VERSION,
        "Statement": [
            {
                "Effect": "Allow",
                "Action": ["kms:GenerateDataKey", "kms:Decrypt", "kms:DescribeKey"],
                "Resource": key_arn,
            }
        ],
    })
}

fn tenant_prefix(tenant_id: &str) -> String {
    tenant_id.chars().take(16).collect()
}

pub fn role_name(tenant_id: &str) -> String {
    format!("BYODEnclaveRole-{}", tenant_prefix(tenant_id))
}

pub fn alias_name(tenant_id: &str) -> String {
    format!("alias/byod-{}", tenant_prefix(tenant_id))
}

/// First 16 characters of a measurement, for display.
pub fn short_pcr0(value: &str) -> String {
    let head: String = value.chars().take(16).collect();
    format!("{head}...")
}
