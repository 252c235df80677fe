//! byod-kms: hosted key management for job payloads
//!
//! Job DEKs never touch a local master key. They come from a hosted KMS key
//! whose policy only lets an attested enclave decrypt:
//! ```text
//! customer account                          platform account
//!   KMS key (policy: CustomerAdmin, ...)  <-- BYODEnclaveRole-{tenant}
//!     RoleDecryptWithAttestation              (sts:AssumeRole, ExternalId = tenant)
//!       PCR0 ∈ {enclave measurements}
//! ```
//!
//! Backends sit behind two traits so the flows run unchanged against AWS
//! (feature `aws`) or the in-memory doubles used by tests and offline mode.

pub mod memory;
pub mod policy;
pub mod setup;

#[cfg(feature = "aws")]
pub mod aws;

pub use memory::{InMemoryIdentity, InMemoryKms};
pub use policy::{build_key_policy, update_policy, PolicyUpdate};
pub use setup::{provision, teardown, update_attestation, SetupOutcome, SetupParams, TeardownReport};

use async_trait::async_trait;
use byod_core::ByodResult;
use byod_crypto::DataKey;
use serde::{Deserialize, Serialize};

/// KMS key state, parsed from the backend's string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyState {
    Enabled,
    Disabled,
    PendingDeletion,
    Other(String),
}

impl KeyState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Enabled" => KeyState::Enabled,
            "Disabled" => KeyState::Disabled,
            "PendingDeletion" => KeyState::PendingDeletion,
            other => KeyState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            KeyState::Enabled => "Enabled",
            KeyState::Disabled => "Disabled",
            KeyState::PendingDeletion => "PendingDeletion",
            KeyState::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescription {
    pub key_id: String,
    pub arn: Option<String>,
    pub state: KeyState,
    pub usage: String,
}

/// A freshly generated DEK and its KMS ciphertext blob.
#[derive(Debug)]
pub struct GeneratedKey {
    pub key: DataKey,
    pub wrapped: Vec<u8>,
}

/// Hosted key-management operations the job flows and setup need.
///
/// `key_ref` is a key id, key ARN or `alias/...` name.
#[async_trait]
pub trait KeyManagementBackend: Send + Sync {
    async fn generate_data_key(&self, key_ref: &str) -> ByodResult<GeneratedKey>;

    async fn decrypt(&self, wrapped: &[u8], key_ref: &str) -> ByodResult<DataKey>;

    async fn describe_key(&self, key_ref: &str) -> ByodResult<KeyDescription>;

    async fn get_policy(&self, key_ref: &str) -> ByodResult<serde_json::Value>;

    async fn put_policy(&self, key_ref: &str, policy: &serde_json::Value) -> ByodResult<()>;

    async fn create_key(
        &self,
        description: &str,
        policy: &serde_json::Value,
        tags: &[(String, String)],
    ) -> ByodResult<KeyDescription>;

    async fn create_alias(&self, alias: &str, key_ref: &str) -> ByodResult<()>;

    async fn delete_alias(&self, alias: &str) -> ByodResult<()>;

    /// `pending_days` must be within 7..=30.
    async fn schedule_key_deletion(&self, key_ref: &str, pending_days: u8) -> ByodResult<()>;
}

/// Cross-account role management in the customer's account.
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    async fn caller_account_id(&self) -> ByodResult<String>;

    /// Create the role and return its ARN. An existing role of the same name
    /// is reused and its ARN returned.
    async fn create_role(
        &self,
        name: &str,
        trust_policy: &serde_json::Value,
        description: &str,
        tags: &[(String, String)],
    ) -> ByodResult<String>;

    async fn put_role_policy(
        &self,
        role: &str,
        policy_name: &str,
        document: &serde_json::Value,
    ) -> ByodResult<()>;

    async fn list_role_policies(&self, role: &str) -> ByodResult<Vec<String>>;

    async fn delete_role_policy(&self, role: &str, policy_name: &str) -> ByodResult<()>;

    async fn delete_role(&self, role: &str) -> ByodResult<()>;
}

/// Allowed KMS deletion window, in days.
pub const PENDING_WINDOW_DAYS: std::ops::RangeInclusive<u8> = 7..=30;

pub(crate) fn check_pending_days(days: u8) -> ByodResult<()> {
    if PENDING_WINDOW_DAYS.contains(&days) {
        Ok(())
    } else {
        Err(byod_core::ByodError::Validation(format!(
            "key deletion window must be 7-30 days, got {days}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_state_parse() {
        assert_eq!(KeyState::parse("Enabled"), KeyState::Enabled);
        assert_eq!(KeyState::parse("PendingDeletion"), KeyState::PendingDeletion);
        assert_eq!(
            KeyState::parse("PendingImport"),
            KeyState::Other("PendingImport".into())
        );
        assert_eq!(KeyState::parse("Disabled").as_str(), "Disabled");
    }

    #[test]
    fn test_pending_days_bounds() {
        assert!(check_pending_days(6).is_err());
        assert!(check_pending_days(7).is_ok());
        assert!(check_pending_days(30).is_ok());
        assert!(check_pending_days(31).is_err());
    }
}
