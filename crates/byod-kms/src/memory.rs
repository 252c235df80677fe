//! In-process KMS and IAM doubles
//!
//! Ciphertext blobs mimic the hosted format closely enough for the job flows:
//! the blob names its key, so `decrypt` can find the key on its own and
//! refuse a blob presented under a different key.
//! ```text
//! [1 byte: key id length][key id][12-byte nonce][wrapped DEK][16-byte tag]
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use byod_core::{ByodError, ByodResult};
use byod_crypto::{generate_dek, DataKey};
use rand::{rngs::OsRng, RngCore};
use serde_json::Value;
use tracing::debug;
use zeroize::Zeroizing;

use crate::{
    check_pending_days, GeneratedKey, IdentityBackend, KeyDescription, KeyManagementBackend,
    KeyState,
};

struct KeyRecord {
    material: Zeroizing<[u8; 32]>,
    arn: String,
    policy: Value,
    state: KeyState,
    description: String,
    tags: Vec<(String, String)>,
    pending_days: Option<u8>,
}

#[derive(Default)]
struct KmsState {
    keys: HashMap<String, KeyRecord>,
    aliases: HashMap<String, String>,
}

/// A KMS that lives in memory. Keys are created with `create_key` or
/// `with_key`; failures can be injected per operation name.
pub struct InMemoryKms {
    region: String,
    account_id: String,
    state: Mutex<KmsState>,
    failing: Mutex<BTreeSet<String>>,
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

fn key_uuid() -> String {
    let h = random_hex(16);
    format!("{}-{}-{}-{}-{}", &h[..8], &h[8..12], &h[12..16], &h[16..20], &h[20..])
}

fn poisoned() -> ByodError {
    ByodError::backend("in-memory KMS state lock poisoned")
}

impl InMemoryKms {
    pub fn new(region: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            account_id: account_id.into(),
            state: Mutex::new(KmsState::default()),
            failing: Mutex::new(BTreeSet::new()),
        }
    }

    /// A KMS holding one enabled key with an empty policy. Returns the key ARN
    /// alongside it.
    pub fn with_key() -> (Self, String) {
        let kms = Self::new("us-east-1", "000000000000");
        let arn = kms.insert_key("test key", Value::Null, &[]).arn.unwrap_or_default();
        (kms, arn)
    }

    /// Make every later call of `operation` (e.g. `"decrypt"`) fail with an
    /// access-denied backend error.
    pub fn fail_operation(&self, operation: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(operation.to_string());
        }
    }

    fn check(&self, operation: &str) -> ByodResult<()> {
        let failing = self.failing.lock().map_err(|_| poisoned())?;
        if failing.contains(operation) {
            return Err(ByodError::backend(format!(
                "AccessDenied: not authorized to perform {operation}"
            )));
        }
        Ok(())
    }

    fn insert_key(&self, description: &str, policy: Value, tags: &[(String, String)]) -> KeyDescription {
        let key_id = key_uuid();
        let arn = format!("arn:aws:kms:{}:{}:key/{key_id}", self.region, self.account_id);
        let mut material = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut *material);

        let record = KeyRecord {
            material,
            arn: arn.clone(),
            policy,
            state: KeyState::Enabled,
            description: description.to_string(),
            tags: tags.to_vec(),
            pending_days: None,
        };
        if let Ok(mut state) = self.state.lock() {
            state.keys.insert(key_id.clone(), record);
        }
        KeyDescription {
            key_id,
            arn: Some(arn),
            state: KeyState::Enabled,
            usage: "ENCRYPT_DECRYPT".into(),
        }
    }

    /// Days until deletion, if the key is scheduled for it.
    pub fn pending_deletion_days(&self, key_ref: &str) -> Option<u8> {
        let state = self.state.lock().ok()?;
        let id = resolve(&state, key_ref).ok()?;
        state.keys.get(&id).and_then(|k| k.pending_days)
    }

    pub fn alias_target(&self, alias: &str) -> Option<String> {
        self.state.lock().ok()?.aliases.get(alias).cloned()
    }

    pub fn key_tags(&self, key_ref: &str) -> Vec<(String, String)> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        resolve(&state, key_ref)
            .ok()
            .and_then(|id| state.keys.get(&id).map(|k| k.tags.clone()))
            .unwrap_or_default()
    }
}

impl Default for InMemoryKms {
    fn default() -> Self {
        Self::new("us-east-1", "000000000000")
    }
}

/// Map a key id, ARN or alias to the key id.
fn resolve(state: &KmsState, key_ref: &str) -> ByodResult<String> {
    if key_ref.starts_with("alias/") {
        return state
            .aliases
            .get(key_ref)
            .cloned()
            .ok_or_else(|| ByodError::NotFound(format!("alias {key_ref}")));
    }
    let id = key_ref.rsplit("key/").next().unwrap_or(key_ref);
    if state.keys.contains_key(id) {
        Ok(id.to_string())
    } else {
        Err(ByodError::NotFound(format!("KMS key {key_ref}")))
    }
}

fn usable<'a>(state: &'a KmsState, key_ref: &str) -> ByodResult<(String, &'a KeyRecord)> {
    let id = resolve(state, key_ref)?;
    let record = state
        .keys
        .get(&id)
        .ok_or_else(|| ByodError::NotFound(format!("KMS key {key_ref}")))?;
    if record.state != KeyState::Enabled {
        return Err(ByodError::backend(format!(
            "KMS key is {}: cannot use it",
            record.state.as_str()
        )));
    }
    Ok((id, record))
}

#[async_trait]
impl KeyManagementBackend for InMemoryKms {
    async fn generate_data_key(&self, key_ref: &str) -> ByodResult<GeneratedKey> {
        self.check("generate_data_key")?;
        let state = self.state.lock().map_err(|_| poisoned())?;
        let (id, record) = usable(&state, key_ref)?;

        let key = generate_dek();
        let sealed = byod_crypto::encrypt(&record.material, key.as_bytes(), Some(id.as_bytes()))
            .map_err(|e| ByodError::backend(format!("KMS GenerateDataKey failed: {e}")))?;

        let mut wrapped = Vec::with_capacity(1 + id.len() + sealed.len());
        wrapped.push(id.len() as u8);
        wrapped.extend_from_slice(id.as_bytes());
        wrapped.extend_from_slice(&sealed);

        debug!(key_id = %id, wrapped_len = wrapped.len(), "generated data key");
        Ok(GeneratedKey { key, wrapped })
    }

    async fn decrypt(&self, wrapped: &[u8], key_ref: &str) -> ByodResult<DataKey> {
        self.check("decrypt")?;
        let (&len, rest) = wrapped
            .split_first()
            .ok_or_else(|| ByodError::backend("KMS Decrypt failed: empty ciphertext blob"))?;
        let len = len as usize;
        if rest.len() < len {
            return Err(ByodError::backend("KMS Decrypt failed: invalid ciphertext blob"));
        }
        let (blob_id, sealed) = rest.split_at(len);
        let blob_id = std::str::from_utf8(blob_id)
            .map_err(|_| ByodError::backend("KMS Decrypt failed: invalid ciphertext blob"))?;

        let state = self.state.lock().map_err(|_| poisoned())?;
        let (id, record) = usable(&state, key_ref)?;
        if id != blob_id {
            return Err(ByodError::backend(
                "KMS Decrypt failed: IncorrectKeyException, blob was encrypted under another key",
            ));
        }

        let plaintext = Zeroizing::new(
            byod_crypto::decrypt(&record.material, sealed, Some(id.as_bytes()))
                .map_err(|e| ByodError::backend(format!("KMS Decrypt failed: {e}")))?,
        );
        Ok(DataKey::from_slice(&plaintext)?)
    }

    async fn describe_key(&self, key_ref: &str) -> ByodResult<KeyDescription> {
        self.check("describe_key")?;
        let state = self.state.lock().map_err(|_| poisoned())?;
        let id = resolve(&state, key_ref)?;
        let record = state
            .keys
            .get(&id)
            .ok_or_else(|| ByodError::NotFound(format!("KMS key {key_ref}")))?;
        Ok(KeyDescription {
            key_id: id,
            arn: Some(record.arn.clone()),
            state: record.state.clone(),
            usage: "ENCRYPT_DECRYPT".into(),
        })
    }

    async fn get_policy(&self, key_ref: &str) -> ByodResult<Value> {
        self.check("get_policy")?;
        let state = self.state.lock().map_err(|_| poisoned())?;
        let id = resolve(&state, key_ref)?;
        Ok(state.keys.get(&id).map(|k| k.policy.clone()).unwrap_or(Value::Null))
    }

    async fn put_policy(&self, key_ref: &str, policy: &Value) -> ByodResult<()> {
        self.check("put_policy")?;
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let id = resolve(&state, key_ref)?;
        if let Some(record) = state.keys.get_mut(&id) {
            record.policy = policy.clone();
        }
        Ok(())
    }

    async fn create_key(
        &self,
        description: &str,
        policy: &Value,
        tags: &[(String, String)],
    ) -> ByodResult<KeyDescription> {
        self.check("create_key")?;
        let created = self.insert_key(description, policy.clone(), tags);
        debug!(key_id = %created.key_id, "created KMS key");
        Ok(created)
    }

    async fn create_alias(&self, alias: &str, key_ref: &str) -> ByodResult<()> {
        self.check("create_alias")?;
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.aliases.contains_key(alias) {
            return Err(ByodError::backend(format!(
                "AlreadyExistsException: alias {alias} already exists"
            )));
        }
        let id = resolve(&state, key_ref)?;
        state.aliases.insert(alias.to_string(), id);
        Ok(())
    }

    async fn delete_alias(&self, alias: &str) -> ByodResult<()> {
        self.check("delete_alias")?;
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        state
            .aliases
            .remove(alias)
            .map(|_| ())
            .ok_or_else(|| ByodError::NotFound(format!("alias {alias}")))
    }

    async fn schedule_key_deletion(&self, key_ref: &str, pending_days: u8) -> ByodResult<()> {
        check_pending_days(pending_days)?;
        self.check("schedule_key_deletion")?;
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let id = resolve(&state, key_ref)?;
        if let Some(record) = state.keys.get_mut(&id) {
            record.state = KeyState::PendingDeletion;
            record.pending_days = Some(pending_days);
            debug!(key_id = %id, description = %record.description, pending_days, "key scheduled for deletion");
        }
        Ok(())
    }
}

struct RoleRecord {
    arn: String,
    trust: Value,
    policies: BTreeMap<String, Value>,
}

/// An IAM/STS double for one account.
pub struct InMemoryIdentity {
    account_id: String,
    roles: Mutex<BTreeMap<String, RoleRecord>>,
}

impl InMemoryIdentity {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            roles: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn role_exists(&self, name: &str) -> bool {
        self.roles.lock().map(|r| r.contains_key(name)).unwrap_or(false)
    }

    pub fn role_trust_policy(&self, name: &str) -> Option<Value> {
        self.roles.lock().ok()?.get(name).map(|r| r.trust.clone())
    }

    pub fn role_policy(&self, role: &str, policy_name: &str) -> Option<Value> {
        self.roles
            .lock()
            .ok()?
            .get(role)
            .and_then(|r| r.policies.get(policy_name).cloned())
    }
}

fn no_such_role(role: &str) -> ByodError {
    ByodError::NotFound(format!("IAM role {role}"))
}

#[async_trait]
impl IdentityBackend for InMemoryIdentity {
    async fn caller_account_id(&self) -> ByodResult<String> {
        Ok(self.account_id.clone())
    }

    async fn create_role(
        &self,
        name: &str,
        trust_policy: &Value,
        _description: &str,
        _tags: &[(String, String)],
    ) -> ByodResult<String> {
        let mut roles = self
            .roles
            .lock()
            .map_err(|_| ByodError::backend("in-memory IAM lock poisoned"))?;
        let record = roles.entry(name.to_string()).or_insert_with(|| RoleRecord {
            arn: format!("arn:aws:iam::{}:role/{name}", self.account_id),
            trust: trust_policy.clone(),
            policies: BTreeMap::new(),
        });
        Ok(record.arn.clone())
    }

    async fn put_role_policy(&self, role: &str, policy_name: &str, document: &Value) -> ByodResult<()> {
        let mut roles = self
            .roles
            .lock()
            .map_err(|_| ByodError::backend("in-memory IAM lock poisoned"))?;
        let record = roles.get_mut(role).ok_or_else(|| no_such_role(role))?;
        record.policies.insert(policy_name.to_string(), document.clone());
        Ok(())
    }

    async fn list_role_policies(&self, role: &str) -> ByodResult<Vec<String>> {
        let roles = self
            .roles
            .lock()
            .map_err(|_| ByodError::backend("in-memory IAM lock poisoned"))?;
        let record = roles.get(role).ok_or_else(|| no_such_role(role))?;
        Ok(record.policies.keys().cloned().collect())
    }

    async fn delete_role_policy(&self, role: &str, policy_name: &str) -> ByodResult<()> {
        let mut roles = self
            .roles
            .lock()
            .map_err(|_| ByodError::backend("in-memory IAM lock poisoned"))?;
        let record = roles.get_mut(role).ok_or_else(|| no_such_role(role))?;
        record
            .policies
            .remove(policy_name)
            .map(|_| ())
            .ok_or_else(|| ByodError::NotFound(format!("role policy {policy_name}")))
    }

    async fn delete_role(&self, role: &str) -> ByodResult<()> {
        let mut roles = self
            .roles
            .lock()
            .map_err(|_| ByodError::backend("in-memory IAM lock poisoned"))?;
        let record = roles.get(role).ok_or_else(|| no_such_role(role))?;
        if !record.policies.is_empty() {
            return Err(ByodError::backend(format!(
                "DeleteConflict: role {role} still has inline policies"
            )));
        }
        roles.remove(role);
        Ok(())
    }
}
