use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{ByodError, ByodResult};

pub const DEFAULT_API_URL: &str = "https://byod.cultivatedcode.co";
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Top-level client configuration (loaded from ~/.byod/config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ByodConfig {
    /// Platform API base URL
    pub api_url: String,
    /// Platform API key (BYOD_API_KEY overrides)
    #[serde(
        serialize_with = "serialize_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub api_key: Option<SecretString>,
    /// Name of the profile used when none is given
    pub active_profile: Option<String>,
    /// Where jobs are sent: the platform API or a storage bucket directly
    pub backend: JobBackend,
    pub profiles: BTreeMap<String, Profile>,
    pub global: GlobalConfig,
    pub storage: StorageConfig,
}

impl Default for ByodConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            active_profile: None,
            backend: JobBackend::Api,
            profiles: BTreeMap::new(),
            global: GlobalConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobBackend {
    #[default]
    Api,
    Storage,
}

/// Per-tenant settings, written by `byod setup`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub tenant_id: String,
    pub organization_name: String,
    pub region: String,
    pub created_at: Option<String>,
    pub settings: ProfileSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSettings {
    /// Seconds `submit --wait` polls before giving up
    pub timeout: u64,
    pub kms_key_arn: Option<String>,
    pub role_arn: Option<String>,
    pub aws_account_id: Option<String>,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            timeout: 3600,
            kms_key_arn: None,
            role_arn: None,
            aws_account_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Log level (default: warn for the CLI)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
    pub color_output: bool,
    pub verify_ssl: bool,
    /// Per-request HTTP timeout in seconds
    pub timeout: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            log_format: "text".to_string(),
            color_output: true,
            verify_ssl: true,
            timeout: 30,
        }
    }
}

/// Direct object-storage settings (used when `backend = "storage"`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// S3-compatible endpoint; empty means the AWS default for `region`
    pub endpoint: String,
    pub region: String,
    pub data_bucket: String,
    pub results_bucket: String,
    /// Refuse plaintext HTTP endpoints instead of warning
    pub enforce_tls: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            region: "us-east-1".to_string(),
            data_bucket: String::new(),
            results_bucket: String::new(),
            enforce_tls: false,
        }
    }
}

fn serialize_secret<S: Serializer>(
    secret: &Option<SecretString>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_str(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

impl ByodConfig {
    pub fn from_toml_str(content: &str) -> ByodResult<Self> {
        toml::from_str(content).map_err(|e| ByodError::Config(format!("parsing config: {e}")))
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> ByodResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Write atomically with owner-only permissions.
    pub fn save(&self, path: &Path) -> ByodResult<()> {
        let rendered = toml::to_string_pretty(self)
            .map_err(|e| ByodError::Config(format!("serializing config: {e}")))?;
        let parent = path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent)?;
        set_owner_only(parent, 0o700)?;

        let tmp_path = parent.join(format!(
            ".{}.tmp",
            path.file_name().unwrap_or_default().to_string_lossy()
        ));
        std::fs::write(&tmp_path, rendered.as_bytes())?;
        set_owner_only(&tmp_path, 0o600)?;
        std::fs::rename(&tmp_path, path)?;
        tracing::debug!(path = %path.display(), "config saved");
        Ok(())
    }

    /// Apply BYOD_API_KEY, BYOD_API_URL and BYOD_PROFILE.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("BYOD_API_KEY").filter(|v| !v.is_empty()) {
            self.api_key = Some(SecretString::from(key));
        }
        if let Some(url) = lookup("BYOD_API_URL").filter(|v| !v.is_empty()) {
            self.api_url = url;
        }
        if let Some(profile) = lookup("BYOD_PROFILE").filter(|v| !v.is_empty()) {
            self.active_profile = Some(profile);
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.api_key
            .as_ref()
            .is_some_and(|k| !k.expose_secret().is_empty())
    }

    pub fn active_profile(&self) -> Option<(&str, &Profile)> {
        let name = self.active_profile.as_deref()?;
        self.profiles.get(name).map(|p| (name, p))
    }

    pub fn active_profile_mut(&mut self) -> Option<&mut Profile> {
        let name = self.active_profile.clone()?;
        self.profiles.get_mut(&name)
    }

    /// Insert or replace a profile and make it active.
    pub fn upsert_profile(&mut self, name: &str, profile: Profile) {
        self.profiles.insert(name.to_string(), profile);
        self.active_profile = Some(name.to_string());
    }

    pub fn remove_profile(&mut self, name: &str) -> Option<Profile> {
        let removed = self.profiles.remove(name);
        if self.active_profile.as_deref() == Some(name) {
            self.active_profile = self.profiles.keys().next().cloned();
        }
        removed
    }

    /// Copy with the API key masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.api_key.is_some() {
            copy.api_key = Some(SecretString::from("********"));
        }
        copy
    }
}

/// ~/.byod (or $BYOD_HOME)
pub fn default_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("BYOD_HOME") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_default();
    PathBuf::from(home).join(".byod")
}

pub fn default_config_path() -> PathBuf {
    default_config_dir().join(CONFIG_FILE_NAME)
}

#[cfg(unix)]
pub fn set_owner_only(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn set_owner_only(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
api_url = "https://platform.example.com"
api_key = "sk_live_abc"
active_profile = "acme"
backend = "storage"

[profiles.acme]
tenant_id = "tenant-abc123"
organization_name = "Acme Biotech"
region = "eu-west-1"
created_at = "2025-01-15T10:30:00Z"

[profiles.acme.settings]
timeout = 600
kms_key_arn = "arn:aws:kms:eu-west-1:111122223333:key/k"
role_arn = "arn:aws:iam::999988887777:role/BYODEnclaveRole-tenant-abc123"

[global]
log_level = "debug"
color_output = false
timeout = 10

[storage]
data_bucket = "byod-data"
results_bucket = "byod-results"
enforce_tls = true
"#;
        let config = ByodConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.api_url, "https://platform.example.com");
        assert!(config.is_authenticated());
        assert_eq!(config.backend, JobBackend::Storage);
        let (name, profile) = config.active_profile().unwrap();
        assert_eq!(name, "acme");
        assert_eq!(profile.region, "eu-west-1");
        assert_eq!(profile.settings.timeout, 600);
        assert!(profile.settings.kms_key_arn.is_some());
        assert_eq!(config.global.log_level, "debug");
        assert!(!config.global.color_output);
        assert_eq!(config.global.timeout, 10);
        assert_eq!(config.storage.data_bucket, "byod-data");
        assert!(config.storage.enforce_tls);
    }

    #[test]
    fn test_parse_defaults() {
        let config = ByodConfig::from_toml_str("").unwrap();
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert!(!config.is_authenticated());
        assert_eq!(config.backend, JobBackend::Api);
        assert!(config.active_profile().is_none());
        assert_eq!(config.global.timeout, 30);
        assert!(config.global.verify_ssl);
        assert_eq!(config.storage.region, "us-east-1");
    }

    #[test]
    fn test_parse_partial_profile() {
        let toml_str = r#"
active_profile = "p"
[profiles.p]
tenant_id = "t1"
"#;
        let config = ByodConfig::from_toml_str(toml_str).unwrap();
        let (_, profile) = config.active_profile().unwrap();
        assert_eq!(profile.tenant_id, "t1");
        assert_eq!(profile.settings.timeout, 3600);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ByodConfig::default();
        config.apply_env_overrides(|name| match name {
            "BYOD_API_KEY" => Some("sk_env".into()),
            "BYOD_API_URL" => Some("http://localhost:8000".into()),
            "BYOD_PROFILE" => Some("staging".into()),
            _ => None,
        });
        assert_eq!(
            config.api_key.as_ref().map(|k| k.expose_secret().to_string()),
            Some("sk_env".to_string())
        );
        assert_eq!(config.api_url, "http://localhost:8000");
        assert_eq!(config.active_profile.as_deref(), Some("staging"));
    }

    #[test]
    fn test_empty_env_values_ignored() {
        let mut config = ByodConfig::default();
        config.apply_env_overrides(|_| Some(String::new()));
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("byod").join(CONFIG_FILE_NAME);

        let mut config = ByodConfig {
            api_key: Some(SecretString::from("sk_saved")),
            ..Default::default()
        };
        config.upsert_profile(
            "default",
            Profile {
                tenant_id: "tenant-1".into(),
                region: "us-east-2".into(),
                ..Default::default()
            },
        );
        config.save(&path).unwrap();

        let loaded = ByodConfig::load(&path).unwrap();
        assert!(loaded.is_authenticated());
        assert_eq!(loaded.active_profile.as_deref(), Some("default"));
        assert_eq!(loaded.profiles["default"].region, "us-east-2");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_redacted_hides_key() {
        let config = ByodConfig {
            api_key: Some(SecretString::from("sk_live_secret")),
            ..Default::default()
        };
        let rendered = toml::to_string_pretty(&config.redacted()).unwrap();
        assert!(!rendered.contains("sk_live_secret"));
        assert!(rendered.contains("********"));
    }

    #[test]
    fn test_remove_active_profile_moves_pointer() {
        let mut config = ByodConfig::default();
        config.upsert_profile("a", Profile::default());
        config.upsert_profile("b", Profile::default());
        config.remove_profile("b");
        assert_eq!(config.active_profile.as_deref(), Some("a"));
    }
}
