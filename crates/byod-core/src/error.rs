use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub type ByodResult<T> = Result<T, ByodError>;

/// Process exit codes shared by the binaries.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const ERROR: i32 = 1;
    pub const AUTH: i32 = 2;
    pub const NETWORK: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
}

/// Coarse category for failures coming out of a key-management, identity or
/// storage backend. The category is all an untrusted surface ever sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendCategory {
    Authentication,
    Kms,
    Network,
    Access,
    Other,
}

impl BackendCategory {
    /// Classify a raw backend error message. Order matters: a KMS call that
    /// fails with access denied is reported as a KMS problem.
    pub fn classify(raw: &str) -> Self {
        let msg = raw.to_lowercase();
        if msg.contains("kms") || msg.contains("decrypt") || msg.contains("encrypt") {
            BackendCategory::Kms
        } else if msg.contains("connect") || msg.contains("timeout") || msg.contains("timed out") {
            BackendCategory::Network
        } else if msg.contains("credential")
            || msg.contains("access denied")
            || msg.contains("accessdenied")
            || msg.contains("not authorized")
        {
            BackendCategory::Access
        } else {
            BackendCategory::Other
        }
    }

    pub fn public_message(self) -> &'static str {
        match self {
            BackendCategory::Authentication => "Authentication failed. Check your API key.",
            BackendCategory::Kms => {
                "Encryption operation failed. Check your KMS key configuration."
            }
            BackendCategory::Network => "Connection failed. Check your network and API URL.",
            BackendCategory::Access => {
                "AWS access denied. Check your credentials and permissions."
            }
            BackendCategory::Other => {
                "An unexpected error occurred. Check the CLI logs for details."
            }
        }
    }
}

impl fmt::Display for BackendCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendCategory::Authentication => "authentication",
            BackendCategory::Kms => "kms",
            BackendCategory::Network => "network",
            BackendCategory::Access => "access",
            BackendCategory::Other => "backend",
        };
        f.write_str(name)
    }
}

const INTEGRITY_MESSAGE: &str =
    "Decryption failed: wrong key or tampered data. Check that the results belong to this key.";

#[derive(Debug, Error)]
pub enum ByodError {
    /// The platform rejected our credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// AEAD tag mismatch: the key is wrong or the ciphertext was altered.
    #[error("decryption failed (wrong key or tampered data): {0}")]
    Integrity(String),

    #[error("checksum mismatch for {file}: manifest says {expected}, recovered {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("{} not found. {hint}", path.display())]
    MissingArtifact { path: PathBuf, hint: String },

    #[error("{category} error: {message}")]
    Backend {
        category: BackendCategory,
        message: String,
    },

    #[error("policy statement '{0}' not found; the key policy looks hand-edited, refusing to guess a fix")]
    PolicyStatementNotFound(String),

    #[error("job {job_id} {status}: {error}")]
    JobFailed {
        job_id: String,
        status: String,
        error: String,
    },

    #[error("job {job_id} is not completed yet (status: {status})")]
    JobNotReady { job_id: String, status: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("API error ({status}): {detail}")]
    Api { status: u16, detail: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ByodError {
    /// Build a backend error, classifying the raw message.
    pub fn backend(message: impl Into<String>) -> Self {
        let message = message.into();
        ByodError::Backend {
            category: BackendCategory::classify(&message),
            message,
        }
    }

    /// Message safe to show on an untrusted surface (the companion UI, JSON
    /// output piped elsewhere). Never includes ARNs, key ids or account ids.
    pub fn public_message(&self) -> String {
        match self {
            ByodError::Authentication(_) => {
                BackendCategory::Authentication.public_message().to_string()
            }
            ByodError::Integrity(_) => INTEGRITY_MESSAGE.to_string(),
            ByodError::Backend { category, .. } => category.public_message().to_string(),
            ByodError::Api { status, detail } => {
                format!("API error ({status}): {}", scrub_detail(detail))
            }
            ByodError::Validation(msg) => msg.clone(),
            ByodError::JobNotReady { .. } | ByodError::JobFailed { .. } => self.to_string(),
            ByodError::ChecksumMismatch { file, .. } => {
                format!("Integrity check failed for {file}.")
            }
            other => BackendCategory::classify(&other.to_string())
                .public_message()
                .to_string(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            ByodError::Authentication(_) => exit_code::AUTH,
            ByodError::Backend {
                category: BackendCategory::Authentication,
                ..
            } => exit_code::AUTH,
            ByodError::Backend {
                category: BackendCategory::Network,
                ..
            } => exit_code::NETWORK,
            ByodError::NotFound(_) | ByodError::MissingArtifact { .. } => exit_code::NOT_FOUND,
            _ => exit_code::ERROR,
        }
    }
}

/// Longest platform detail passed on to an untrusted surface.
const MAX_PUBLIC_DETAIL: usize = 200;

/// Platform error text with ARNs and account ids masked, capped in length.
fn scrub_detail(detail: &str) -> String {
    let masked: Vec<&str> = detail
        .split_whitespace()
        .map(|word| {
            if word.contains("arn:") || has_account_id(word) {
                "[redacted]"
            } else {
                word
            }
        })
        .collect();
    let joined = masked.join(" ");
    if joined.chars().count() <= MAX_PUBLIC_DETAIL {
        return joined;
    }
    let mut capped: String = joined.chars().take(MAX_PUBLIC_DETAIL).collect();
    capped.push_str("...");
    capped
}

/// A run of exactly twelve digits, the shape of an AWS account id.
fn has_account_id(word: &str) -> bool {
    word.split(|c: char| !c.is_ascii_digit())
        .any(|run| run.len() == 12)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARN: &str = "arn:aws:kms:us-east-1:123456789012:key/abcd-1234";

    #[test]
    fn test_classify_categories() {
        assert_eq!(
            BackendCategory::classify("KMS Decrypt failed"),
            BackendCategory::Kms
        );
        assert_eq!(
            BackendCategory::classify("dispatch failure: connection refused"),
            BackendCategory::Network
        );
        assert_eq!(
            BackendCategory::classify("AccessDenied: user is not authorized"),
            BackendCategory::Access
        );
        assert_eq!(
            BackendCategory::classify("something odd"),
            BackendCategory::Other
        );
    }

    #[test]
    fn test_public_message_hides_identifiers() {
        let err = ByodError::backend(format!("GenerateDataKey failed for {ARN}: kms throttled"));
        let msg = err.public_message();
        assert!(!msg.contains("arn:aws"));
        assert!(!msg.contains("123456789012"));
        assert_eq!(
            msg,
            "Encryption operation failed. Check your KMS key configuration."
        );

        let other = ByodError::Other(anyhow::anyhow!("role {ARN} exploded"));
        assert!(!other.public_message().contains("123456789012"));
    }

    #[test]
    fn test_authentication_message() {
        let err = ByodError::Authentication("token expired".into());
        assert_eq!(err.public_message(), "Authentication failed. Check your API key.");
        assert_eq!(err.exit_code(), exit_code::AUTH);
    }

    #[test]
    fn test_integrity_is_not_an_api_key_problem() {
        let err = ByodError::Integrity("tag mismatch on output.enc".into());
        let msg = err.public_message();
        assert!(msg.contains("wrong key or tampered data"));
        assert!(!msg.contains("API key"));
        assert_eq!(err.exit_code(), exit_code::ERROR);
    }

    #[test]
    fn test_api_detail_is_scrubbed_and_capped() {
        let err = ByodError::Api {
            status: 400,
            detail: format!("key {ARN} in account 123456789012 is disabled"),
        };
        let msg = err.public_message();
        assert_eq!(
            msg,
            "API error (400): key [redacted] in account [redacted] is disabled"
        );

        let long = ByodError::Api {
            status: 500,
            detail: "x".repeat(5000),
        };
        let msg = long.public_message();
        assert!(msg.ends_with("..."));
        assert!(msg.len() < 300);

        let plain = ByodError::Api {
            status: 422,
            detail: "plugin 'demo' needs 2 inputs".into(),
        };
        assert_eq!(plain.public_message(), "API error (422): plugin 'demo' needs 2 inputs");
    }

    #[test]
    fn test_exit_codes() {
        let net = ByodError::Backend {
            category: BackendCategory::Network,
            message: "timeout".into(),
        };
        assert_eq!(net.exit_code(), exit_code::NETWORK);
        assert_eq!(
            ByodError::NotFound("job x".into()).exit_code(),
            exit_code::NOT_FOUND
        );
        assert_eq!(
            ByodError::Validation("bad".into()).exit_code(),
            exit_code::ERROR
        );
    }
}
