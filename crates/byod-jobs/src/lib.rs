//! byod-jobs: the job lifecycle around an attested enclave
//!
//! ```text
//! submit:  validate ─► KMS GenerateDataKey ─► bundle + seal ─► upload input
//!                                                          └─► upload wrapped key ─► register
//! status:  poll job_status until terminal (or timeout)
//! get:     require completed ─► download output.enc + output_key.bin
//!                            ─► KMS Decrypt ─► open ─► extract (tar.gz or output.bin)
//! ```
//!
//! Everything remote goes through [`JobPlatform`]: either the hosted REST API
//! ([`ApiPlatform`]) or the job buckets directly ([`StoragePlatform`]).

pub mod events;
pub mod platform;
pub mod retrieve;
pub mod status;
pub mod submit;
pub mod validation;

pub use events::{get_results_streaming, submit_streaming, JobEvent, MAX_UPLOAD_BYTES};
pub use platform::api::{ApiPlatform, EnclaveInfo, KmsRegistration, TenantConfig};
pub use platform::storage::StoragePlatform;
pub use platform::{platform_from_config, JobPlatform};
pub use retrieve::{decrypt_results, download_results, get_results, GetOptions, GetSummary};
pub use status::{wait_for_job, StatusTracker, WaitOutcome, DEFAULT_POLL_INTERVAL};
pub use submit::{submit, SubmitRequest};
pub use validation::{accepted_extensions, check_job_id, find_plugin, validate_files_for_plugin};

/// Progress callback type (bytes_done, bytes_total, message)
pub type ProgressFn = Box<dyn Fn(u64, u64, &str) + Send + Sync>;
