//! byod-storage: OpenDAL operators for the data and results buckets

pub mod health;
pub mod operator;

pub use health::{check_health, is_healthy};
pub use operator::{
    build_bucket_operators, build_from_core_config, build_operator, credentials_from, credentials_from_env,
    BucketOperators, OperatorConfig,
};
