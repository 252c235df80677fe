//! byodd: local companion server for byod
//!
//! Usage:
//!   byodd [--config ~/.byod/config.toml] [--bind 127.0.0.1:8470] [--results-dir DIR]
//!
//! Serves submit, status and get to a local UI over HTTP, with progress as
//! server-sent events. Inputs are read from this machine and results are
//! decrypted onto it; only ciphertext leaves.

mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use byod_core::config::{default_config_path, ByodConfig, JobBackend};
use byod_kms::KeyManagementBackend;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use server::{AppState, ServerInfo};

#[derive(Parser, Debug)]
#[command(name = "byodd", version, about = "byod local companion server")]
struct Cli {
    /// Path to config.toml (default: ~/.byod/config.toml)
    #[arg(long, short = 'c', env = "BYOD_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "BYOD_BIND", default_value = "127.0.0.1:8470")]
    bind: String,

    /// Where `get` writes results by default (default: <config dir>/results)
    #[arg(long, env = "BYOD_RESULTS_DIR")]
    results_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "BYOD_LOG", default_value = "info")]
    log: String,

    /// Log format (json, text)
    #[arg(long, env = "BYOD_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log, &cli.log_format);

    let config_path = cli.config.unwrap_or_else(default_config_path);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        bind = %cli.bind,
        "byodd starting"
    );

    let mut config = ByodConfig::load(&config_path)
        .with_context(|| format!("reading config: {}", config_path.display()))?;
    config.apply_env_overrides(|name| std::env::var(name).ok());

    let platform = byod_jobs::platform_from_config(&config, byod_storage::credentials_from_env())
        .context("building job platform")?;

    let region = match platform.region().await {
        Ok(region) => region,
        Err(e) => {
            warn!("could not resolve the platform region, using [storage] region: {e}");
            config.storage.region.clone()
        }
    };
    let kms = build_kms(&region).await?;

    let results_root = cli.results_dir.unwrap_or_else(|| {
        config_path
            .parent()
            .map(|dir| dir.join("results"))
            .unwrap_or_else(|| PathBuf::from("results"))
    });
    tokio::fs::create_dir_all(&results_root)
        .await
        .with_context(|| format!("creating results dir: {}", results_root.display()))?;

    let state = AppState {
        platform,
        kms,
        info: ServerInfo {
            backend: match config.backend {
                JobBackend::Api => "api".to_string(),
                JobBackend::Storage => "storage".to_string(),
            },
            profile: config.active_profile.clone(),
            authenticated: config.is_authenticated(),
        },
        results_root,
    };

    server::serve(&cli.bind, state).await
}

#[cfg(feature = "aws")]
async fn build_kms(region: &str) -> Result<Arc<dyn KeyManagementBackend>> {
    let sdk = byod_kms::aws::load_sdk_config(region).await;
    Ok(Arc::new(byod_kms::aws::AwsKms::new(&sdk)))
}

#[cfg(not(feature = "aws"))]
async fn build_kms(_region: &str) -> Result<Arc<dyn KeyManagementBackend>> {
    anyhow::bail!("this build has no KMS backend; rebuild byodd with the `aws` feature")
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
