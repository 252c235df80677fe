//! byod: client for encrypted processing in attested enclaves
//!
//! Jobs:
//!   submit <plugin> <paths...>   - encrypt locally, upload, register a job
//!   status <job-id>              - show job status
//!   list                         - list recent jobs
//!   get <job-id> -o <dir>        - download, decrypt and extract results
//!   plugins / logs <job-id>      - platform plugins and enclave logs
//!
//! Local datasets (master keys in ~/.byod/keys):
//!   keys generate|list|rotate|delete
//!   encrypt <path> -o <dir>      - encrypt a file or tree under a master key
//!   decrypt-dataset <dir> -o <dir>
//!
//! Account:
//!   auth login|logout|status, config show
//!   setup / update-policy / teardown (feature: aws)

mod commands;
mod context;
mod progress;

use std::path::PathBuf;
use std::process::ExitCode;

use byod_core::config::{default_config_path, ByodConfig};
use byod_core::error::exit_code;
use byod_core::output::{OutputFormat, Verbosity};
use byod_core::{ByodError, OutputContext};
use clap::{Parser, Subcommand, ValueEnum};

use commands::{account, jobs, local};
use context::AppContext;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "byod",
    version,
    about = "Bring-your-own-data client",
    long_about = "byod: encrypt data locally, process it in an attested enclave, and decrypt the results"
)]
struct Cli {
    /// Path to config.toml (default: ~/.byod/config.toml)
    #[arg(long = "config-file", short = 'c', env = "BYOD_CONFIG", global = true)]
    config_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to global.log_level
    #[arg(long, env = "BYOD_LOG", global = true)]
    log: Option<String>,

    /// Log format (json, text)
    #[arg(long, env = "BYOD_LOG_FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Output format for command results
    #[arg(long, default_value = "text", global = true)]
    format: FormatArg,

    /// Only print errors
    #[arg(long, short = 'q', global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Print extra detail
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Platform authentication
    Auth {
        #[command(subcommand)]
        action: account::AuthAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: account::ConfigAction,
    },

    // ── Jobs ───────────────────────────────────────────────────────────────────

    /// Encrypt inputs locally and submit a processing job
    Submit(jobs::SubmitArgs),

    /// Show the status of a job
    Status {
        job_id: String,
    },

    /// List recent jobs
    List(jobs::ListArgs),

    /// Download, decrypt and extract the results of a completed job
    Get(jobs::GetArgs),

    /// Download encrypted results only (deprecated: use `get`)
    #[command(hide = true)]
    Retrieve {
        job_id: String,
        #[arg(long, short = 'o')]
        output: PathBuf,
        #[arg(long)]
        overwrite: bool,
    },

    /// Decrypt results downloaded by `retrieve` (deprecated: use `get`)
    #[command(hide = true)]
    Decrypt {
        results_dir: PathBuf,
        #[arg(long, short = 'o')]
        output: PathBuf,
    },

    /// List the processing plugins available to your tenant
    Plugins,

    /// Show enclave logs for a job
    Logs(jobs::LogsArgs),

    // ── Local datasets ─────────────────────────────────────────────────────────

    /// Local master key management
    Keys {
        #[command(subcommand)]
        action: local::KeysAction,
    },

    /// Encrypt a file or directory tree under a local master key
    Encrypt(local::EncryptArgs),

    /// Decrypt a dataset written by `encrypt`
    #[command(name = "decrypt-dataset")]
    DecryptDataset(local::DecryptDatasetArgs),

    // ── AWS account setup ──────────────────────────────────────────────────────

    /// Create the attestation-gated KMS key and enclave role in your AWS account
    #[cfg(feature = "aws")]
    Setup(account::SetupArgs),

    /// Sync the key policy's enclave measurements with the platform
    #[cfg(feature = "aws")]
    #[command(name = "update-policy")]
    UpdatePolicy(account::UpdatePolicyArgs),

    /// Delete the enclave role and schedule the KMS key for deletion
    #[cfg(feature = "aws")]
    Teardown(account::TeardownArgs),
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    Text,
    Json,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = cli.config_file.clone().unwrap_or_else(default_config_path);
    let loaded = ByodConfig::load(&config_path);
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("byod: {e}");
            return ExitCode::from(exit_code::ERROR as u8);
        }
    };
    config.apply_env_overrides(|name| std::env::var(name).ok());

    let level = cli.log.clone().unwrap_or_else(|| config.global.log_level.clone());
    init_logging(&level, &cli.log_format);

    let out = OutputContext::new(
        match (cli.quiet, cli.verbose) {
            (true, _) => Verbosity::Quiet,
            (_, true) => Verbosity::Verbose,
            _ => Verbosity::Normal,
        },
        config.global.color_output && !cli.no_color,
        match cli.format {
            FormatArg::Text => OutputFormat::Text,
            FormatArg::Json => OutputFormat::Json,
        },
    );

    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        backend = ?config.backend,
        "byod starting"
    );

    let ctx = AppContext::new(config, config_path, out);
    match run(&ctx, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&out, &err);
            ExitCode::from(exit_code_for(&err) as u8)
        }
    }
}

async fn run(ctx: &AppContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Auth { action } => account::cmd_auth(ctx, action).await,
        Commands::Config { action } => account::cmd_config(ctx, action),
        Commands::Submit(args) => jobs::cmd_submit(ctx, args).await,
        Commands::Status { job_id } => jobs::cmd_status(ctx, &job_id).await,
        Commands::List(args) => jobs::cmd_list(ctx, args).await,
        Commands::Get(args) => jobs::cmd_get(ctx, args).await,
        Commands::Retrieve {
            job_id,
            output,
            overwrite,
        } => jobs::cmd_retrieve(ctx, &job_id, &output, overwrite).await,
        Commands::Decrypt {
            results_dir,
            output,
        } => jobs::cmd_decrypt(ctx, &results_dir, &output).await,
        Commands::Plugins => jobs::cmd_plugins(ctx).await,
        Commands::Logs(args) => jobs::cmd_logs(ctx, args).await,
        Commands::Keys { action } => local::cmd_keys(ctx, action),
        Commands::Encrypt(args) => local::cmd_encrypt(ctx, args),
        Commands::DecryptDataset(args) => local::cmd_decrypt_dataset(ctx, args),
        #[cfg(feature = "aws")]
        Commands::Setup(args) => account::cmd_setup(ctx, args).await,
        #[cfg(feature = "aws")]
        Commands::UpdatePolicy(args) => account::cmd_update_policy(ctx, args).await,
        #[cfg(feature = "aws")]
        Commands::Teardown(args) => account::cmd_teardown(ctx, args).await,
    }
}

// ── Errors and exit codes ─────────────────────────────────────────────────────

/// The first `ByodError` in the chain decides the exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|e| e.downcast_ref::<ByodError>())
        .map(ByodError::exit_code)
        .unwrap_or(exit_code::ERROR)
}

fn report_error(out: &OutputContext, err: &anyhow::Error) {
    if out.is_json() {
        let code = exit_code_for(err);
        println!(
            "{}",
            serde_json::json!({ "error": format!("{err:#}"), "exit_code": code })
        );
    } else {
        out.error(&format!("{err:#}"));
    }
}

/// Logs go to stderr so command output on stdout stays parseable.
fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_submit() {
        let cli = Cli::try_parse_from([
            "byod",
            "submit",
            "genomic-qc",
            "a.fastq",
            "b.fastq",
            "--tags",
            "project=alpha",
            "--tags",
            "run=2",
            "--config",
            r#"{"min_quality": 30}"#,
            "--wait",
        ])
        .unwrap();
        match cli.command {
            Commands::Submit(args) => {
                assert_eq!(args.plugin, "genomic-qc");
                assert_eq!(args.inputs.len(), 2);
                assert_eq!(args.tags, vec![("project".into(), "alpha".into()), ("run".into(), "2".into())]);
                assert_eq!(args.config.unwrap()["min_quality"], 30);
                assert!(args.wait);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_submit_requires_inputs() {
        assert!(Cli::try_parse_from(["byod", "submit", "demo-count"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["byod", "status", "j-1", "--format", "json", "-q"]).unwrap();
        assert!(matches!(cli.format, FormatArg::Json));
        assert!(cli.quiet);
    }

    #[cfg(feature = "aws")]
    #[test]
    fn test_teardown_keep_days_bounds() {
        assert!(Cli::try_parse_from(["byod", "teardown", "--keep-days", "6"]).is_err());
        assert!(Cli::try_parse_from(["byod", "teardown", "--keep-days", "31"]).is_err());
        assert!(Cli::try_parse_from(["byod", "teardown", "--keep-days", "30"]).is_ok());
    }

    #[test]
    fn test_exit_code_found_through_context() {
        let err = anyhow::Error::from(ByodError::NotFound("job j-1".into())).context("checking status");
        assert_eq!(exit_code_for(&err), exit_code::NOT_FOUND);

        let plain = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&plain), exit_code::ERROR);
    }
}
