//! submit, status, list, get, plugins, logs and the deprecated retrieve/decrypt

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use byod_core::output::Tone;
use byod_core::types::{JobFilter, ResultsManifest, RESULTS_MANIFEST_NAME};
use byod_core::{ByodError, JobStatus};
use byod_jobs::platform::api::LogQuery;
use byod_jobs::{
    accepted_extensions, get_results, submit, wait_for_job, GetOptions, SubmitRequest, WaitOutcome,
    DEFAULT_POLL_INTERVAL,
};
use clap::Args;
use serde_json::Value;

use super::print_json;
use crate::context::AppContext;
use crate::progress::{fmt_bytes, make_spinner, make_stage_bar, progress_fn};

#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Plugin to run (see `byod plugins`)
    pub plugin: String,

    /// One file, one directory, or several files
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    #[arg(long, short = 'd')]
    pub description: Option<String>,

    /// Plugin configuration as a JSON object
    #[arg(long, value_parser = parse_json_object)]
    pub config: Option<Value>,

    /// Job tag as key=value (repeatable)
    #[arg(long = "tags", short = 't', value_parser = parse_tag)]
    pub tags: Vec<(String, String)>,

    /// Poll until the job finishes
    #[arg(long)]
    pub wait: bool,

    /// Seconds to wait with --wait (default: profile setting, 3600)
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long, short = 'n', default_value_t = 20)]
    pub limit: usize,
    /// Only jobs in this status
    #[arg(long)]
    pub status: Option<String>,
    /// Only jobs for this plugin
    #[arg(long)]
    pub plugin: Option<String>,
}

#[derive(Args, Debug)]
pub struct GetArgs {
    pub job_id: String,
    /// Directory for the decrypted results
    #[arg(long, short = 'o', default_value = "./results")]
    pub output: PathBuf,
    /// Keep output.enc and output_key.bin next to the results
    #[arg(long)]
    pub keep_encrypted: bool,
    /// Write into a non-empty output directory
    #[arg(long)]
    pub overwrite: bool,
}

#[derive(Args, Debug)]
pub struct LogsArgs {
    pub job_id: String,
    #[arg(long, short = 'n', default_value_t = 100)]
    pub limit: usize,
    #[arg(long)]
    pub level: Option<String>,
    #[arg(long)]
    pub source: Option<String>,
    /// Only entries after this timestamp
    #[arg(long)]
    pub since: Option<String>,
}

pub(crate) fn parse_tag(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("invalid tag '{raw}': expected key=value")),
    }
}

pub(crate) fn parse_json_object(raw: &str) -> Result<Value, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err("plugin config must be a JSON object".to_string()),
        Err(e) => Err(format!("invalid JSON: {e}")),
    }
}

// ── `byod submit` ─────────────────────────────────────────────────────────────

pub async fn cmd_submit(ctx: &AppContext, args: SubmitArgs) -> Result<()> {
    let platform = ctx.platform()?;
    let region = platform.region().await?;
    let kms = ctx.kms(&region).await?;

    let request = SubmitRequest {
        plugin: args.plugin,
        inputs: args.inputs,
        description: args.description,
        config: args.config,
        tags: args.tags.into_iter().collect(),
    };

    let pb = make_stage_bar("submit", &ctx.out);
    let progress = progress_fn(&pb);
    let job = submit(platform.as_ref(), kms.as_ref(), &request, Some(&progress))
        .await
        .inspect_err(|_| pb.abandon())?;
    pb.finish_and_clear();

    if ctx.out.is_json() && !args.wait {
        return print_json(&job);
    }
    ctx.out.success(&format!("Job submitted: {}", ctx.out.paint(&job.job_id, Tone::Info)));
    ctx.out.line(format!("  plugin: {}", job.plugin_name));
    ctx.out.line(format!("  status: {}", job.status));

    if !args.wait {
        ctx.out.line(format!("\nCheck progress with: byod status {}", job.job_id));
        return Ok(());
    }

    let timeout = ctx.wait_timeout(args.timeout);
    let outcome = wait_for_job(
        platform.as_ref(),
        &job.job_id,
        Duration::from_secs(timeout),
        DEFAULT_POLL_INTERVAL,
        |info, elapsed| {
            ctx.out.line(format!(
                "  {} {} ({}s)",
                info.status.icon(),
                info.status.message(),
                elapsed.as_secs()
            ))
        },
    )
    .await?;

    match outcome {
        WaitOutcome::Completed(info) => {
            if ctx.out.is_json() {
                return print_json(&info);
            }
            ctx.out.success("Job completed");
            ctx.out.line(format!("Get results with: byod get {} -o ./results", job.job_id));
            Ok(())
        }
        WaitOutcome::Failed { status, error } => Err(ByodError::JobFailed {
            job_id: job.job_id,
            status: status.to_string(),
            error,
        }
        .into()),
        WaitOutcome::TimedOut { last } => {
            let last = last.map(|i| i.status.to_string()).unwrap_or_else(|| "unknown".into());
            if ctx.out.is_json() {
                return print_json(&serde_json::json!({
                    "job_id": job.job_id,
                    "status": last,
                    "timed_out": true,
                }));
            }
            ctx.out.warning(&format!(
                "Stopped waiting after {timeout}s (last status: {last}). The job keeps running; check with: byod status {}",
                job.job_id
            ));
            Ok(())
        }
    }
}

// ── `byod status` ─────────────────────────────────────────────────────────────

pub async fn cmd_status(ctx: &AppContext, job_id: &str) -> Result<()> {
    let platform = ctx.platform()?;
    let info = platform.job_status(job_id).await?;
    if info.status == JobStatus::NotFound {
        return Err(ByodError::NotFound(format!("job {job_id}")).into());
    }

    if ctx.out.is_json() {
        return print_json(&info);
    }

    let tone = match &info.status {
        JobStatus::Completed => Tone::Success,
        s if s.is_failure() => Tone::Error,
        _ => Tone::Info,
    };
    ctx.out.line(format!("Job:       {}", info.job_id));
    ctx.out.line(format!(
        "Status:    {} {} ({})",
        info.status.icon(),
        ctx.out.paint(info.status.as_str(), tone),
        info.status.message()
    ));
    if let Some(plugin) = &info.plugin_name {
        ctx.out.line(format!("Plugin:    {plugin}"));
    }
    if let Some(description) = &info.description {
        ctx.out.line(format!("Desc:      {description}"));
    }
    if let Some(created) = &info.created_at {
        ctx.out.line(format!("Created:   {created}"));
    }
    if let Some(completed) = &info.completed_at {
        ctx.out.line(format!("Completed: {completed}"));
    }
    if let Some(error) = &info.error {
        ctx.out.line(format!("Error:     {}", ctx.out.paint(error, Tone::Error)));
    }
    if info.status == JobStatus::Completed {
        ctx.out.line(format!("\nGet results with: byod get {job_id} -o ./results"));
    }
    Ok(())
}

// ── `byod list` ───────────────────────────────────────────────────────────────

pub async fn cmd_list(ctx: &AppContext, args: ListArgs) -> Result<()> {
    let platform = ctx.platform()?;
    let jobs = platform
        .list_jobs(&JobFilter {
            limit: args.limit.max(1),
            status: args.status.as_deref().map(JobStatus::parse),
            plugin: args.plugin,
        })
        .await?;

    if ctx.out.is_json() {
        return print_json(&jobs);
    }
    if jobs.is_empty() {
        ctx.out.line("No jobs found.");
        return Ok(());
    }

    ctx.out.line(ctx.out.paint(
        &format!("{:<44} {:<20} {:<12} {}", "JOB ID", "PLUGIN", "STATUS", "CREATED"),
        Tone::Dim,
    ));
    for job in &jobs {
        ctx.out.line(format!(
            "{:<44} {:<20} {:<12} {}",
            job.job_id,
            job.plugin_name,
            job.status.as_str(),
            job.created_at.as_deref().unwrap_or("-")
        ));
    }
    Ok(())
}

// ── `byod get` ────────────────────────────────────────────────────────────────

pub async fn cmd_get(ctx: &AppContext, args: GetArgs) -> Result<()> {
    let platform = ctx.platform()?;
    let region = platform.region().await?;
    let kms = ctx.kms(&region).await?;

    let pb = make_stage_bar("get", &ctx.out);
    let progress = progress_fn(&pb);
    let summary = get_results(
        platform.as_ref(),
        kms.as_ref(),
        &args.job_id,
        &args.output,
        GetOptions {
            keep_encrypted: args.keep_encrypted,
            overwrite: args.overwrite,
        },
        Some(&progress),
    )
    .await
    .inspect_err(|_| pb.abandon())?;
    pb.finish_and_clear();

    if ctx.out.is_json() {
        return print_json(&summary);
    }
    ctx.out.success(&format!(
        "Results for {} decrypted to {} ({})",
        summary.job_id,
        summary.output_dir.display(),
        fmt_bytes(summary.decrypted_size as u64)
    ));
    for file in &summary.files {
        ctx.out.line(format!("  {file}"));
    }
    Ok(())
}

// ── deprecated `byod retrieve` / `byod decrypt` ───────────────────────────────

#[allow(deprecated)]
pub async fn cmd_retrieve(ctx: &AppContext, job_id: &str, output: &Path, overwrite: bool) -> Result<()> {
    let platform = ctx.platform()?;
    let manifest = byod_jobs::retrieve::retrieve(platform.as_ref(), job_id, output, overwrite).await?;

    if ctx.out.is_json() {
        return print_json(&manifest);
    }
    ctx.out.success(&format!(
        "Encrypted results saved to {}",
        output.display()
    ));
    ctx.out
        .line(format!("Decrypt with: byod decrypt {} -o <dir>", output.display()));
    Ok(())
}

#[allow(deprecated)]
pub async fn cmd_decrypt(ctx: &AppContext, results_dir: &Path, output: &Path) -> Result<()> {
    let region = manifest_region(results_dir).unwrap_or_else(|| ctx.default_region());
    let kms = ctx.kms(&region).await?;
    let files = byod_jobs::retrieve::decrypt(kms.as_ref(), results_dir, output).await?;

    if ctx.out.is_json() {
        return print_json(&files);
    }
    ctx.out.success(&format!("Decrypted {} file(s) to {}", files.len(), output.display()));
    for file in &files {
        ctx.out.line(format!("  {file}"));
    }
    Ok(())
}

/// Region recorded by a previous download, when the manifest is readable.
fn manifest_region(results_dir: &Path) -> Option<String> {
    let raw = std::fs::read(results_dir.join(RESULTS_MANIFEST_NAME)).ok()?;
    let manifest: ResultsManifest = serde_json::from_slice(&raw).ok()?;
    Some(manifest.region).filter(|r| !r.is_empty())
}

// ── `byod plugins` ────────────────────────────────────────────────────────────

pub async fn cmd_plugins(ctx: &AppContext) -> Result<()> {
    let platform = ctx.platform()?;
    let spinner = make_spinner("plugins", &ctx.out);
    spinner.set_message("fetching plugins...");
    let plugins = platform.plugins().await.inspect_err(|_| spinner.abandon())?;
    spinner.finish_and_clear();

    if ctx.out.is_json() {
        return print_json(&plugins);
    }
    if plugins.is_empty() {
        ctx.out.line("No plugins available.");
        return Ok(());
    }
    for plugin in &plugins {
        let version = plugin.version.as_deref().map(|v| format!(" v{v}")).unwrap_or_default();
        ctx.out.line(format!("{}{}", ctx.out.paint(&plugin.name, Tone::Info), version));
        if let Some(description) = &plugin.description {
            ctx.out.line(format!("  {description}"));
        }
        let accepted = match accepted_extensions(&plugin.inputs) {
            Some(exts) => exts.into_iter().collect::<Vec<_>>().join(", "),
            None => "any file".to_string(),
        };
        ctx.out.line(format!("  accepts: {accepted}"));
    }
    Ok(())
}

// ── `byod logs` ───────────────────────────────────────────────────────────────

pub async fn cmd_logs(ctx: &AppContext, args: LogsArgs) -> Result<()> {
    ctx.require_api_backend("logs")?;
    let api = ctx.api()?;
    let response = api
        .job_logs(
            &args.job_id,
            &LogQuery {
                limit: args.limit,
                level: args.level,
                source: args.source,
                since: args.since,
            },
        )
        .await
        .with_context(|| format!("fetching logs for {}", args.job_id))?;

    if ctx.out.is_json() {
        return print_json(&response);
    }
    let entries = log_entries(&response);
    if entries.is_empty() {
        ctx.out.line("No log entries.");
        return Ok(());
    }
    for entry in entries {
        ctx.out.line(format_log_entry(entry));
    }
    Ok(())
}

/// Entries from either `{"logs": [...]}` or a bare array.
fn log_entries(response: &Value) -> &[Value] {
    response
        .get("logs")
        .unwrap_or(response)
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn format_log_entry(entry: &Value) -> String {
    let field = |name: &str| entry.get(name).and_then(Value::as_str).unwrap_or("");
    let source = field("source");
    format!(
        "{} [{}]{} {}",
        field("timestamp"),
        field("level").to_uppercase(),
        if source.is_empty() { String::new() } else { format!(" {source}:") },
        field("message")
    )
}
