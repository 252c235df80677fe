//! auth, config, and the AWS account setup around the tenant's KMS key

use std::time::Duration;

use anyhow::{Context, Result};
use byod_core::config::Profile;
use byod_core::ByodError;
use byod_jobs::ApiPlatform;
#[cfg(feature = "aws")]
use clap::Args;
use clap::Subcommand;
use secrecy::SecretString;
use serde_json::json;

use super::print_json;
use crate::context::AppContext;

#[derive(Subcommand, Debug)]
pub enum AuthAction {
    /// Store an API key and load the tenant profile
    Login {
        /// API key (prompted for when omitted)
        #[arg(long)]
        api_key: Option<String>,
        /// Profile name to save the tenant under
        #[arg(long)]
        profile: Option<String>,
    },
    /// Remove the stored API key
    Logout,
    /// Check the stored API key against the platform
    Status,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the active configuration (file + environment), key redacted
    Show,
    /// Print the config file path
    Path,
}

// ── `byod auth` ───────────────────────────────────────────────────────────────

pub async fn cmd_auth(ctx: &AppContext, action: AuthAction) -> Result<()> {
    match action {
        AuthAction::Login { api_key, profile } => {
            let api_key = match api_key {
                Some(key) => key,
                None => rpassword::prompt_password("API key: ").context("reading API key")?,
            };
            let api_key = api_key.trim().to_string();
            if api_key.is_empty() {
                return Err(ByodError::Validation("API key is empty".into()).into());
            }

            let api = ApiPlatform::new(
                &ctx.config.api_url,
                SecretString::from(api_key.clone()),
                Duration::from_secs(ctx.config.global.timeout),
                ctx.config.global.verify_ssl,
            )?;
            api.verify_auth().await?;
            let tenant = api.tenant_config().await?.clone();

            let name = profile.unwrap_or_else(|| ctx.active_profile_name());
            ctx.update_config(|cfg| {
                cfg.api_key = Some(SecretString::from(api_key));
                let settings = cfg
                    .profiles
                    .get(&name)
                    .map(|p| p.settings.clone())
                    .unwrap_or_default();
                cfg.upsert_profile(
                    &name,
                    Profile {
                        tenant_id: tenant.tenant_id.clone(),
                        organization_name: tenant.organization_name.clone(),
                        region: tenant.region.clone(),
                        created_at: Some(chrono::Utc::now().to_rfc3339()),
                        settings,
                    },
                );
            })?;

            if ctx.out.is_json() {
                return print_json(&json!({
                    "profile": name,
                    "tenant_id": tenant.tenant_id,
                    "organization_name": tenant.organization_name,
                    "region": tenant.region,
                }));
            }
            ctx.out.success(&format!(
                "Logged in as {} ({})",
                tenant.organization_name, tenant.tenant_id
            ));
            ctx.out.line(format!("  profile: {name}"));
            ctx.out.line(format!("  region:  {}", tenant.region));
            Ok(())
        }
        AuthAction::Logout => {
            ctx.update_config(|cfg| cfg.api_key = None)?;
            ctx.out.success("API key removed");
            if std::env::var("BYOD_API_KEY").is_ok_and(|v| !v.is_empty()) {
                ctx.out.warning("BYOD_API_KEY is still set in the environment");
            }
            Ok(())
        }
        AuthAction::Status => {
            let api = ctx.api()?;
            let me = api.verify_auth().await?;
            if ctx.out.is_json() {
                return print_json(&me);
            }
            ctx.out.success(&format!("Authenticated against {}", api.base_url()));
            if let Some((name, profile)) = ctx.config.active_profile() {
                ctx.out.line(format!("  profile: {name} (tenant {})", profile.tenant_id));
            }
            Ok(())
        }
    }
}

// ── `byod config` ─────────────────────────────────────────────────────────────

pub fn cmd_config(ctx: &AppContext, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let redacted = ctx.config.redacted();
            if ctx.out.is_json() {
                return print_json(&redacted);
            }
            let rendered = toml::to_string_pretty(&redacted).context("rendering config")?;
            println!("# {}", ctx.config_path.display());
            print!("{rendered}");
            Ok(())
        }
        ConfigAction::Path => {
            println!("{}", ctx.config_path.display());
            Ok(())
        }
    }
}

// ── AWS account setup (feature: aws) ──────────────────────────────────────────

#[cfg(feature = "aws")]
#[derive(Args, Debug)]
pub struct SetupArgs {
    /// Tear down any existing role and key first
    #[arg(long)]
    pub new: bool,
    /// AWS region for the key (default: tenant region)
    #[arg(long)]
    pub region: Option<String>,
    /// Profile to record the key and role in (default: active profile)
    #[arg(long)]
    pub profile: Option<String>,
}

#[cfg(feature = "aws")]
#[derive(Args, Debug)]
pub struct UpdatePolicyArgs {
    /// Key ARN, id or alias (default: the profile's kms_key_arn)
    #[arg(long)]
    pub key: Option<String>,
    #[arg(long)]
    pub region: Option<String>,
}

#[cfg(feature = "aws")]
#[derive(Args, Debug)]
pub struct TeardownArgs {
    /// Days before the KMS key is deleted (7-30)
    #[arg(long, default_value_t = 7, value_parser = clap::value_parser!(u8).range(7..=30))]
    pub keep_days: u8,
    /// Skip the confirmation prompt
    #[arg(long, short = 'y')]
    pub yes: bool,
    #[arg(long)]
    pub region: Option<String>,
}

/// `--region`, else the profile's region, else the tenant's.
#[cfg(feature = "aws")]
async fn resolve_region(ctx: &AppContext, flag: Option<String>, api: &ApiPlatform) -> Result<String> {
    use byod_jobs::JobPlatform;

    if let Some(region) = flag {
        return Ok(region);
    }
    if let Some((_, profile)) = ctx.config.active_profile() {
        if !profile.region.is_empty() {
            return Ok(profile.region.clone());
        }
    }
    Ok(api.region().await?)
}

#[cfg(feature = "aws")]
pub async fn cmd_setup(ctx: &AppContext, args: SetupArgs) -> Result<()> {
    use byod_jobs::KmsRegistration;
    use byod_kms::aws::{load_sdk_config, AwsIdentity, AwsKms};
    use byod_kms::{provision, SetupParams};

    let api = ctx.api()?;
    let enclave = api.enclave_info().await.context("fetching enclave info")?;
    let measurements = enclave.measurements();
    let region = resolve_region(ctx, args.region, &api).await?;

    let sdk = load_sdk_config(&region).await;
    let kms = AwsKms::new(&sdk);
    let iam = AwsIdentity::new(&sdk);

    let mut params = SetupParams::new(&enclave.tenant_id, &enclave.account_id, measurements, &region);
    params.force_new = args.new;

    let spinner = crate::progress::make_spinner("setup", &ctx.out);
    spinner.set_message("creating enclave role and KMS key...");
    let outcome = provision(&kms, &iam, &params)
        .await
        .inspect_err(|_| spinner.abandon())?;

    spinner.set_message("registering key with the platform...");
    api.register_kms_setup(&KmsRegistration {
        kms_key_arn: outcome.key_arn.clone(),
        role_arn: outcome.role_arn.clone(),
        aws_account_id: outcome.account_id.clone(),
        region: region.clone(),
    })
    .await
    .inspect_err(|_| spinner.abandon())
    .context("registering KMS setup")?;
    spinner.finish_and_clear();

    let name = args.profile.unwrap_or_else(|| ctx.active_profile_name());
    ctx.update_config(|cfg| {
        let profile = cfg.profiles.entry(name.clone()).or_default();
        if profile.tenant_id.is_empty() {
            profile.tenant_id = enclave.tenant_id.clone();
        }
        profile.region = region.clone();
        profile.settings.kms_key_arn = Some(outcome.key_arn.clone());
        profile.settings.role_arn = Some(outcome.role_arn.clone());
        profile.settings.aws_account_id = Some(outcome.account_id.clone());
        cfg.active_profile = Some(name.clone());
    })?;

    if ctx.out.is_json() {
        return print_json(&outcome);
    }
    ctx.out.success("KMS key and enclave role ready");
    ctx.out.line(format!("  key:     {}", outcome.key_arn));
    ctx.out.line(format!("  alias:   {}", outcome.alias));
    ctx.out.line(format!("  role:    {}", outcome.role_arn));
    ctx.out.line(format!("  account: {} ({region})", outcome.account_id));
    ctx.out.line(format!(
        "  trusted enclave measurements: {}",
        params
            .pcr0_values
            .iter()
            .map(|v| byod_kms::policy::short_pcr0(v))
            .collect::<Vec<_>>()
            .join(", ")
    ));
    Ok(())
}

#[cfg(feature = "aws")]
pub async fn cmd_update_policy(ctx: &AppContext, args: UpdatePolicyArgs) -> Result<()> {
    use byod_kms::aws::{load_sdk_config, AwsKms};
    use byod_kms::{update_attestation, PolicyUpdate};

    let key = args
        .key
        .or_else(|| {
            ctx.config
                .active_profile()
                .and_then(|(_, p)| p.settings.kms_key_arn.clone())
        })
        .ok_or_else(|| {
            ByodError::Config("No KMS key recorded for this profile. Run 'byod setup' or pass --key.".into())
        })?;

    let api = ctx.api()?;
    let measurements = api.enclave_info().await?.measurements();
    let region = resolve_region(ctx, args.region, &api).await?;
    let kms = AwsKms::new(&load_sdk_config(&region).await);

    match update_attestation(&kms, &key, &measurements).await? {
        PolicyUpdate::Updated(_) => {
            if ctx.out.is_json() {
                return print_json(&json!({ "updated": true, "pcr0_values": measurements }));
            }
            ctx.out.success(&format!(
                "Key policy now trusts {} enclave measurement(s)",
                measurements.len()
            ));
        }
        PolicyUpdate::AlreadyUpToDate => {
            if ctx.out.is_json() {
                return print_json(&json!({ "updated": false, "pcr0_values": measurements }));
            }
            ctx.out.success("Key policy already up to date");
        }
    }
    Ok(())
}

#[cfg(feature = "aws")]
pub async fn cmd_teardown(ctx: &AppContext, args: TeardownArgs) -> Result<()> {
    use byod_kms::aws::{load_sdk_config, AwsIdentity, AwsKms};
    use byod_kms::policy::role_name;
    use byod_kms::teardown;

    let profile = ctx.config.active_profile().map(|(_, p)| p.clone());
    let api = ctx.api()?;
    let tenant_id = match profile.as_ref().map(|p| p.tenant_id.clone()).filter(|t| !t.is_empty()) {
        Some(tenant) => tenant,
        None => api.enclave_info().await?.tenant_id,
    };
    let key_ref = profile.as_ref().and_then(|p| p.settings.kms_key_arn.clone());

    if !args.yes {
        let prompt = format!(
            "Delete role {} and schedule the KMS key for deletion in {} days? \
             Data encrypted for this tenant cannot be processed afterwards.",
            role_name(&tenant_id),
            args.keep_days
        );
        if !super::confirm(&prompt)? {
            ctx.out.line("Aborted.");
            return Ok(());
        }
    }

    let region = resolve_region(ctx, args.region, &api).await?;
    let sdk = load_sdk_config(&region).await;
    let report = teardown(
        &AwsKms::new(&sdk),
        &AwsIdentity::new(&sdk),
        &tenant_id,
        key_ref.as_deref(),
        args.keep_days,
    )
    .await?;

    if report.is_complete() {
        ctx.update_config(|cfg| {
            if let Some(profile) = cfg.active_profile_mut() {
                profile.settings.kms_key_arn = None;
                profile.settings.role_arn = None;
                profile.settings.aws_account_id = None;
            }
        })?;
    }

    if ctx.out.is_json() {
        print_json(&report)?;
    } else {
        if report.role_deleted {
            ctx.out.success("Enclave role deleted");
        }
        if report.key_scheduled {
            ctx.out.success(&format!(
                "KMS key scheduled for deletion in {} days",
                report.pending_days
            ));
        }
        for failure in &report.failures {
            ctx.out.error(&format!("{}: {}", failure.step, failure.error));
        }
    }

    if report.is_complete() {
        Ok(())
    } else {
        Err(ByodError::Other(anyhow::anyhow!(
            "teardown incomplete: {} step(s) failed",
            report.failures.len()
        ))
        .into())
    }
}
