//! Local master keys and dataset encryption. Nothing here talks to the network.

use std::path::PathBuf;

use anyhow::Result;
use byod_core::output::Tone;
use byod_core::ByodError;
use byod_crypto::{decrypt_path, encrypt_path, EncryptOptions, KeyMetadata, KeyStore};
use clap::{Args, Subcommand};
use serde_json::json;

use super::{confirm, print_json};
use crate::context::AppContext;
use crate::progress::{fmt_bytes, make_count_bar, progress_fn};

#[derive(Subcommand, Debug)]
pub enum KeysAction {
    /// Create a new master key
    Generate {
        /// Profile the key belongs to (default: active profile)
        #[arg(long)]
        profile: Option<String>,
        /// Key size in bits: 128, 192 or 256 (dataset wrapping needs 256)
        #[arg(long, default_value_t = 256)]
        bits: u32,
    },
    /// List master keys, newest first
    List,
    /// Replace a key with a fresh one of the same size
    Rotate { key_id: String },
    /// Destroy a key; data encrypted under it becomes unrecoverable
    Delete {
        key_id: String,
        /// Skip the confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

#[derive(Args, Debug)]
pub struct EncryptArgs {
    /// File or directory to encrypt
    pub input: PathBuf,
    #[arg(long, short = 'o')]
    pub output: PathBuf,
    /// Master key to use (default: newest unrotated key)
    #[arg(long)]
    pub key_id: Option<String>,
    /// Only files whose name matches (repeatable)
    #[arg(long)]
    pub include: Vec<String>,
    /// Skip files whose name matches (repeatable)
    #[arg(long)]
    pub exclude: Vec<String>,
    /// Keep paths relative to the input directory instead of flattening
    #[arg(long)]
    pub preserve_structure: bool,
}

#[derive(Args, Debug)]
pub struct DecryptDatasetArgs {
    /// Directory written by `byod encrypt`
    pub input: PathBuf,
    #[arg(long, short = 'o')]
    pub output: PathBuf,
    /// Skip the sha256 comparison against the manifest
    #[arg(long)]
    pub no_verify: bool,
}

fn open_store(ctx: &AppContext) -> Result<KeyStore> {
    Ok(KeyStore::open(&ctx.config_dir()).map_err(ByodError::from)?)
}

/// Newest key that has not been rotated away.
fn default_key_id(keys: &[KeyMetadata]) -> Option<&str> {
    keys.iter()
        .find(|k| !k.is_rotated())
        .map(|k| k.key_id.as_str())
}

// ── `byod keys` ───────────────────────────────────────────────────────────────

pub fn cmd_keys(ctx: &AppContext, action: KeysAction) -> Result<()> {
    let store = open_store(ctx)?;
    match action {
        KeysAction::Generate { profile, bits } => {
            let profile = profile.unwrap_or_else(|| ctx.active_profile_name());
            let key_id = store
                .generate_master_key(&profile, bits)
                .map_err(ByodError::from)?;
            if ctx.out.is_json() {
                return print_json(&json!({ "key_id": key_id, "profile": profile, "bits": bits }));
            }
            ctx.out.success(&format!("Generated {bits}-bit master key {key_id}"));
            ctx.out.line(format!("  stored in {}", store.keys_dir().display()));
            ctx.out.warning("Back this key up. Data encrypted under it cannot be recovered without it.");
            Ok(())
        }
        KeysAction::List => {
            let keys = store.list_keys().map_err(ByodError::from)?;
            if ctx.out.is_json() {
                return print_json(&keys);
            }
            if keys.is_empty() {
                ctx.out.line("No master keys. Create one with: byod keys generate");
                return Ok(());
            }
            for key in &keys {
                let state = match &key.rotated_to {
                    Some(next) => ctx.out.paint(&format!("rotated -> {next}"), Tone::Dim),
                    None => ctx.out.paint("active", Tone::Success),
                };
                ctx.out.line(format!(
                    "{}  {}  {}  {}  {}",
                    key.key_id,
                    key.algorithm,
                    key.profile,
                    key.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    state
                ));
            }
            Ok(())
        }
        KeysAction::Rotate { key_id } => {
            let old = store.get_key_metadata(&key_id).map_err(ByodError::from)?;
            let new_id = store
                .rotate_key(&key_id, &old.profile)
                .map_err(ByodError::from)?;
            if ctx.out.is_json() {
                return print_json(&json!({ "old_key_id": key_id, "new_key_id": new_id }));
            }
            ctx.out.success(&format!("Rotated {key_id} -> {new_id}"));
            ctx.out.line("  Existing datasets stay encrypted under the old key; keep it until they are re-encrypted.");
            Ok(())
        }
        KeysAction::Delete { key_id, yes } => {
            let confirmed = yes
                || confirm(&format!(
                    "Delete master key {key_id}? Data encrypted under it becomes unrecoverable."
                ))?;
            if !confirmed {
                ctx.out.line("Aborted.");
                return Ok(());
            }
            store.delete_key(&key_id, true).map_err(ByodError::from)?;
            ctx.out.success(&format!("Deleted master key {key_id}"));
            Ok(())
        }
    }
}

// ── `byod encrypt` ────────────────────────────────────────────────────────────

pub fn cmd_encrypt(ctx: &AppContext, args: EncryptArgs) -> Result<()> {
    let store = open_store(ctx)?;
    let key_id = match args.key_id {
        Some(id) => id,
        None => {
            let keys = store.list_keys().map_err(ByodError::from)?;
            default_key_id(&keys)
                .map(str::to_string)
                .ok_or_else(|| {
                    ByodError::Validation("No master key found. Run 'byod keys generate' first.".into())
                })?
        }
    };
    let master = store.get_master_key(&key_id).map_err(ByodError::from)?;

    let options = EncryptOptions {
        include: args.include,
        exclude: args.exclude,
        preserve_structure: args.preserve_structure,
    };
    let pb = make_count_bar("encrypt", &ctx.out);
    let progress = progress_fn(&pb);
    let summary = encrypt_path(&args.input, &args.output, &master, &key_id, &options, Some(&progress))
        .map_err(ByodError::from)
        .inspect_err(|_| pb.abandon())?;
    pb.finish_and_clear();

    if ctx.out.is_json() {
        return print_json(&json!({
            "files_encrypted": summary.files_encrypted,
            "total_size_bytes": summary.total_size_bytes,
            "manifest_path": summary.manifest_path,
            "key_id": summary.key_id,
        }));
    }
    ctx.out.success(&format!(
        "Encrypted {} file(s), {} under {}",
        summary.files_encrypted,
        fmt_bytes(summary.total_size_bytes),
        summary.key_id
    ));
    ctx.out.line(format!("  manifest: {}", summary.manifest_path.display()));
    Ok(())
}

// ── `byod decrypt-dataset` ────────────────────────────────────────────────────

pub fn cmd_decrypt_dataset(ctx: &AppContext, args: DecryptDatasetArgs) -> Result<()> {
    let store = open_store(ctx)?;
    let manifest = byod_crypto::EncryptionManifest::load(&args.input).map_err(ByodError::from)?;
    let master = store
        .get_master_key(&manifest.key_id)
        .map_err(ByodError::from)?;

    let pb = make_count_bar("decrypt", &ctx.out);
    let progress = progress_fn(&pb);
    let summary = decrypt_path(&args.input, &args.output, &master, !args.no_verify, Some(&progress))
        .map_err(ByodError::from)
        .inspect_err(|_| pb.abandon())?;
    pb.finish_and_clear();

    if ctx.out.is_json() {
        return print_json(&json!({
            "files_decrypted": summary.files_decrypted,
            "total_size_bytes": summary.total_size_bytes,
            "verified": summary.verified,
        }));
    }
    ctx.out.success(&format!(
        "Decrypted {} file(s), {} to {}",
        summary.files_decrypted,
        fmt_bytes(summary.total_size_bytes),
        args.output.display()
    ));
    if summary.verified {
        ctx.out.line("  checksums verified");
    }
    Ok(())
}
