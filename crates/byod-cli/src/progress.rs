// ── Progress bar helpers ──────────────────────────────────────────────────────

use std::time::Duration;

use byod_core::OutputContext;
use byod_jobs::ProgressFn;
use indicatif::{ProgressBar, ProgressStyle};

const BAR_TEMPLATE: &str = "{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}";

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

/// Percent bar for the staged job flows. Hidden when output is quiet or JSON.
pub fn make_stage_bar(prefix: &str, out: &OutputContext) -> ProgressBar {
    if out.is_quiet() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {percent:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Count bar for per-file work (dataset encrypt/decrypt).
pub fn make_count_bar(prefix: &str, out: &OutputContext) -> ProgressBar {
    if out.is_quiet() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    pb.set_style(bar_style());
    pb.set_prefix(prefix.to_string());
    pb
}

pub fn make_spinner(prefix: &str, out: &OutputContext) -> ProgressBar {
    if out.is_quiet() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Feed a bar from a `(done, total, message)` callback.
pub fn progress_fn(pb: &ProgressBar) -> ProgressFn {
    let pb = pb.clone();
    Box::new(move |done, total, msg| {
        pb.set_length(total);
        pb.set_position(done);
        pb.set_message(stage_label(msg).to_string());
    })
}

/// Human label for a job stage; anything else (file names) passes through.
pub fn stage_label(stage: &str) -> &str {
    match stage {
        "packaging" => "packaging inputs",
        "encrypting" => "encrypting",
        "uploading_data" => "uploading encrypted data",
        "uploading_key" => "uploading wrapped key",
        "submitting" => "creating job",
        "checking" => "checking job status",
        "downloading" => "downloading results",
        "unwrapping" => "unwrapping key via KMS",
        "decrypting" => "decrypting",
        "extracting" => "extracting",
        other => other,
    }
}

pub fn fmt_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_bytes() {
        assert_eq!(fmt_bytes(0), "0 B");
        assert_eq!(fmt_bytes(1023), "1023 B");
        assert_eq!(fmt_bytes(1536), "1.50 KiB");
        assert_eq!(fmt_bytes(500 * 1024 * 1024), "500.00 MiB");
    }

    #[test]
    fn test_stage_labels_pass_file_names_through() {
        assert_eq!(stage_label("uploading_key"), "uploading wrapped key");
        assert_eq!(stage_label("reads/a.fastq"), "reads/a.fastq");
    }

    #[test]
    fn test_progress_fn_drives_bar() {
        let pb = ProgressBar::hidden();
        let cb = progress_fn(&pb);
        cb(45, 100, "uploading_data");
        assert_eq!(pb.position(), 45);
        assert_eq!(pb.length(), Some(100));
    }
}
