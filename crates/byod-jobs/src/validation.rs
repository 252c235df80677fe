//! File-type checks against a plugin's declared inputs
//!
//! Runs before anything is encrypted so a wrong file costs nothing. Only
//! `type = "file"` inputs constrain submissions, and a file is accepted as
//! soon as it satisfies ANY of them:
//!
//! - `formats`: the last suffix, or the last two joined (`fastq.gz`),
//!   compared case-insensitively
//! - `pattern`: fnmatch-style glob against the lowercased file name
//! - neither: anything goes

use std::collections::BTreeSet;

use byod_core::types::{Plugin, PluginInput};
use byod_core::{ByodError, ByodResult};

const FILE_KIND: &str = "file";

/// Reject job ids that could escape a URL path segment or an object prefix.
pub fn check_job_id(job_id: &str) -> ByodResult<()> {
    let valid = !job_id.is_empty()
        && job_id.len() <= 128
        && job_id != "."
        && job_id != ".."
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ByodError::Validation(format!("Invalid job id: {job_id:?}")))
    }
}

/// Look up `name` in the platform's plugin list.
pub fn find_plugin<'a>(plugins: &'a [Plugin], name: &str) -> ByodResult<&'a Plugin> {
    plugins.iter().find(|p| p.name == name).ok_or_else(|| {
        let available: Vec<&str> = plugins.iter().map(|p| p.name.as_str()).collect();
        ByodError::Validation(format!(
            "Unknown plugin '{name}'. Available plugins: {}",
            available.join(", ")
        ))
    })
}

/// Check every file name against `inputs`. Returns one message per rejected
/// file; empty means everything passed.
pub fn validate_files_for_plugin<S: AsRef<str>>(filenames: &[S], inputs: &[PluginInput]) -> Vec<String> {
    let constraints: Vec<&PluginInput> = inputs.iter().filter(|i| i.kind == FILE_KIND).collect();
    if constraints.is_empty() {
        return Vec::new();
    }

    let accepted = describe_accepted(&constraints);
    filenames
        .iter()
        .map(AsRef::as_ref)
        .filter(|name| !constraints.iter().any(|c| input_accepts(c, name)))
        .map(|name| format!("'{name}' is not an accepted file type. Expected: {accepted}"))
        .collect()
}

/// Extensions (with leading dot, lowercased) the plugin accepts, for
/// display and file pickers. `None` means any file.
pub fn accepted_extensions(inputs: &[PluginInput]) -> Option<BTreeSet<String>> {
    let mut extensions = BTreeSet::new();
    let mut constrained = false;

    for input in inputs.iter().filter(|i| i.kind == FILE_KIND) {
        if !input.formats.is_empty() {
            constrained = true;
            extensions.extend(input.formats.iter().map(|f| format!(".{}", f.to_lowercase())));
        } else if let Some(pattern) = non_empty(&input.pattern) {
            constrained = true;
            extensions.extend(extensions_from_pattern(pattern));
        }
    }

    constrained.then_some(extensions)
}

fn input_accepts(input: &PluginInput, filename: &str) -> bool {
    if !input.formats.is_empty() {
        matches_formats(filename, &input.formats)
    } else if let Some(pattern) = non_empty(&input.pattern) {
        matches_pattern(filename, pattern)
    } else {
        true
    }
}

fn matches_formats(filename: &str, formats: &[String]) -> bool {
    let lower = filename.to_lowercase();
    let allowed: BTreeSet<String> = formats.iter().map(|f| f.to_lowercase()).collect();
    let suffixes = suffixes(&lower);

    if let Some(last) = suffixes.last() {
        if allowed.contains(*last) {
            return true;
        }
    }
    if suffixes.len() >= 2 {
        let double = suffixes[suffixes.len() - 2..].join(".");
        if allowed.contains(&double) {
            return true;
        }
    }
    false
}

fn matches_pattern(filename: &str, pattern: &str) -> bool {
    let lower = filename.to_lowercase();
    match glob::Pattern::new(&pattern.to_lowercase()) {
        Ok(p) => p.matches(&lower),
        // An unparsable glob can only match itself.
        Err(_) => lower == pattern.to_lowercase(),
    }
}

/// `sample.fastq.gz` -> `["fastq", "gz"]`. Leading dots (hidden files) and a
/// trailing dot yield no suffix.
fn suffixes(name: &str) -> Vec<&str> {
    let stem = name.trim_start_matches('.');
    if stem.is_empty() || stem.ends_with('.') {
        return Vec::new();
    }
    stem.split('.').skip(1).filter(|s| !s.is_empty()).collect()
}

fn describe_accepted(constraints: &[&PluginInput]) -> String {
    let parts: Vec<String> = constraints
        .iter()
        .filter_map(|input| {
            if !input.formats.is_empty() {
                Some(
                    input
                        .formats
                        .iter()
                        .map(|f| format!(".{f}"))
                        .collect::<Vec<_>>()
                        .join(", "),
                )
            } else {
                non_empty(&input.pattern).map(|p| format!("files matching {p}"))
            }
        })
        .collect();

    if parts.is_empty() {
        "any file".to_string()
    } else {
        parts.join(" or ")
    }
}

fn extensions_from_pattern(pattern: &str) -> BTreeSet<String> {
    let lower = pattern.to_lowercase();
    if lower.contains("fastq") {
        return [".fastq", ".fastq.gz", ".fq", ".fq.gz"]
            .into_iter()
            .map(String::from)
            .collect();
    }
    match lower.strip_prefix("*.") {
        Some(ext) if !ext.contains(['*', '?']) => BTreeSet::from([format!(".{ext}")]),
        _ => BTreeSet::new(),
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formats(list: &[&str]) -> PluginInput {
        PluginInput {
            name: "input".into(),
            kind: "file".into(),
            formats: list.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn pattern(p: &str) -> PluginInput {
        PluginInput {
            name: "reads".into(),
            kind: "file".into(),
            pattern: Some(p.into()),
            ..Default::default()
        }
    }

    fn plugin(name: &str) -> Plugin {
        Plugin {
            name: name.into(),
            description: None,
            version: None,
            inputs: Vec::new(),
        }
    }

    #[test]
    fn test_formats_are_case_insensitive() {
        let inputs = [formats(&["txt"])];
        assert!(validate_files_for_plugin(&["a.TXT"], &inputs).is_empty());
    }

    #[test]
    fn test_rejection_message() {
        let inputs = [formats(&["txt"])];
        let errors = validate_files_for_plugin(&["a.fastq"], &inputs);
        assert_eq!(
            errors,
            vec!["'a.fastq' is not an accepted file type. Expected: .txt".to_string()]
        );
    }

    #[test]
    fn test_double_extension() {
        let inputs = [formats(&["fastq.gz"])];
        assert!(validate_files_for_plugin(&["sample.fastq.gz"], &inputs).is_empty());
        assert_eq!(validate_files_for_plugin(&["sample.gz"], &inputs).len(), 1);
    }

    #[test]
    fn test_pattern_match() {
        let inputs = [pattern("*.fastq*")];
        assert!(validate_files_for_plugin(&["R1.FASTQ.GZ", "r2.fastq"], &inputs).is_empty());
        let errors = validate_files_for_plugin(&["notes.csv"], &inputs);
        assert_eq!(
            errors[0],
            "'notes.csv' is not an accepted file type. Expected: files matching *.fastq*"
        );
    }

    #[test]
    fn test_any_input_suffices() {
        let inputs = [formats(&["txt", "csv"]), pattern("*.fq")];
        assert!(validate_files_for_plugin(&["x.csv", "y.fq"], &inputs).is_empty());
        let errors = validate_files_for_plugin(&["z.bam"], &inputs);
        assert_eq!(
            errors[0],
            "'z.bam' is not an accepted file type. Expected: .txt, .csv or files matching *.fq"
        );
    }

    #[test]
    fn test_unconstrained_inputs_accept_anything() {
        assert!(validate_files_for_plugin(&["anything.bin"], &[]).is_empty());

        let non_file = PluginInput {
            name: "threshold".into(),
            kind: "number".into(),
            formats: vec!["txt".into()],
            ..Default::default()
        };
        assert!(validate_files_for_plugin(&["anything.bin"], &[non_file]).is_empty());

        let open = PluginInput {
            name: "data".into(),
            kind: "file".into(),
            ..Default::default()
        };
        assert!(validate_files_for_plugin(&["anything.bin"], &[open, formats(&["txt"])]).is_empty());
    }

    #[test]
    fn test_hidden_file_has_no_suffix() {
        let inputs = [formats(&["bashrc"])];
        assert_eq!(validate_files_for_plugin(&[".bashrc"], &inputs).len(), 1);
    }

    #[test]
    fn test_unknown_plugin_lists_available() {
        let plugins = vec![plugin("genomic-qc"), plugin("demo-count")];
        assert!(find_plugin(&plugins, "demo-count").is_ok());
        let err = find_plugin(&plugins, "nope").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unknown plugin 'nope'. Available plugins: genomic-qc, demo-count"
        );
    }

    #[test]
    fn test_accepted_extensions() {
        assert_eq!(accepted_extensions(&[]), None);
        let exts = accepted_extensions(&[pattern("*.fastq*"), pattern("*.CSV")]).unwrap();
        assert!(exts.contains(".fq.gz"));
        assert!(exts.contains(".csv"));
        let exts = accepted_extensions(&[formats(&["TXT"])]).unwrap();
        assert_eq!(exts.into_iter().collect::<Vec<_>>(), vec![".txt"]);
    }

    #[test]
    fn test_check_job_id() {
        for ok in ["demo-count-20250101-abc123", "a.b_c", "x"] {
            assert!(check_job_id(ok).is_ok(), "{ok}");
        }
        let long = "a".repeat(129);
        for bad in ["", ".", "..", "../admin", "a/b", "a?x=1", "a%2F", "job id", long.as_str()] {
            assert!(matches!(check_job_id(bad), Err(ByodError::Validation(_))), "{bad}");
        }
    }
}
