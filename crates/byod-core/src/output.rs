//! Output preferences passed explicitly to every operation that prints.

use colored::Colorize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Tone of a styled line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Success,
    Error,
    Warning,
    Info,
    Dim,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OutputContext {
    pub verbosity: Verbosity,
    pub color: bool,
    pub format: OutputFormat,
}

impl OutputContext {
    pub fn new(verbosity: Verbosity, color: bool, format: OutputFormat) -> Self {
        Self {
            verbosity,
            color,
            format,
        }
    }

    /// Machine-readable output only; human chatter is suppressed.
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    pub fn is_quiet(&self) -> bool {
        self.verbosity == Verbosity::Quiet || self.is_json()
    }

    pub fn is_verbose(&self) -> bool {
        self.verbosity == Verbosity::Verbose
    }

    pub fn paint(&self, text: &str, tone: Tone) -> String {
        if !self.color {
            return text.to_string();
        }
        match tone {
            Tone::Success => text.green().bold().to_string(),
            Tone::Error => text.red().bold().to_string(),
            Tone::Warning => text.yellow().to_string(),
            Tone::Info => text.cyan().to_string(),
            Tone::Dim => text.dimmed().to_string(),
        }
    }

    /// Print a human-facing line to stdout unless quiet.
    pub fn line(&self, text: impl AsRef<str>) {
        if !self.is_quiet() {
            println!("{}", text.as_ref());
        }
    }

    pub fn success(&self, text: &str) {
        self.line(format!("{} {}", self.paint("✓", Tone::Success), text));
    }

    pub fn warning(&self, text: &str) {
        if !self.is_json() {
            eprintln!("{} {}", self.paint("!", Tone::Warning), self.paint(text, Tone::Warning));
        }
    }

    /// Errors always go to stderr, even in quiet mode.
    pub fn error(&self, text: &str) {
        eprintln!("{} {}", self.paint("✗", Tone::Error), text);
    }
}
