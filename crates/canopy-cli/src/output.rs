//! Shared output layer for human/JSON parity across all CLI commands.
//!
//! Every command handler receives an [`OutputMode`] and renders through the
//! helpers here: labelled text for operators, or stable JSON for the
//! bulk-import pipeline and scripts. Errors carry the engine's machine code
//! and remediation hint in both modes.

use canopy_core::error::EngineError;
use serde::Serialize;
use std::io::{self, Write};

/// The two output modes supported by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Human-readable text.
    Human,
    /// Machine-readable JSON (one object or array per result).
    Json,
}

impl OutputMode {
    /// Returns `true` if JSON output was requested.
    pub fn is_json(self) -> bool {
        matches!(self, Self::Json)
    }
}

/// Render a left-aligned key/value line in human output.
pub fn kv(w: &mut dyn Write, key: &str, value: impl AsRef<str>) -> io::Result<()> {
    writeln!(w, "{:<14} {}", format!("{key}:"), value.as_ref())
}

/// A structured error with optional suggestion and machine code.
#[derive(Debug, Serialize)]
pub struct CliError {
    /// Human-readable error message.
    pub message: String,
    /// Optional suggestion for how to fix the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Stable machine code (e.g. "E2005").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl CliError {
    /// Create a simple error with just a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            suggestion: None,
            error_code: None,
        }
    }

    /// Create an error with a suggestion and machine code.
    pub fn with_details(
        message: impl Into<String>,
        suggestion: impl Into<String>,
        error_code: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            suggestion: Some(suggestion.into()),
            error_code: Some(error_code.into()),
        }
    }
}

impl From<&EngineError> for CliError {
    fn from(err: &EngineError) -> Self {
        Self {
            message: format!("{err:#}"),
            suggestion: err.hint().map(String::from),
            error_code: Some(err.code().code().to_string()),
        }
    }
}

/// Render a serializable value to stdout in the requested format.
///
/// In JSON mode the value is serialized with `serde_json`; in human mode the
/// `human_fn` closure produces the text.
pub fn render<T: Serialize>(
    mode: OutputMode,
    value: &T,
    human_fn: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match mode {
        OutputMode::Json => {
            serde_json::to_writer_pretty(&mut out, value)?;
            writeln!(out)?;
        }
        OutputMode::Human => human_fn(value, &mut out)?,
    }
    Ok(())
}

/// Render an error to stderr in the requested format.
pub fn render_error(mode: OutputMode, error: &CliError) -> anyhow::Result<()> {
    let stderr = io::stderr();
    let mut out = stderr.lock();
    match mode {
        OutputMode::Json => {
            let wrapper = serde_json::json!({
                "error": error,
            });
            serde_json::to_writer_pretty(&mut out, &wrapper)?;
            writeln!(out)?;
        }
        OutputMode::Human => {
            writeln!(out, "error: {}", error.message)?;
            if let Some(ref suggestion) = error.suggestion {
                writeln!(out, "  suggestion: {suggestion}")?;
            }
        }
    }
    Ok(())
}

/// Render an engine error to stderr and fold it into a terse process-exit
/// error carrying the machine code.
pub fn engine_failure(mode: OutputMode, err: &EngineError) -> anyhow::Error {
    let cli_error = CliError::from(err);
    if let Err(render_err) = render_error(mode, &cli_error) {
        return render_err;
    }
    anyhow::anyhow!("{}", err.code().code())
}

/// Render a success message to stdout.
pub fn render_success(mode: OutputMode, message: &str) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match mode {
        OutputMode::Json => {
            let wrapper = serde_json::json!({
                "ok": true,
                "message": message,
            });
            serde_json::to_writer_pretty(&mut out, &wrapper)?;
            writeln!(out)?;
        }
        OutputMode::Human => {
            writeln!(out, "✓ {message}")?;
        }
    }
    Ok(())
}
