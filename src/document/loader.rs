//! Text extraction with a per-format fallback chain.

use std::fmt;
use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::best_effort::BestEffort;
use crate::document::Document;
use crate::error::{Result, RlmError};

/// One way of turning a file into text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// `pdftotext -layout`
    Pdftotext,
    /// `pandoc -t plain`
    Pandoc,
    /// Strict UTF-8 read
    Utf8,
    /// UTF-8 read replacing invalid sequences
    Lossy,
    /// Text supplied directly, no file involved
    Inline,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Pdftotext => "pdftotext",
            Strategy::Pandoc => "pandoc",
            Strategy::Utf8 => "utf8",
            Strategy::Lossy => "lossy",
            Strategy::Inline => "inline",
        };
        write!(f, "{}", name)
    }
}

/// Turns a file into a [`Document`]
pub trait DocumentLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Document>;
}

/// A document built from text already in memory. Never fails, even for `""`.
pub fn load_text(id: impl Into<String>, text: impl Into<String>) -> Document {
    Document::new(id, text, Strategy::Inline, None)
}

/// Loader trying external converters first, then plain reads.
#[derive(Debug, Clone)]
pub struct ExtractingLoader {
    pdftotext: String,
    pandoc: String,
}

impl Default for ExtractingLoader {
    fn default() -> Self {
        Self {
            pdftotext: "pdftotext".to_string(),
            pandoc: "pandoc".to_string(),
        }
    }
}

impl ExtractingLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different `pdftotext` binary
    pub fn with_pdftotext(mut self, program: impl Into<String>) -> Self {
        self.pdftotext = program.into();
        self
    }

    /// Use a different `pandoc` binary
    pub fn with_pandoc(mut self, program: impl Into<String>) -> Self {
        self.pandoc = program.into();
        self
    }

    /// Strategies tried for `path`, in priority order.
    pub fn strategies_for(path: &Path) -> Vec<Strategy> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "pdf" => vec![Strategy::Pdftotext],
            "docx" | "doc" | "odt" | "rtf" | "epub" => vec![Strategy::Pandoc],
            "html" | "htm" => vec![Strategy::Pandoc, Strategy::Utf8, Strategy::Lossy],
            _ => vec![Strategy::Utf8, Strategy::Lossy],
        }
    }

    fn extract(&self, strategy: Strategy, path: &Path) -> std::result::Result<String, String> {
        match strategy {
            Strategy::Pdftotext => {
                let mut command = Command::new(&self.pdftotext);
                command.arg("-layout").arg(path).arg("-");
                run_converter(command)
            }
            Strategy::Pandoc => {
                let mut command = Command::new(&self.pandoc);
                command.arg(path).args(["-t", "plain"]);
                run_converter(command)
            }
            Strategy::Utf8 => std::fs::read_to_string(path).map_err(|e| e.to_string()),
            Strategy::Lossy => std::fs::read(path)
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .map_err(|e| e.to_string()),
            Strategy::Inline => Err("not a file strategy".to_string()),
        }
    }
}

impl DocumentLoader for ExtractingLoader {
    fn load(&self, path: &Path) -> Result<Document> {
        if !path.exists() {
            return Err(RlmError::DocumentNotFound(path.display().to_string()));
        }

        let mut reasons = Vec::new();
        for strategy in Self::strategies_for(path) {
            let what = format!("{} extraction of {}", strategy, path.display());
            let attempt = BestEffort::from_result(&what, self.extract(strategy, path).map(Some), None);
            if let Some(reason) = attempt.reason() {
                reasons.push(format!("{}: {}", strategy, reason));
            }
            if let Some(text) = attempt.into_value() {
                log::info!("Loaded {} with {} ({} bytes)", path.display(), strategy, text.len());
                return Ok(Document::new(document_id(path), text, strategy, Some(path.to_path_buf())));
            }
        }

        Err(RlmError::ExtractionFailed {
            path: path.display().to_string(),
            reasons: reasons.join("; "),
        })
    }
}

fn run_converter(mut command: Command) -> std::result::Result<String, String> {
    let output = command.output().map_err(|e| e.to_string())?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("exited with {}: {}", output.status, stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Document id derived from the file name, without extension
pub fn document_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
