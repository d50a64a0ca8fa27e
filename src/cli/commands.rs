//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - query: answer questions about a document
//! - sub-query: child side of the IPC channel, used from sandboxed shell code
//! - detect: show the detected domain of a document
//! - domains: list the built-in domains

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// rlm-engine - recursive question answering over long documents
#[derive(Parser, Debug)]
#[command(name = "rlm-engine")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Answer one or more questions about a document
    Query {
        /// Document to load (text, PDF, DOCX, HTML, ...)
        document: PathBuf,

        /// Questions, each answered separately
        #[arg(required = true)]
        questions: Vec<String>,

        /// Override the iteration limit
        #[arg(short, long)]
        max_iterations: Option<usize>,

        /// Override the sandbox timeout, in seconds
        #[arg(short, long, value_parser = parse_seconds)]
        timeout: Option<Duration>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Ask the controller a sub-query (run inside the sandbox)
    SubQuery {
        /// Controller port, normally "$RLM_IPC_PORT"
        #[arg(short, long)]
        port: u16,

        /// Question for the sub-model
        prompt: String,

        /// Text to answer from instead of the whole document
        #[arg(long)]
        context_slice: Option<String>,
    },

    /// Detect the domain of a document
    Detect {
        /// Document to inspect
        document: PathBuf,
    },

    /// List the built-in domains and their vocabulary sizes
    Domains,
}

impl Commands {
    /// Commands run inside the sandbox must not touch the user's log directory
    pub fn wants_file_logging(&self) -> bool {
        !matches!(self, Commands::SubQuery { .. })
    }
}

/// Parse a non-negative, finite number of seconds
fn parse_seconds(value: &str) -> Result<Duration, String> {
    let secs: f64 = value.parse().map_err(|e| format!("{}", e))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("{} is not a valid timeout: {}", value, e))
}
