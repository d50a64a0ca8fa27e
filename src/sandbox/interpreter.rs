//! Interpreters a sandboxed instruction can run under.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{Result, RlmError};

/// Helpers loaded ahead of every Python instruction.
pub const PYTHON_PRELUDE: &str = include_str!("prelude.py");

pub const DEFAULT_PYTHON_COMMAND: &str = "python3";

const PRELUDE_FILE: &str = "rlm_prelude.py";
const CODE_FILE: &str = "repl_block.py";

/// Language of the ```` ```repl ```` blocks handed to the sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpreter {
    /// `python3 rlm_prelude.py repl_block.py`
    #[default]
    Python,
    /// `sh -c <code>`
    Shell,
}

impl Interpreter {
    /// Build the child command. Script files are written into `dir`.
    pub fn command(&self, code: &str, dir: &Path, python_command: &str) -> Result<Command> {
        match self {
            Interpreter::Shell => {
                let mut command = Command::new("sh");
                command.arg("-c").arg(code);
                Ok(command)
            }
            Interpreter::Python => {
                let prelude = dir.join(PRELUDE_FILE);
                let script = dir.join(CODE_FILE);
                fs::write(&prelude, PYTHON_PRELUDE)?;
                fs::write(&script, code)?;

                let mut parts = python_command.split_whitespace();
                let program = parts
                    .next()
                    .ok_or_else(|| RlmError::Sandbox("Python command is empty".to_string()))?;
                let mut command = Command::new(program);
                command.args(parts).arg("-u").arg(&prelude).arg(&script);
                Ok(command)
            }
        }
    }
}

impl std::fmt::Display for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interpreter::Python => write!(f, "python"),
            Interpreter::Shell => write!(f, "shell"),
        }
    }
}
