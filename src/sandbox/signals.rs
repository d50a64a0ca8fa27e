//! Signaling files shared between the controller and a sandboxed child.
//!
//! The controller creates every file in a scoped temporary directory before
//! the child starts and reads them back after it exits or is killed:
//! - context file: the document text, read-only for the child
//! - state file: `{"buffers": {..}, "findings": [..]}`, rewritten by the child
//! - termination file: `{"terminated": true, "final_answer": ".."}` on completion
//!
//! Read-back never fails the invocation. A missing or corrupt file falls back
//! to the prior state (or "not terminated") and the fallback is logged.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use tempfile::TempDir;

use crate::best_effort::BestEffort;
use crate::error::Result;

pub const CONTEXT_FILE_ENV: &str = "RLM_CONTEXT_FILE";
pub const STATE_FILE_ENV: &str = "RLM_STATE_FILE";
pub const TERMINATION_FILE_ENV: &str = "RLM_TERMINATION_FILE";
pub const IPC_PORT_ENV: &str = "RLM_IPC_PORT";

/// Buffers and findings as exchanged through the state file.
///
/// Values written by the child need not be strings; anything else is kept as
/// its JSON text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default, deserialize_with = "text_map")]
    pub buffers: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "text_list")]
    pub findings: Vec<String>,
}

impl StateSnapshot {
    pub fn new(buffers: BTreeMap<String, String>, findings: Vec<String>) -> Self {
        Self { buffers, findings }
    }

    /// Combine a child's snapshot with the prior one.
    ///
    /// Buffers are replaced wholesale. Findings only grow: entries the child
    /// dropped are restored, new entries are appended.
    pub fn merged_with(&self, returned: StateSnapshot) -> StateSnapshot {
        if returned.findings.starts_with(&self.findings) {
            return returned;
        }

        log::debug!(
            "Child rewrote {} prior findings; keeping them and appending new entries",
            self.findings.len()
        );
        let mut findings = self.findings.clone();
        findings.extend(returned.findings.into_iter().filter(|f| !self.findings.contains(f)));
        StateSnapshot {
            buffers: returned.buffers,
            findings,
        }
    }
}

fn value_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    }
}

fn text_map<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error> {
    let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
    Ok(raw.into_iter().map(|(k, v)| (k, value_text(v))).collect())
}

fn text_list<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw.into_iter().map(value_text).collect())
}

/// Completion record written to the termination file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationRecord {
    #[serde(default)]
    pub terminated: bool,
    #[serde(default)]
    pub final_answer: Option<String>,
}

/// Scoped directory holding one invocation's signaling files.
///
/// The directory and everything the child wrote into it are removed on drop.
#[derive(Debug)]
pub struct SignalFiles {
    dir: TempDir,
    context: PathBuf,
    state: PathBuf,
    termination: PathBuf,
}

impl SignalFiles {
    /// Create the directory and seed the files.
    pub fn create(context: &str, state: &StateSnapshot) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("rlm-sandbox-").tempdir()?;
        let context_path = dir.path().join("context.txt");
        let state_path = dir.path().join("state.json");
        let termination_path = dir.path().join("termination.json");

        fs::write(&context_path, context)?;
        fs::write(&state_path, serde_json::to_vec(state)?)?;
        fs::write(&termination_path, serde_json::to_vec(&TerminationRecord::default())?)?;

        Ok(Self {
            dir,
            context: context_path,
            state: state_path,
            termination: termination_path,
        })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn context_path(&self) -> &Path {
        &self.context
    }

    pub fn state_path(&self) -> &Path {
        &self.state
    }

    pub fn termination_path(&self) -> &Path {
        &self.termination
    }

    /// Environment handed to the child, besides `PATH`.
    pub fn env(&self, ipc_port: u16) -> Vec<(&'static str, OsString)> {
        vec![
            (CONTEXT_FILE_ENV, self.context.clone().into_os_string()),
            (STATE_FILE_ENV, self.state.clone().into_os_string()),
            (TERMINATION_FILE_ENV, self.termination.clone().into_os_string()),
            (IPC_PORT_ENV, OsString::from(ipc_port.to_string())),
        ]
    }

    /// Read back the state file, falling back to `prior`.
    pub fn read_state(&self, prior: &StateSnapshot) -> BestEffort<StateSnapshot> {
        let parsed = fs::read(&self.state)
            .map_err(|e| e.to_string())
            .and_then(|bytes| serde_json::from_slice::<StateSnapshot>(&bytes).map_err(|e| e.to_string()));

        match parsed {
            Ok(returned) => BestEffort::Read(prior.merged_with(returned)),
            Err(reason) => BestEffort::fallback("sandbox state file", prior.clone(), reason),
        }
    }

    /// Read the termination file. `Some(answer)` means the child signalled completion.
    ///
    /// A JSON record counts when `terminated` is true; any other non-empty body
    /// is taken as the answer text itself.
    pub fn read_termination(&self) -> BestEffort<Option<String>> {
        let body = match fs::read_to_string(&self.termination) {
            Ok(body) => body,
            Err(e) => return BestEffort::fallback("sandbox termination file", None, e),
        };

        let trimmed = body.trim();
        if trimmed.is_empty() {
            return BestEffort::Read(None);
        }

        match serde_json::from_str::<TerminationRecord>(trimmed) {
            Ok(record) if record.terminated => BestEffort::Read(Some(record.final_answer.unwrap_or_default())),
            Ok(_) => BestEffort::Read(None),
            Err(_) => BestEffort::Read(Some(trimmed.to_string())),
        }
    }
}
