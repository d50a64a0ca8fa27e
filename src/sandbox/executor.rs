//! Sandbox executor - runs one instruction in an isolated, time-boxed child.
//!
//! The child gets a cleared environment (only `PATH` and the `RLM_*`
//! variables), a scoped working directory and a deadline. It reaches the
//! controller only through the IPC port it is given.

use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::best_effort::BestEffort;
use crate::error::{Result, RlmError};
use crate::sandbox::interpreter::{DEFAULT_PYTHON_COMMAND, Interpreter};
use crate::sandbox::signals::{SignalFiles, StateSnapshot};

/// Sandbox settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock budget per invocation
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub interpreter: Interpreter,
    /// Program (plus leading arguments) used for the Python interpreter
    pub python_command: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            interpreter: Interpreter::default(),
            python_command: DEFAULT_PYTHON_COMMAND.to_string(),
        }
    }
}

impl SandboxConfig {
    pub fn shell() -> Self {
        Self {
            interpreter: Interpreter::Shell,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interpreter(mut self, interpreter: Interpreter) -> Self {
        self.interpreter = interpreter;
        self
    }
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Outcome of one sandbox invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxResult {
    /// Captured stdout, followed by a `STDERR:` section when the child wrote any
    pub output: String,
    pub timed_out: bool,
    /// Set only by an explicit completion record
    pub terminated: bool,
    pub elapsed: Duration,
    /// Crash description for non-zero exits
    pub error: Option<String>,
    pub buffers: BTreeMap<String, String>,
    pub findings: Vec<String>,
    pub final_answer: Option<String>,
}

impl SandboxResult {
    pub fn crashed(&self) -> bool {
        self.error.is_some()
    }

    pub fn state(&self) -> StateSnapshot {
        StateSnapshot::new(self.buffers.clone(), self.findings.clone())
    }
}

/// How long pipe readers keep going once the child is gone
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(250);

enum Exit {
    Finished(ExitStatus),
    TimedOut,
    Cancelled,
}

/// Runs instructions in child processes
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `code` against `context` and the prior `state`.
    pub async fn execute(&self, code: &str, context: &str, state: &StateSnapshot, ipc_port: u16) -> Result<SandboxResult> {
        self.execute_with_cancel(code, context, state, ipc_port, &CancellationToken::new())
            .await
    }

    /// Like [`Sandbox::execute`], but `cancel` kills the child and yields `RlmError::Cancelled`.
    pub async fn execute_with_cancel(
        &self,
        code: &str,
        context: &str,
        state: &StateSnapshot,
        ipc_port: u16,
        cancel: &CancellationToken,
    ) -> Result<SandboxResult> {
        let files = SignalFiles::create(context, state)?;
        let interpreter = self.config.interpreter;

        let mut command = interpreter.command(code, files.dir(), &self.config.python_command)?;
        command.env_clear();
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        command
            .envs(files.env(ipc_port))
            .current_dir(files.dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so background jobs the instruction starts die with it
        #[cfg(unix)]
        command.process_group(0);

        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| RlmError::Sandbox(format!("Failed to spawn {} interpreter: {}", interpreter, e)))?;
        let pgid = child.id();
        log::debug!("Sandbox child {:?} started ({})", pgid, interpreter);

        // Pipes are read concurrently so a chatty child never blocks on a full pipe.
        // `drain` stops the readers shortly after the child is gone.
        let drain = CancellationToken::new();
        let stdout = tokio::spawn(read_pipe(child.stdout.take(), drain.clone()));
        let stderr = tokio::spawn(read_pipe(child.stderr.take(), drain.clone()));

        let exit = tokio::select! {
            status = child.wait() => Exit::Finished(status?),
            _ = tokio::time::sleep(self.config.timeout) => Exit::TimedOut,
            _ = cancel.cancelled() => Exit::Cancelled,
        };

        kill_group(pgid);
        drain.cancel();

        let status = match exit {
            Exit::Finished(status) => status,
            Exit::TimedOut => {
                kill(&mut child).await;
                join_pipe(stdout).await;
                join_pipe(stderr).await;
                log::warn!("Sandbox child timed out after {:?}", self.config.timeout);
                let refreshed = files.read_state(state).into_value();
                return Ok(SandboxResult {
                    output: format!("Error: Code timed out after {}s", self.config.timeout.as_secs_f64()),
                    timed_out: true,
                    terminated: false,
                    elapsed: started.elapsed(),
                    error: None,
                    buffers: refreshed.buffers,
                    findings: refreshed.findings,
                    final_answer: None,
                });
            }
            Exit::Cancelled => {
                kill(&mut child).await;
                log::info!("Sandbox child cancelled");
                return Err(RlmError::Cancelled);
            }
        };
        let out = join_pipe(stdout).await;
        let err = join_pipe(stderr).await;
        let elapsed = started.elapsed();

        let mut output = String::from_utf8_lossy(&out).into_owned();
        let stderr_text = String::from_utf8_lossy(&err);
        if !stderr_text.trim().is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str("STDERR: ");
            output.push_str(&stderr_text);
        }

        let refreshed = files.read_state(state).into_value();

        if !status.success() {
            log::debug!("Sandbox child exited with {}", status);
            return Ok(SandboxResult {
                output,
                timed_out: false,
                terminated: false,
                elapsed,
                error: Some(format!("Process exited with {}", status)),
                buffers: refreshed.buffers,
                findings: refreshed.findings,
                final_answer: None,
            });
        }

        let final_answer = files.read_termination().into_value();
        Ok(SandboxResult {
            output,
            timed_out: false,
            terminated: final_answer.is_some(),
            elapsed,
            error: None,
            buffers: refreshed.buffers,
            findings: refreshed.findings,
            final_answer,
        })
    }
}

/// Read `pipe` to EOF, or until `PIPE_DRAIN_GRACE` after `drain` fires.
/// Whatever arrived before that is kept.
async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>, drain: CancellationToken) -> Vec<u8> {
    let mut buf = Vec::new();
    let Some(mut pipe) = pipe else {
        return buf;
    };
    let deadline = async {
        drain.cancelled().await;
        tokio::time::sleep(PIPE_DRAIN_GRACE).await;
    };
    tokio::pin!(deadline);

    let mut chunk = [0u8; 8192];
    loop {
        let read = tokio::select! {
            read = pipe.read(&mut chunk) => read,
            _ = &mut deadline => {
                log::debug!("Sandbox pipe still open after the child exited, keeping {} bytes", buf.len());
                break;
            }
        };
        match read {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => {
                BestEffort::fallback("sandbox output pipe", (), e);
                break;
            }
        }
    }
    buf
}

async fn join_pipe(reader: tokio::task::JoinHandle<Vec<u8>>) -> Vec<u8> {
    BestEffort::from_result("sandbox output pipe", reader.await, Vec::new()).into_value()
}

/// SIGKILL every process left in the child's group. Nothing left is not an error.
#[cfg(unix)]
fn kill_group(pgid: Option<u32>) {
    let Some(pgid) = pgid.and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid signals the group and touches no memory
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            BestEffort::fallback("sandbox process group kill", (), err);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: Option<u32>) {}

async fn kill(child: &mut tokio::process::Child) {
    let killed = child.kill().await;
    BestEffort::from_result("sandbox child kill", killed, ()).into_value();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(timeout_ms: u64) -> Sandbox {
        Sandbox::new(SandboxConfig::shell().with_timeout(Duration::from_millis(timeout_ms)))
    }

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_config_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.interpreter, Interpreter::Python);
        assert_eq!(config.python_command, "python3");
    }

    #[test]
    fn test_config_from_yaml() {
        let config: SandboxConfig = serde_yaml::from_str("timeout: 2.5\ninterpreter: shell\n").unwrap();
        assert_eq!(config.timeout, Duration::from_millis(2500));
        assert_eq!(config.interpreter, Interpreter::Shell);
        assert_eq!(config.python_command, "python3");
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let result = shell(5000)
            .execute("echo hello", "", &StateSnapshot::default(), 0)
            .await
            .unwrap();
        assert_eq!(result.output, "hello\n");
        assert!(!result.timed_out);
        assert!(!result.terminated);
        assert!(!result.crashed());
    }

    #[tokio::test]
    async fn test_reads_context_file() {
        let result = shell(5000)
            .execute(r#"cat "$RLM_CONTEXT_FILE""#, "Q3 revenue: $1.8M", &StateSnapshot::default(), 0)
            .await
            .unwrap();
        assert_eq!(result.output, "Q3 revenue: $1.8M");
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        let result = shell(5000)
            .execute(
                r#"echo "${HOME:-unset} ${ANTHROPIC_API_KEY:-unset} $RLM_IPC_PORT""#,
                "",
                &StateSnapshot::default(),
                4321,
            )
            .await
            .unwrap();
        assert_eq!(result.output, "unset unset 4321\n");
    }

    #[tokio::test]
    async fn test_crash_reports_error() {
        let result = shell(5000)
            .execute("echo partial; echo boom >&2; exit 3", "", &StateSnapshot::default(), 0)
            .await
            .unwrap();
        assert!(result.crashed());
        assert!(!result.terminated);
        assert!(!result.timed_out);
        assert!(result.output.starts_with("partial\n"));
        assert!(result.output.contains("STDERR: boom"));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let started = Instant::now();
        let result = shell(200)
            .execute("sleep 5", "", &StateSnapshot::default(), 0)
            .await
            .unwrap();
        assert!(result.timed_out);
        assert!(!result.terminated);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(result.output.contains("timed out"));
    }

    #[tokio::test]
    async fn test_background_job_does_not_hold_clean_exit() {
        let started = Instant::now();
        let result = shell(1000)
            .execute("sleep 3 & echo done", "", &StateSnapshot::default(), 0)
            .await
            .unwrap();
        assert!(!result.timed_out, "output: {}", result.output);
        assert!(!result.crashed());
        assert_eq!(result.output, "done\n");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_timeout_kills_background_jobs() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("late");
        let code = format!("(sleep 1; touch '{}') & sleep 5", marker.display());

        let result = shell(200).execute(&code, "", &StateSnapshot::default(), 0).await.unwrap();
        assert!(result.timed_out);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "background job outlived the timeout");
    }

    #[tokio::test]
    async fn test_cancel_kills_background_jobs() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("late");
        let code = format!("(sleep 1; touch '{}') & sleep 5", marker.display());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = shell(10_000)
            .execute_with_cancel(&code, "", &StateSnapshot::default(), 0, &cancel)
            .await;
        assert!(matches!(result, Err(RlmError::Cancelled)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "background job outlived cancellation");
    }

    #[tokio::test]
    async fn test_timeout_keeps_prior_state() {
        let prior = StateSnapshot::new(BTreeMap::new(), vec!["earlier".to_string()]);
        let result = shell(200).execute("sleep 5", "", &prior, 0).await.unwrap();
        assert_eq!(result.findings, vec!["earlier".to_string()]);
    }

    #[tokio::test]
    async fn test_termination_signal() {
        let result = shell(5000)
            .execute(
                r#"printf '{"terminated": true, "final_answer": "$1.8M"}' > "$RLM_TERMINATION_FILE""#,
                "",
                &StateSnapshot::default(),
                0,
            )
            .await
            .unwrap();
        assert!(result.terminated);
        assert!(!result.timed_out);
        assert_eq!(result.final_answer.as_deref(), Some("$1.8M"));
    }

    #[tokio::test]
    async fn test_termination_ignored_on_crash() {
        let result = shell(5000)
            .execute(r#"echo done > "$RLM_TERMINATION_FILE"; exit 1"#, "", &StateSnapshot::default(), 0)
            .await
            .unwrap();
        assert!(!result.terminated);
        assert_eq!(result.final_answer, None);
    }

    #[tokio::test]
    async fn test_state_round_trips_through_child() {
        let result = shell(5000)
            .execute(
                r#"printf '{"buffers": {"revenue": "1.8M"}, "findings": ["page 3"]}' > "$RLM_STATE_FILE""#,
                "",
                &StateSnapshot::default(),
                0,
            )
            .await
            .unwrap();
        assert_eq!(result.buffers.get("revenue").map(String::as_str), Some("1.8M"));
        assert_eq!(result.findings, vec!["page 3".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let sandbox = shell(10_000);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = sandbox
            .execute_with_cancel("sleep 5", "", &StateSnapshot::default(), 0, &cancel)
            .await;
        assert!(matches!(result, Err(RlmError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let sandbox = Sandbox::new(SandboxConfig {
            python_command: "definitely-not-a-python-binary".to_string(),
            ..Default::default()
        });
        let result = sandbox.execute("pass", "", &StateSnapshot::default(), 0).await;
        assert!(matches!(result, Err(RlmError::Sandbox(_))));
    }

    #[tokio::test]
    async fn test_python_final_and_state() {
        if !python_available() {
            return;
        }
        let sandbox = Sandbox::new(SandboxConfig::default().with_timeout(Duration::from_secs(10)));
        let code = "buffers['size'] = str(len(context))\nfindings.append('seen')\nFINAL('done')";
        let result = sandbox
            .execute(code, "abcd", &StateSnapshot::default(), 0)
            .await
            .unwrap();
        assert!(result.terminated, "output: {}", result.output);
        assert_eq!(result.final_answer.as_deref(), Some("done"));
        assert_eq!(result.buffers.get("size").map(String::as_str), Some("4"));
        assert_eq!(result.findings, vec!["seen".to_string()]);
    }

    #[tokio::test]
    async fn test_python_final_var() {
        if !python_available() {
            return;
        }
        let sandbox = Sandbox::new(SandboxConfig::default().with_timeout(Duration::from_secs(10)));
        let result = sandbox
            .execute("total = 1.8\nFINAL_VAR('total')", "", &StateSnapshot::default(), 0)
            .await
            .unwrap();
        assert_eq!(result.final_answer.as_deref(), Some("1.8"));
    }
}
