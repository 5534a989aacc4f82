//! External stage runner.
//!
//! Spawns a tool as a child process, forwards every line of its combined
//! stdout/stderr to an [`OutputSink`] before reading the next one, and kills
//! the child when the shared cancellation token fires.

use std::ffi::OsString;
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::{QuantsmithError, Result};

/// Receives tool output one line at a time.
pub trait OutputSink: Send + Sync {
    fn line(&self, label: &str, line: &str);
}

/// Logs each output line at debug level, tagged with the stage label.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn line(&self, label: &str, line: &str) {
        debug!("[{}] {}", label, line);
    }
}

/// A fully specified external tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub current_dir: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
    /// Short stage name used in logs and errors (e.g. `convert`).
    pub label: String,
}

impl CommandLine {
    pub fn new(label: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
            label: label.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for CommandLine {
    /// Program and arguments, space separated. Environment values are left
    /// out since they may carry credentials.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Runs external tools with streamed output and cooperative cancellation.
#[derive(Clone)]
pub struct StageRunner {
    cancel: CancellationToken,
    sink: Arc<dyn OutputSink>,
}

impl fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRunner")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl StageRunner {
    pub fn new(cancel: CancellationToken, sink: Arc<dyn OutputSink>) -> Self {
        Self { cancel, sink }
    }

    /// Runner that logs tool output through `tracing`.
    pub fn with_tracing(cancel: CancellationToken) -> Self {
        Self::new(cancel, Arc::new(TracingSink))
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cancellation. A running child is killed and `run` returns
    /// failure promptly.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run a command to completion. Any failure (missing program, non-zero
    /// exit, cancellation) is reported as `false` and logged.
    pub async fn run(&self, command: &CommandLine) -> bool {
        match self.run_checked(command).await {
            Ok(()) => true,
            Err(e) => {
                warn!("[{}] {}", command.label, e);
                false
            }
        }
    }

    /// Like [`run`](Self::run) but keeps the failure reason.
    pub async fn run_checked(&self, command: &CommandLine) -> Result<()> {
        self.cancel.check()?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &command.envs {
            cmd.env(key, value);
        }

        info!("[{}] running: {}", command.label, command);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(QuantsmithError::ToolNotFound {
                    program: command.program.display().to_string(),
                })
            }
            Err(e) => {
                return Err(QuantsmithError::ExternalTool {
                    tool: command.label.clone(),
                    message: format!("failed to start: {e}"),
                })
            }
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            child.kill().await.ok();
            return Err(QuantsmithError::ExternalTool {
                tool: command.label.clone(),
                message: "output pipes unavailable".to_string(),
            });
        };
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut out_open = true;
        let mut err_open = true;

        let mut cancelled = false;
        while out_open || err_open {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                line = out_lines.next_line(), if out_open => match line {
                    Ok(Some(line)) => self.sink.line(&command.label, &line),
                    Ok(None) => out_open = false,
                    Err(e) => {
                        warn!("[{}] error reading stdout: {}", command.label, e);
                        out_open = false;
                    }
                },
                line = err_lines.next_line(), if err_open => match line {
                    Ok(Some(line)) => self.sink.line(&command.label, &line),
                    Ok(None) => err_open = false,
                    Err(e) => {
                        warn!("[{}] error reading stderr: {}", command.label, e);
                        err_open = false;
                    }
                },
            }
        }

        let status = if cancelled {
            None
        } else {
            tokio::select! {
                _ = self.cancel.cancelled() => None,
                status = child.wait() => Some(status),
            }
        };

        let Some(status) = status else {
            info!("[{}] cancelled, killing child process", command.label);
            child.kill().await.ok();
            return Err(QuantsmithError::Cancelled);
        };

        let status = status.map_err(|e| QuantsmithError::ExternalTool {
            tool: command.label.clone(),
            message: format!("process error: {e}"),
        })?;
        if !status.success() {
            return Err(QuantsmithError::ExternalTool {
                tool: command.label.clone(),
                message: format!("exited with status: {}", status.code().unwrap_or(-1)),
            });
        }
        debug!("[{}] finished", command.label);
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct RecordingSink {
        lines: Mutex<Vec<String>>,
    }

    impl OutputSink for RecordingSink {
        fn line(&self, _label: &str, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }
    }

    fn sh(script: &str) -> CommandLine {
        CommandLine::new("test", "sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_run_success_forwards_both_streams() {
        let sink = Arc::new(RecordingSink::default());
        let runner = StageRunner::new(CancellationToken::new(), sink.clone());

        let ok = runner
            .run(&sh("echo one; echo two 1>&2; echo three"))
            .await;

        assert!(ok);
        let mut lines = sink.lines.lock().unwrap().clone();
        lines.sort();
        assert_eq!(lines, vec!["one", "three", "two"]);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure() {
        let runner = StageRunner::with_tracing(CancellationToken::new());
        assert!(!runner.run(&sh("exit 3")).await);

        let err = runner.run_checked(&sh("exit 3")).await.unwrap_err();
        assert!(err.to_string().contains("status: 3"), "{err}");
    }

    #[tokio::test]
    async fn test_missing_program_is_failure() {
        let runner = StageRunner::with_tracing(CancellationToken::new());
        let cmd = CommandLine::new("quantize", "/nonexistent/llama-quantize-xyz");

        assert!(!runner.run(&cmd).await);
        assert!(matches!(
            runner.run_checked(&cmd).await,
            Err(QuantsmithError::ToolNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_env_and_current_dir_are_applied() {
        let temp = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let runner = StageRunner::new(CancellationToken::new(), sink.clone());
        let cmd = sh("echo \"$STAGE_VALUE\"; pwd")
            .env("STAGE_VALUE", "abc")
            .current_dir(temp.path());

        assert!(runner.run(&cmd).await);
        let lines = sink.lines.lock().unwrap().clone();
        assert_eq!(lines[0], "abc");
        let reported = std::fs::canonicalize(&lines[1]).unwrap();
        assert_eq!(reported, std::fs::canonicalize(temp.path()).unwrap());
    }

    #[tokio::test]
    async fn test_cancel_kills_child_promptly() {
        let token = CancellationToken::new();
        let runner = StageRunner::with_tracing(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let started = Instant::now();
        let result = runner.run_checked(&sh("sleep 30")).await;
        canceller.await.unwrap();

        assert!(matches!(result, Err(QuantsmithError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_already_cancelled_does_not_spawn() {
        let token = CancellationToken::new();
        token.cancel();
        let sink = Arc::new(RecordingSink::default());
        let runner = StageRunner::new(token, sink.clone());

        assert!(!runner.run(&sh("echo should-not-run")).await);
        assert!(sink.lines.lock().unwrap().is_empty());
    }

    #[test]
    fn test_command_line_display() {
        let cmd = CommandLine::new("quantize", "llama-quantize")
            .args(["a-CONVERT.gguf", "a-Q4_K_M-UnFixed.gguf", "Q4_K_M"])
            .env("HF_TOKEN", "secret");
        assert_eq!(
            cmd.to_string(),
            "llama-quantize a-CONVERT.gguf a-Q4_K_M-UnFixed.gguf Q4_K_M"
        );
    }
}
