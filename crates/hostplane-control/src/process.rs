//! External process execution.
//!
//! Runs a program with a bounded timeout, capturing stderr line by line. A
//! non-zero exit becomes [`ControlError::Process`]; an expired limit kills
//! the child and becomes [`ControlError::Timeout`].

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::{ControlError, ControlResult};

/// Output from a successful process run.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Captured stdout, empty when stdout was redirected to a file.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Wall-clock run time.
    pub duration: Duration,
}

/// A program invocation with its I/O wiring and time limit.
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
    stdin_file: Option<PathBuf>,
    stdout_file: Option<PathBuf>,
    limit: Duration,
}

impl ProcessCommand {
    /// Create a command for `program` with a time limit.
    #[must_use]
    pub fn new(program: impl Into<String>, limit: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            stdin_file: None,
            stdout_file: None,
            limit,
        }
    }

    /// Append an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run the child in `dir`.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Feed the child's stdin from a file.
    #[must_use]
    pub fn stdin_from(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    /// Write the child's stdout to a file instead of capturing it.
    #[must_use]
    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }

    /// Program name.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the command to completion.
    #[instrument(skip(self), fields(program = %self.program, limit = ?self.limit))]
    pub async fn run(&self) -> ControlResult<ProcessOutput> {
        let mut cmd = TokioCommand::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }

        match self.stdin_file {
            Some(ref path) => {
                cmd.stdin(Stdio::from(std::fs::File::open(path)?));
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }

        match self.stdout_file {
            Some(ref path) => {
                cmd.stdout(Stdio::from(std::fs::File::create(path)?));
            }
            None => {
                cmd.stdout(Stdio::piped());
            }
        }

        debug!(args = ?self.args, "spawning process");
        let start = Instant::now();

        let mut child = cmd.spawn().map_err(|e| ControlError::Process {
            program: self.program.clone(),
            exit_code: None,
            stderr: format!("failed to spawn: {e}"),
        })?;

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut lines = Vec::new();
            if let Some(stderr) = stderr {
                let mut reader_lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader_lines.next_line().await {
                    lines.push(line);
                }
            }
            lines
        });

        let stdout = child.stdout.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stdout) = stdout {
                if let Err(e) = stdout.read_to_string(&mut buf).await {
                    debug!(error = %e, "stdout read failed");
                }
            }
            buf
        });

        let status = match timeout(self.limit, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(ControlError::Process {
                    program: self.program.clone(),
                    exit_code: None,
                    stderr: format!("process error: {e}"),
                });
            }
            Err(_) => {
                warn!("process timed out, killing");
                child.kill().await.ok();
                return Err(ControlError::Timeout {
                    operation: self.program.clone(),
                    limit: self.limit,
                });
            }
        };

        let duration = start.elapsed();
        let stderr = stderr_task.await.unwrap_or_default().join("\n");
        let stdout = stdout_task.await.unwrap_or_default();

        if !status.success() {
            return Err(ControlError::Process {
                program: self.program.clone(),
                exit_code: status.code(),
                stderr,
            });
        }

        debug!(duration_ms = duration.as_millis(), "process finished");

        Ok(ProcessOutput {
            stdout,
            stderr,
            duration,
        })
    }
}
