//! Process runner for the external tools (docker, psql, sqitch, git).
//!
//! Working directory and environment are explicit on every [`Invocation`];
//! the runner never changes the current process's directory or environment.

use async_trait::async_trait;
use repokit_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// A command to run.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    /// Added on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
    /// Values replaced with `***` in logs and error messages.
    pub redact: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env.extend(vars);
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn redact(mut self, secret: Option<&str>) -> Self {
        if let Some(secret) = secret.filter(|s| !s.is_empty()) {
            self.redact.push(secret.to_string());
        }
        self
    }

    /// Command line for logs, with secrets masked.
    pub fn display(&self) -> String {
        let line = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        self.scrub(&line)
    }

    /// Mask every redacted value in `text`.
    pub fn scrub(&self, text: &str) -> String {
        self.redact
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), "***"))
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Trait for running external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and return the output whatever the exit status.
    async fn output(&self, invocation: &Invocation) -> Result<CommandOutput>;

    /// Run to completion, failing with [`Error::CommandFailed`] on a nonzero exit.
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let output = self.output(invocation).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(command_failed(invocation, &output))
        }
    }
}

/// Build the error for a command that exited unsuccessfully.
pub fn command_failed(invocation: &Invocation, output: &CommandOutput) -> Error {
    Error::CommandFailed {
        command: invocation.display(),
        code: output.code,
        stderr: invocation.scrub(output.stderr.trim()),
    }
}

/// Runs commands as child processes, streaming their output into the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn output(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let command_line = invocation.display();
        info!(command = %command_line, "Running command");

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::CommandFailed {
                command: command_line.clone(),
                code: None,
                stderr: format!("{} not found: {}", invocation.program, e),
            },
            _ => Error::Io(e),
        })?;

        let writer = match (child.stdin.take(), invocation.stdin.clone()) {
            (Some(mut stdin), Some(input)) => Some(tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    warn!(error = %e, "Failed to write to child stdin");
                }
                // Dropping stdin closes the pipe.
            })),
            _ => None,
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("child stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("child stderr not captured".to_string()))?;

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();
        let mut stdout_done = false;
        let mut stderr_done = false;

        // Stream output
        while !(stdout_done && stderr_done) {
            tokio::select! {
                line = stdout_reader.next_line(), if !stdout_done => {
                    match line {
                        Ok(Some(line)) => {
                            debug!(program = %invocation.program, "{}", invocation.scrub(&line));
                            stdout_lines.push(line);
                        }
                        Ok(None) => stdout_done = true,
                        Err(e) => {
                            warn!(error = %e, "Error reading stdout");
                            stdout_done = true;
                        }
                    }
                }
                line = stderr_reader.next_line(), if !stderr_done => {
                    match line {
                        Ok(Some(line)) => {
                            info!(program = %invocation.program, "{}", invocation.scrub(&line));
                            stderr_lines.push(line);
                        }
                        Ok(None) => stderr_done = true,
                        Err(e) => {
                            warn!(error = %e, "Error reading stderr");
                            stderr_done = true;
                        }
                    }
                }
            }
        }

        let status = child.wait().await?;
        if let Some(writer) = writer {
            let _ = writer.await;
        }

        let output = CommandOutput {
            code: status.code(),
            stdout: stdout_lines.join("\n"),
            stderr: stderr_lines.join("\n"),
        };
        debug!(command = %command_line, code = ?output.code, "Command finished");
        Ok(output)
    }
}
