//! External process invocation.
//!
//! Every provider interaction (`gcloud`, `gsutil`, `make`, testers) goes
//! through [`CommandRunner`], which executes a [`CommandSpec`] with an explicit
//! environment and working directory. Output can be inherited for
//! user-visible commands, discarded for existence probes, or captured for
//! parsing. No retries happen here; retry policy belongs to the callers.

use std::ffi::OsString;
use std::process::{Command, Stdio};
use std::sync::Arc;

use camino::Utf8PathBuf;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::debug;

/// How the child's stdout and stderr are handled.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OutputMode {
    /// Stream output to the current process's stdout/stderr.
    Inherit,
    /// Drop all output.
    Discard,
    /// Capture output into the returned [`CommandOutput`].
    #[default]
    Capture,
}

/// A fully described external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandSpec {
    /// Program to execute, resolved through `PATH`.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Extra environment variables layered over the inherited environment.
    pub env: Vec<(String, String)>,
    /// Working directory; defaults to the current one.
    pub current_dir: Option<Utf8PathBuf>,
    /// Output handling.
    pub output: OutputMode,
}

impl CommandSpec {
    /// Starts a spec for `program` that captures output.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<OsString>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Adds several environment variables for the child.
    #[must_use]
    pub fn envs<I>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env.extend(pairs);
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Sets the output mode.
    #[must_use]
    pub const fn output(mut self, mode: OutputMode) -> Self {
        self.output = mode;
        self
    }

    /// Renders the program and arguments as a shell-escaped line for logs
    /// and assertions.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(escape(self.program.as_str().into()).into_owned());
        for arg in &self.args {
            let text = arg.to_string_lossy();
            parts.push(escape(text).into_owned());
        }
        parts.join(" ")
    }
}

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output (empty unless captured).
    pub stdout: String,
    /// Captured standard error (empty unless captured).
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Returns non-empty, trimmed stdout lines.
    #[must_use]
    pub fn stdout_lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Converts a non-zero exit into [`ProcessError::CommandFailure`].
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::CommandFailure`] unless the exit code is zero.
    pub fn check(self, program: &str) -> Result<Self, ProcessError> {
        if self.is_success() {
            return Ok(self);
        }

        let status_text = self
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        Err(ProcessError::CommandFailure {
            program: program.to_owned(),
            status: self.code,
            status_text,
            stderr: self.stderr.trim().to_owned(),
        })
    }
}

/// Errors surfaced while running external commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProcessError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command completes with a non-zero exit code.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Command name used for the attempted operation.
        program: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// Raised when the blocking task driving the process was lost.
    #[error("command task for {program} did not complete: {message}")]
    Join {
        /// Command whose task failed.
        program: String,
        /// Join error description.
        message: String,
    },
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `command` and reports its exit status and any captured output.
    ///
    /// A non-zero exit is not an error at this layer; callers use
    /// [`CommandOutput::check`] when they need one.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Spawn`] if the command cannot be started.
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ProcessError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        debug!(command = %command.command_line(), "running command");

        let mut process = Command::new(&command.program);
        process.args(&command.args);
        process.envs(command.env.iter().map(|(key, value)| (key, value)));
        if let Some(ref dir) = command.current_dir {
            process.current_dir(dir);
        }

        let spawn_error = |err: std::io::Error| ProcessError::Spawn {
            program: command.program.clone(),
            message: err.to_string(),
        };

        match command.output {
            OutputMode::Capture => {
                let output = process.output().map_err(spawn_error)?;
                Ok(CommandOutput {
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            OutputMode::Inherit => {
                let status = process
                    .stdin(Stdio::null())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit())
                    .status()
                    .map_err(spawn_error)?;
                Ok(CommandOutput {
                    code: status.code(),
                    ..CommandOutput::default()
                })
            }
            OutputMode::Discard => {
                let status = process
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .map_err(spawn_error)?;
                Ok(CommandOutput {
                    code: status.code(),
                    ..CommandOutput::default()
                })
            }
        }
    }
}

impl<R: CommandRunner + ?Sized> CommandRunner for Arc<R> {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        (**self).run(command)
    }
}

/// Runs `command` on the blocking thread pool so async callers can fan out
/// over external processes.
///
/// Dropping the returned future does not kill the child; an already-started
/// process runs to completion on its worker thread.
///
/// # Errors
///
/// Returns the runner's [`ProcessError`], or [`ProcessError::Join`] when the
/// blocking task panics or is cancelled by runtime shutdown.
pub async fn run_blocking<R>(runner: Arc<R>, command: CommandSpec) -> Result<CommandOutput, ProcessError>
where
    R: CommandRunner + ?Sized + 'static,
{
    let program = command.program.clone();
    tokio::task::spawn_blocking(move || runner.run(&command))
        .await
        .map_err(|err| ProcessError::Join {
            program,
            message: err.to_string(),
        })?
}

#[cfg(test)]
mod tests;
