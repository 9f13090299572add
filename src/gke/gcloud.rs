//! Thin async wrapper over the `gcloud` CLI.

use std::sync::Arc;

use crate::process::{
    CommandOutput, CommandRunner, CommandSpec, OutputMode, ProcessError, run_blocking,
};

/// Runs `gcloud` through a shared [`CommandRunner`].
#[derive(Debug)]
pub struct Gcloud<R: ?Sized> {
    runner: Arc<R>,
    bin: String,
}

impl<R: ?Sized> Clone for Gcloud<R> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            bin: self.bin.clone(),
        }
    }
}

impl<R> Gcloud<R>
where
    R: CommandRunner + ?Sized + 'static,
{
    /// Creates a wrapper invoking `bin`.
    #[must_use]
    pub fn new(runner: Arc<R>, bin: impl Into<String>) -> Self {
        Self {
            runner,
            bin: bin.into(),
        }
    }

    /// Returns the underlying runner.
    #[must_use]
    pub fn runner(&self) -> Arc<R> {
        Arc::clone(&self.runner)
    }

    /// Builds a capturing spec for `args`.
    #[must_use]
    pub fn spec(&self, args: Vec<String>) -> CommandSpec {
        CommandSpec::new(self.bin.clone()).args(args)
    }

    /// Runs `args` and fails on a non-zero exit.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] when the command cannot start or exits
    /// non-zero.
    pub async fn run(&self, args: Vec<String>) -> Result<CommandOutput, ProcessError> {
        self.run_spec(self.spec(args)).await
    }

    /// Runs a prepared spec and fails on a non-zero exit.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] when the command cannot start or exits
    /// non-zero.
    pub async fn run_spec(&self, spec: CommandSpec) -> Result<CommandOutput, ProcessError> {
        run_blocking(Arc::clone(&self.runner), spec)
            .await?
            .check(&self.bin)
    }

    /// Probes whether a resource exists by running `args` with output
    /// discarded and reporting whether it exited zero.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] only when the command cannot start.
    pub async fn exists(&self, args: Vec<String>) -> Result<bool, ProcessError> {
        let spec = self.spec(args).output(OutputMode::Discard);
        let output = run_blocking(Arc::clone(&self.runner), spec).await?;
        Ok(output.is_success())
    }
}
