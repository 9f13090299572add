//! Test runners invoked after clusters are up.
//!
//! A tester is an external program. `exec` runs the trailing arguments as
//! given; any other name `<n>` runs `kubetest2-tester-<n>` with them. The
//! child receives the run's environment through [`TestEnvironment`]; the
//! parent process environment is never modified.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::info;

use crate::process::{CommandRunner, CommandSpec, OutputMode, ProcessError, run_blocking};

/// Tester that runs its arguments directly.
pub const EXEC_TESTER: &str = "exec";
/// Prefix of external tester binaries.
pub const TESTER_BINARY_PREFIX: &str = "kubetest2-tester-";

/// Errors raised by testers.
#[derive(Debug, Error)]
pub enum TesterError {
    /// `exec` was selected without a command.
    #[error("the exec tester needs a command after --")]
    MissingCommand,
    /// The tester could not run or exited non-zero.
    #[error("tester {tester} failed: {source}")]
    Failed {
        /// Tester name.
        tester: String,
        /// Underlying process error.
        #[source]
        source: ProcessError,
    },
}

/// Everything a tester needs to find the clusters under test.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TestEnvironment {
    /// Artifacts directory.
    pub artifacts: Utf8PathBuf,
    /// Per-run scratch directory.
    pub run_dir: Utf8PathBuf,
    /// Run identifier.
    pub run_id: String,
    /// Kubeconfig for the clusters, when the deployer has one.
    pub kubeconfig: Option<Utf8PathBuf>,
    /// Variables published by the deployer.
    pub deployer_env: Vec<(String, String)>,
}

impl TestEnvironment {
    /// The variables handed to the tester process: `ARTIFACTS`,
    /// `KUBETEST2_RUN_DIR`, `KUBETEST2_RUN_ID`, `KUBECONFIG` when known,
    /// then the deployer's own variables.
    #[must_use]
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            (String::from("ARTIFACTS"), self.artifacts.to_string()),
            (String::from("KUBETEST2_RUN_DIR"), self.run_dir.to_string()),
            (String::from("KUBETEST2_RUN_ID"), self.run_id.clone()),
        ];
        if let Some(ref kubeconfig) = self.kubeconfig {
            pairs.push((String::from("KUBECONFIG"), kubeconfig.to_string()));
        }
        pairs.extend(self.deployer_env.iter().cloned());
        pairs
    }
}

/// Future returned by [`Tester::test`].
pub type TesterFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TesterError>> + Send + 'a>>;

/// A pluggable test runner.
pub trait Tester: Send + Sync {
    /// Name recorded in run metadata.
    fn name(&self) -> &str;

    /// Runs the tests against the environment.
    fn test<'a>(&'a self, environment: &'a TestEnvironment) -> TesterFuture<'a>;
}

/// Tester backed by an external program.
#[derive(Debug)]
pub struct ExecTester<R: ?Sized> {
    runner: Arc<R>,
    name: String,
    args: Vec<String>,
}

impl<R> ExecTester<R>
where
    R: CommandRunner + ?Sized + 'static,
{
    /// Creates a tester called `name` receiving `args`.
    #[must_use]
    pub fn new(runner: Arc<R>, name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            runner,
            name: name.into(),
            args,
        }
    }

    /// Builds the command for `environment`.
    ///
    /// # Errors
    ///
    /// Returns [`TesterError::MissingCommand`] for `exec` without arguments.
    pub fn command(&self, environment: &TestEnvironment) -> Result<CommandSpec, TesterError> {
        let spec = if self.name == EXEC_TESTER {
            let (program, rest) = self
                .args
                .split_first()
                .ok_or(TesterError::MissingCommand)?;
            CommandSpec::new(program.clone()).args(rest.iter().cloned())
        } else {
            CommandSpec::new(format!("{TESTER_BINARY_PREFIX}{}", self.name))
                .args(self.args.iter().cloned())
        };
        Ok(spec
            .envs(environment.env_pairs())
            .output(OutputMode::Inherit))
    }
}

impl<R> Tester for ExecTester<R>
where
    R: CommandRunner + ?Sized + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn test<'a>(&'a self, environment: &'a TestEnvironment) -> TesterFuture<'a> {
        Box::pin(async move {
            let spec = self.command(environment)?;
            let program = spec.program.clone();
            info!(tester = %self.name, command = %spec.command_line(), "running tester");
            let failed = |source| TesterError::Failed {
                tester: self.name.clone(),
                source,
            };
            run_blocking(Arc::clone(&self.runner), spec)
                .await
                .and_then(|output| output.check(&program))
                .map_err(failed)?;
            Ok(())
        })
    }
}
