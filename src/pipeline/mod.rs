//! Phase driver: Build, Up, Test, then a deferred Down.
//!
//! The first failing phase stops the phases after it, but Down still runs
//! when it was requested. An interrupt abandons the phase in flight and runs
//! Down whenever Up or Test had been requested, so a cancelled run does not
//! leave clusters behind. Every phase is recorded through [`ResultWriter`].

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::tester::{TestEnvironment, Tester, TesterError};

pub mod noop;
pub mod results;

pub use noop::NoopDeployer;
pub use results::{ResultError, ResultWriter, RunMetadata};

/// Artifacts directory used when neither the flag nor `ARTIFACTS` is set.
pub const DEFAULT_ARTIFACTS_DIR: &str = "_artifacts";
/// Name of the kubeconfig written into the run directory.
pub const KUBECONFIG_FILE_NAME: &str = "kubetest2-kubeconfig";

/// Failure message recorded for a phase cut short by an interrupt.
pub const INTERRUPTED_MESSAGE: &str = "interrupted";

/// Where a run keeps its outputs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunContext {
    /// Run identifier.
    pub run_id: String,
    /// Artifacts directory, collected by CI.
    pub artifacts: Utf8PathBuf,
    /// Scratch directory for this run, next to the artifacts.
    pub run_dir: Utf8PathBuf,
}

impl RunContext {
    /// Resolves the context. The artifacts directory comes from the flag,
    /// then `artifacts_env` (the value of `ARTIFACTS`), then `./_artifacts`;
    /// the run id from the flag or a fresh UUID. The run directory is
    /// `<artifacts>/../_rundir/<run-id>`.
    #[must_use]
    pub fn resolve(
        run_id: Option<String>,
        artifacts_flag: Option<Utf8PathBuf>,
        artifacts_env: Option<String>,
    ) -> Self {
        let id = run_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let artifacts = artifacts_flag
            .or_else(|| {
                artifacts_env
                    .filter(|dir| !dir.trim().is_empty())
                    .map(Utf8PathBuf::from)
            })
            .unwrap_or_else(|| Utf8Path::new(".").join(DEFAULT_ARTIFACTS_DIR));
        let rundir_root = artifacts.parent().map_or_else(
            || artifacts.join("..").join("_rundir"),
            |parent| parent.join("_rundir"),
        );
        Self {
            run_dir: rundir_root.join(&id),
            run_id: id,
            artifacts,
        }
    }

    /// Path of the kubeconfig inside the run directory.
    #[must_use]
    pub fn kubeconfig_path(&self) -> Utf8PathBuf {
        self.run_dir.join(KUBECONFIG_FILE_NAME)
    }

    /// Creates the artifacts and run directories.
    ///
    /// # Errors
    ///
    /// Returns [`ResultError::Io`] naming the directory that failed.
    pub fn create_dirs(&self) -> Result<(), ResultError> {
        for dir in [&self.artifacts, &self.run_dir] {
            Dir::create_ambient_dir_all(dir, ambient_authority()).map_err(|err| {
                ResultError::Io {
                    path: dir.clone(),
                    message: err.to_string(),
                }
            })?;
        }
        Ok(())
    }
}

/// What a successful Up hands to the tester.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UpOutcome {
    /// Kubeconfig for the clusters.
    pub kubeconfig: Option<Utf8PathBuf>,
    /// Variables describing the clusters.
    pub env: Vec<(String, String)>,
}

/// Future returned by deployer operations.
pub type DeployerFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Brings clusters up and down.
pub trait Deployer: Send + Sync {
    /// Deployer-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Name recorded in run metadata.
    fn name(&self) -> &'static str;

    /// Builds what the clusters will run.
    fn build<'a>(&'a self, context: &'a RunContext) -> DeployerFuture<'a, (), Self::Error>;

    /// Creates the clusters.
    fn up<'a>(&'a self, context: &'a RunContext) -> DeployerFuture<'a, UpOutcome, Self::Error>;

    /// Deletes whatever Up created, best effort.
    fn down<'a>(&'a self, context: &'a RunContext) -> DeployerFuture<'a, (), Self::Error>;

    /// Describes clusters that already exist, for Test without Up.
    fn existing(&self, context: &RunContext) -> UpOutcome;
}

/// Phases requested on the command line. Test is requested by choosing a
/// tester.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PhaseSelection {
    /// Run Build.
    pub build: bool,
    /// Run Up.
    pub up: bool,
    /// Run Down.
    pub down: bool,
}

/// Errors that fail a run.
#[derive(Debug, Error)]
pub enum PipelineError<E>
where
    E: std::error::Error + 'static,
{
    /// Build failed.
    #[error("build failed: {0}")]
    Build(#[source] E),
    /// Up failed.
    #[error("up failed: {0}")]
    Up(#[source] E),
    /// The tester failed.
    #[error("test failed: {0}")]
    Test(#[source] TesterError),
    /// Down failed.
    #[error("down failed: {0}")]
    Down(#[source] E),
    /// Directories or result files could not be written.
    #[error(transparent)]
    Results(#[from] ResultError),
    /// The run was interrupted; Down has been attempted.
    #[error("interrupted")]
    Interrupted,
}

/// Runs the selected phases for one deployer and optional tester.
pub struct Pipeline<'a, D> {
    deployer: &'a D,
    tester: Option<&'a dyn Tester>,
    context: &'a RunContext,
    phases: PhaseSelection,
}

impl<D> std::fmt::Debug for Pipeline<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("tester", &self.tester.map(Tester::name))
            .field("context", &self.context)
            .field("phases", &self.phases)
            .finish_non_exhaustive()
    }
}

impl<'a, D> Pipeline<'a, D>
where
    D: Deployer,
{
    /// Creates a pipeline.
    #[must_use]
    pub const fn new(
        deployer: &'a D,
        tester: Option<&'a dyn Tester>,
        context: &'a RunContext,
        phases: PhaseSelection,
    ) -> Self {
        Self {
            deployer,
            tester,
            context,
            phases,
        }
    }

    /// Runs the phases until `interrupt` resolves or they finish, then Down
    /// if due, then writes results.
    ///
    /// # Errors
    ///
    /// Returns the first phase failure, [`PipelineError::Interrupted`] when
    /// interrupted, or a results error when nothing else failed.
    pub async fn run<F>(&self, interrupt: F) -> Result<(), PipelineError<D::Error>>
    where
        F: Future<Output = ()>,
    {
        self.context.create_dirs()?;
        let mut results = ResultWriter::new();

        let finished = tokio::select! {
            outcome = self.run_phases(&mut results) => Some(outcome),
            () = interrupt => None,
        };
        let interrupted = finished.is_none();
        let mut first_error = finished.and_then(Result::err);

        let down_due = if interrupted {
            warn!("interrupted; tearing down");
            results.abandon(INTERRUPTED_MESSAGE);
            self.phases.up || self.tester.is_some()
        } else {
            self.phases.down
        };
        if down_due {
            let outcome = timed(&mut results, "Down", self.deployer.down(self.context)).await;
            if let Err(err) = outcome {
                first_error.get_or_insert(PipelineError::Down(err));
            }
        }

        if let Err(err) = results.write(&self.context.artifacts, &self.metadata()) {
            warn!(error = %err, "failed to write results");
            first_error.get_or_insert(PipelineError::Results(err));
        }

        if interrupted {
            return Err(PipelineError::Interrupted);
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn run_phases(&self, results: &mut ResultWriter) -> Result<(), PipelineError<D::Error>> {
        if self.phases.build {
            timed(results, "Build", self.deployer.build(self.context))
                .await
                .map_err(PipelineError::Build)?;
        }

        let up = if self.phases.up {
            Some(
                timed(results, "Up", self.deployer.up(self.context))
                    .await
                    .map_err(PipelineError::Up)?,
            )
        } else {
            None
        };

        if let Some(tester) = self.tester {
            let clusters = up.unwrap_or_else(|| self.deployer.existing(self.context));
            let environment = TestEnvironment {
                artifacts: self.context.artifacts.clone(),
                run_dir: self.context.run_dir.clone(),
                run_id: self.context.run_id.clone(),
                kubeconfig: clusters.kubeconfig,
                deployer_env: clusters.env,
            };
            timed(results, "Test", tester.test(&environment))
                .await
                .map_err(PipelineError::Test)?;
        }
        Ok(())
    }

    fn metadata(&self) -> RunMetadata {
        RunMetadata {
            version: String::from(env!("CARGO_PKG_VERSION")),
            deployer: String::from(self.deployer.name()),
            tester: self
                .tester
                .map(|tester| tester.name().to_owned())
                .unwrap_or_default(),
            run_id: self.context.run_id.clone(),
        }
    }
}

async fn timed<T, E, F>(results: &mut ResultWriter, phase: &str, future: F) -> Result<T, E>
where
    E: Display,
    F: Future<Output = Result<T, E>>,
{
    info!(%phase, "starting phase");
    results.begin(phase);
    let started = Instant::now();
    let outcome = future.await;
    let elapsed = started.elapsed();
    match outcome {
        Ok(_) => {
            info!(%phase, elapsed_ms = elapsed.as_millis(), "phase finished");
            results.record(phase, elapsed, None);
        }
        Err(ref err) => {
            error!(%phase, error = %err, "phase failed");
            results.record(phase, elapsed, Some(err.to_string()));
        }
    }
    outcome
}

#[cfg(test)]
mod tests;
