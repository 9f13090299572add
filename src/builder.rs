//! Release builds and staging of the resulting tarballs.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::info;

use crate::process::{CommandRunner, CommandSpec, OutputMode, ProcessError, run_blocking};

/// Directory, relative to the repository root, that receives release tarballs.
pub const RELEASE_TARS_DIR: &str = "_output/release-tars";

/// How the release artefacts are produced.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BuildStrategy {
    /// `make quick-release`.
    #[default]
    Make,
    /// `bazel build //build/release-tars`.
    Bazel,
}

impl BuildStrategy {
    /// Program and arguments for this strategy.
    #[must_use]
    pub fn command(self) -> (&'static str, &'static [&'static str]) {
        match self {
            Self::Make => ("make", &["quick-release"]),
            Self::Bazel => ("bazel", &["build", "//build/release-tars"]),
        }
    }
}

impl fmt::Display for BuildStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Make => f.write_str("make"),
            Self::Bazel => f.write_str("bazel"),
        }
    }
}

impl FromStr for BuildStrategy {
    type Err = BuildError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "make" => Ok(Self::Make),
            "bazel" => Ok(Self::Bazel),
            other => Err(BuildError::UnknownStrategy(other.to_owned())),
        }
    }
}

/// Errors raised while building or staging.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The strategy name is not recognised.
    #[error("unknown build strategy '{0}': expected make or bazel")]
    UnknownStrategy(String),
    /// The build command failed.
    #[error("build failed: {0}")]
    Build(#[source] ProcessError),
    /// Copying the tarballs to the stage location failed.
    #[error("staging to {location} failed: {source}")]
    Stage {
        /// Destination that was being written.
        location: String,
        /// Underlying process error.
        #[source]
        source: ProcessError,
    },
}

/// Settings for [`Builder`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildOptions {
    /// Strategy to run.
    pub strategy: BuildStrategy,
    /// Repository root the build runs in.
    pub repo_root: Utf8PathBuf,
    /// Bucket path that receives the tarballs, when staging is wanted.
    pub stage_location: Option<String>,
    /// Path to `gsutil`.
    pub gsutil_bin: String,
}

/// Runs the configured build and optional staging step.
#[derive(Debug)]
pub struct Builder<R: ?Sized> {
    runner: Arc<R>,
    options: BuildOptions,
}

impl<R> Builder<R>
where
    R: CommandRunner + ?Sized + 'static,
{
    /// Creates a builder.
    #[must_use]
    pub const fn new(runner: Arc<R>, options: BuildOptions) -> Self {
        Self { runner, options }
    }

    /// Builds, then stages under `<stage_location>/<run_id>` if configured.
    /// Returns the staged location.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] when either command fails.
    pub async fn build(&self, run_id: &str) -> Result<Option<String>, BuildError> {
        let (program, args) = self.options.strategy.command();
        info!(strategy = %self.options.strategy, root = %self.options.repo_root, "building release");
        let spec = CommandSpec::new(program)
            .args(args.iter().copied())
            .current_dir(self.options.repo_root.clone())
            .output(OutputMode::Inherit);
        run_blocking(Arc::clone(&self.runner), spec)
            .await
            .and_then(|output| output.check(program))
            .map_err(BuildError::Build)?;

        let Some(ref stage) = self.options.stage_location else {
            return Ok(None);
        };
        let destination = format!("{}/{run_id}", stage.trim_end_matches('/'));
        info!(%destination, "staging release tarballs");
        let spec = CommandSpec::new(self.options.gsutil_bin.clone())
            .args(["-m", "cp", "-r", RELEASE_TARS_DIR, destination.as_str()])
            .current_dir(self.options.repo_root.clone())
            .output(OutputMode::Inherit);
        run_blocking(Arc::clone(&self.runner), spec)
            .await
            .and_then(|output| output.check(&self.options.gsutil_bin))
            .map_err(|source| BuildError::Stage {
                location: destination.clone(),
                source,
            })?;
        Ok(Some(destination))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::test_support::ScriptedRunner;

    fn options(strategy: BuildStrategy, stage: Option<&str>) -> BuildOptions {
        BuildOptions {
            strategy,
            repo_root: Utf8PathBuf::from("/src/kubernetes"),
            stage_location: stage.map(str::to_owned),
            gsutil_bin: String::from("gsutil"),
        }
    }

    #[rstest]
    #[case("make", BuildStrategy::Make)]
    #[case(" Bazel ", BuildStrategy::Bazel)]
    fn strategy_parses(#[case] raw: &str, #[case] expected: BuildStrategy) {
        assert_eq!(raw.parse::<BuildStrategy>().expect("known"), expected);
    }

    #[rstest]
    fn unknown_strategy_is_rejected() {
        let err = "ninja".parse::<BuildStrategy>().expect_err("unknown");
        assert!(err.to_string().contains("ninja"));
    }

    #[tokio::test]
    async fn bazel_build_then_stage_under_run_id() {
        let runner = Arc::new(ScriptedRunner::permissive());
        let builder = Builder::new(
            Arc::clone(&runner),
            options(BuildStrategy::Bazel, Some("gs://bucket/ci/")),
        );

        let staged = builder.build("run-1").await.expect("build succeeds");

        assert_eq!(staged.as_deref(), Some("gs://bucket/ci/run-1"));
        let calls = runner.invocations();
        let commands: Vec<String> = calls.iter().map(|c| c.command_string()).collect();
        assert_eq!(
            commands,
            vec![
                String::from("bazel build //build/release-tars"),
                String::from("gsutil -m cp -r _output/release-tars gs://bucket/ci/run-1"),
            ]
        );
    }

    #[tokio::test]
    async fn failed_build_skips_staging() {
        let runner = Arc::new(ScriptedRunner::permissive());
        runner.on_command(&["make quick-release"], Some(2), "", "compile error");
        let builder = Builder::new(
            Arc::clone(&runner),
            options(BuildStrategy::Make, Some("gs://bucket")),
        );

        let err = builder.build("run-1").await.expect_err("build fails");

        assert!(matches!(err, BuildError::Build(_)));
        assert_eq!(runner.count_matching(&["gsutil"]), 0);
    }
}
