//! Binary entry point for the kt2 CLI.

use std::env;
use std::future::Future;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use kt2::boskos::{BoskosClient, BoskosConfig, BoskosError};
use kt2::config::{ConfigError, GkeConfig, GkeOverrides};
use kt2::gke::{GkeDeployer, ProjectLeasing};
use kt2::pipeline::{
    Deployer, NoopDeployer, PhaseSelection, Pipeline, PipelineError, RunContext,
};
use kt2::process::ProcessCommandRunner;
use kt2::tester::{EXEC_TESTER, ExecTester, Tester};

mod cli;

use cli::{Cli, CommonArgs, GkeCommand, NoopCommand};

const LOG_ENV: &str = "KT2_LOG";
const EXIT_FAILURE: i32 = 1;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("resource broker error: {0}")]
    Broker(#[from] BoskosError),
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(String),
    #[error("--test={EXEC_TESTER} needs a command after --")]
    MissingTesterCommand,
    #[error("{0}")]
    Run(String),
    #[error("interrupted; teardown was attempted")]
    Interrupted,
}

impl CliError {
    const fn exit_code(&self) -> i32 {
        match *self {
            Self::Interrupted => EXIT_INTERRUPTED,
            Self::Config(_)
            | Self::Broker(_)
            | Self::NonUtf8Path(_)
            | Self::MissingTesterCommand
            | Self::Run(_) => EXIT_FAILURE,
        }
    }
}

impl<E> From<PipelineError<E>> for CliError
where
    E: std::error::Error + 'static,
{
    fn from(err: PipelineError<E>) -> Self {
        match err {
            PipelineError::Interrupted => Self::Interrupted,
            other => Self::Run(other.to_string()),
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli, shutdown_signal()).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            err.exit_code()
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

/// Resolves on the first SIGINT or SIGTERM. A listener that cannot be
/// installed never resolves.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for interrupts");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => info!("received interrupt"),
        () = terminate => info!("received SIGTERM"),
    }
}

async fn dispatch<F>(cli: Cli, interrupt: F) -> Result<(), CliError>
where
    F: Future<Output = ()>,
{
    match cli {
        Cli::Gke(command) => run_gke(command, interrupt).await,
        Cli::Noop(command) => run_noop(command, interrupt).await,
    }
}

async fn run_gke<F>(command: GkeCommand, interrupt: F) -> Result<(), CliError>
where
    F: Future<Output = ()>,
{
    check_tester(&command.common)?;
    let context = run_context(&command.common)?;
    let mut config = GkeConfig::load_without_cli_args()?;
    config.apply_overrides(&gke_overrides(&command));
    let options = config.validate()?;

    let runner = Arc::new(ProcessCommandRunner);
    let needs_broker = options.projects.is_empty() && command.common.up;
    let base = GkeDeployer::new(Arc::clone(&runner), options);
    let deployer = if needs_broker {
        base.with_leasing(project_leasing(command.boskos_location.clone())?)
    } else {
        base
    };
    run_pipeline(&deployer, &command.common, &context, runner, interrupt).await
}

async fn run_noop<F>(command: NoopCommand, interrupt: F) -> Result<(), CliError>
where
    F: Future<Output = ()>,
{
    check_tester(&command.common)?;
    let context = run_context(&command.common)?;
    let kubeconfig = match command.kubeconfig {
        Some(path) => Some(utf8_path(path)?),
        None => env::var("KUBECONFIG")
            .ok()
            .filter(|value| !value.is_empty())
            .map(Utf8PathBuf::from),
    };
    let deployer = NoopDeployer::new(kubeconfig);
    let runner = Arc::new(ProcessCommandRunner);
    run_pipeline(&deployer, &command.common, &context, runner, interrupt).await
}

async fn run_pipeline<D, F>(
    deployer: &D,
    common: &CommonArgs,
    context: &RunContext,
    runner: Arc<ProcessCommandRunner>,
    interrupt: F,
) -> Result<(), CliError>
where
    D: Deployer,
    F: Future<Output = ()>,
{
    let tester = common
        .test
        .as_ref()
        .map(|name| ExecTester::new(runner, name.clone(), common.tester_args.clone()));
    let phases = PhaseSelection {
        build: common.build,
        up: common.up,
        down: common.down,
    };
    info!(
        deployer = deployer.name(),
        run_id = %context.run_id,
        artifacts = %context.artifacts,
        "starting run"
    );
    Pipeline::new(
        deployer,
        tester.as_ref().map(|tester| tester as &dyn Tester),
        context,
        phases,
    )
    .run(interrupt)
    .await
    .map_err(CliError::from)
}

/// Rejects `--test=exec` without a command before any cluster is created.
fn check_tester(common: &CommonArgs) -> Result<(), CliError> {
    if common.test.as_deref() == Some(EXEC_TESTER) && common.tester_args.is_empty() {
        return Err(CliError::MissingTesterCommand);
    }
    Ok(())
}

fn run_context(common: &CommonArgs) -> Result<RunContext, CliError> {
    let artifacts = common.artifacts.clone().map(utf8_path).transpose()?;
    Ok(RunContext::resolve(
        common.run_id.clone(),
        artifacts,
        env::var("ARTIFACTS").ok(),
    ))
}

fn utf8_path(path: PathBuf) -> Result<Utf8PathBuf, CliError> {
    Utf8PathBuf::from_path_buf(path).map_err(|raw| CliError::NonUtf8Path(raw.display().to_string()))
}

fn gke_overrides(command: &GkeCommand) -> GkeOverrides {
    GkeOverrides {
        projects: command.projects.clone(),
        regions: command.regions.clone(),
        zones: command.zones.clone(),
        cluster_names: command.cluster_names.clone(),
        num_clusters: command.num_clusters,
        network: command.network.clone(),
        private_cluster_access_level: command.private_cluster_access_level.clone(),
        retryable_error_patterns: command.retryable_error_patterns.clone(),
        build_strategy: command.build_strategy.clone(),
        stage_location: command.stage_location.clone(),
    }
}

fn project_leasing(location: Option<String>) -> Result<ProjectLeasing, CliError> {
    let mut config = BoskosConfig::load_without_cli_args()?;
    if let Some(url) = location {
        config.location = Some(url);
    }
    config.validate()?;
    let client = BoskosClient::from_config(&config)?;
    Ok(ProjectLeasing {
        broker: Arc::new(client),
        heartbeat_interval: config.heartbeat_interval(),
        resource_type: config.resource_type,
    })
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "kt2: {err}").ok();
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
