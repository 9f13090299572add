//! Command-line interface definitions for the `kt2` binary.
//!
//! Kept free of crate-internal types so the build script can include this
//! file to render the manual page.

use std::path::PathBuf;

use clap::{Args, Parser};

/// Top-level CLI for the `kt2` binary.
#[derive(Debug, Parser)]
#[command(
    name = "kt2",
    version,
    about = "Bring Kubernetes clusters up, run a tester against them, and tear them down",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Create GKE clusters with gcloud.
    #[command(name = "gke")]
    Gke(GkeCommand),
    /// Use an existing cluster; Up and Down do nothing.
    #[command(name = "noop")]
    Noop(NoopCommand),
}

/// Phase toggles and run settings shared by every deployer.
#[derive(Debug, Args)]
pub(crate) struct CommonArgs {
    /// Build before bringing clusters up.
    #[arg(long)]
    pub(crate) build: bool,
    /// Create the clusters.
    #[arg(long)]
    pub(crate) up: bool,
    /// Delete the clusters at the end, even after a failure.
    #[arg(long)]
    pub(crate) down: bool,
    /// Tester to run: `exec` or the suffix of a `kubetest2-tester-<name>`
    /// binary.
    #[arg(long, value_name = "NAME")]
    pub(crate) test: Option<String>,
    /// Run identifier; a random UUID when omitted.
    #[arg(long, value_name = "ID")]
    pub(crate) run_id: Option<String>,
    /// Artifacts directory; defaults to `$ARTIFACTS`, then `./_artifacts`.
    #[arg(long, value_name = "DIR")]
    pub(crate) artifacts: Option<PathBuf>,
    /// Arguments passed to the tester (after `--`).
    #[arg(last = true, value_name = "TESTER_ARGS")]
    pub(crate) tester_args: Vec<String>,
}

/// Arguments for `kt2 gke`.
#[derive(Debug, Args)]
pub(crate) struct GkeCommand {
    #[command(flatten)]
    pub(crate) common: CommonArgs,
    /// GCP project; repeat or comma-separate for several. Without any,
    /// projects are leased from Boskos.
    #[arg(long = "project", value_name = "PROJECT", value_delimiter = ',')]
    pub(crate) projects: Vec<String>,
    /// Region to try, in order; conflicts with zones.
    #[arg(long = "region", value_name = "REGION", value_delimiter = ',')]
    pub(crate) regions: Vec<String>,
    /// Zone to try, in order; conflicts with regions.
    #[arg(long = "zone", value_name = "ZONE", value_delimiter = ',')]
    pub(crate) zones: Vec<String>,
    /// Cluster name, optionally `name:projectIndex`.
    #[arg(long = "cluster-name", value_name = "NAME", value_delimiter = ',')]
    pub(crate) cluster_names: Vec<String>,
    /// Number of clusters to create when no names are given.
    #[arg(long, value_name = "N")]
    pub(crate) num_clusters: Option<usize>,
    /// Network name; `default` uses each project's default network.
    #[arg(long, value_name = "NETWORK")]
    pub(crate) network: Option<String>,
    /// Base URL of the Boskos resource broker.
    #[arg(long, value_name = "URL")]
    pub(crate) boskos_location: Option<String>,
    /// Create private clusters: `no`, `limited` or `unrestricted`.
    #[arg(long, value_name = "LEVEL")]
    pub(crate) private_cluster_access_level: Option<String>,
    /// Regular expression marking a creation error as retryable in the next
    /// location. Repeatable.
    #[arg(long = "retryable-error-pattern", value_name = "REGEX")]
    pub(crate) retryable_error_patterns: Vec<String>,
    /// `make` or `bazel`.
    #[arg(long, value_name = "STRATEGY")]
    pub(crate) build_strategy: Option<String>,
    /// Bucket path that receives built release tarballs.
    #[arg(long, value_name = "GCS_PATH")]
    pub(crate) stage_location: Option<String>,
}

/// Arguments for `kt2 noop`.
#[derive(Debug, Args)]
pub(crate) struct NoopCommand {
    #[command(flatten)]
    pub(crate) common: CommonArgs,
    /// Kubeconfig of the existing cluster; defaults to `$KUBECONFIG`.
    #[arg(long, value_name = "PATH")]
    pub(crate) kubeconfig: Option<PathBuf>,
}
