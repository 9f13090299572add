//! Core library for kt2, a tool that brings Kubernetes test clusters up,
//! runs a tester against them, and tears them down again.
//!
//! The pipeline drives a [`pipeline::Deployer`] through Build, Up, Test and
//! Down. The GKE deployer creates clusters across one or more projects with
//! `gcloud`, failing over between locations when a creation error looks
//! transient, and cleans up best effort. All provider calls go through
//! [`process::CommandRunner`] so orchestration can be exercised without a
//! cloud account.

pub mod boskos;
pub mod builder;
pub mod config;
pub mod gke;
pub mod location;
pub mod naming;
pub mod pipeline;
pub mod process;
pub mod retry;
pub mod test_support;
pub mod tester;

pub use boskos::{BoskosClient, BoskosConfig, BoskosError, ResourceBroker};
pub use builder::{BuildStrategy, Builder};
pub use config::{ConfigError, GkeConfig, GkeOptions, GkeOverrides};
pub use gke::{GkeDeployer, GkeError};
pub use location::LocationSet;
pub use naming::generate_cluster_names;
pub use pipeline::{Deployer, NoopDeployer, PhaseSelection, Pipeline, PipelineError, RunContext};
pub use process::{CommandRunner, CommandSpec, ProcessCommandRunner, ProcessError};
pub use retry::{PatternClassifier, RetryClassifier};
pub use tester::{ExecTester, TestEnvironment, Tester};
