//! Unit tests for the `kt2` binary.

use std::future;

use rstest::rstest;
use tempfile::TempDir;

use super::*;

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(args).expect("valid command line")
}

#[rstest]
fn gke_flags_become_overrides() {
    let Cli::Gke(command) = parse(&[
        "kt2",
        "gke",
        "--up",
        "--project",
        "host,svc",
        "--region=us-central1",
        "--region=us-east1",
        "--retryable-error-pattern",
        "quota",
        "--retryable-error-pattern",
        "stockout",
        "--test",
        "ginkgo",
        "--",
        "--focus=Conformance",
    ]) else {
        panic!("expected the gke subcommand");
    };

    let overrides = gke_overrides(&command);

    assert_eq!(overrides.projects, ["host", "svc"]);
    assert_eq!(overrides.regions, ["us-central1", "us-east1"]);
    assert_eq!(overrides.retryable_error_patterns, ["quota", "stockout"]);
    assert!(overrides.zones.is_empty());
    assert!(command.common.up);
    assert_eq!(command.common.tester_args, ["--focus=Conformance"]);
}

#[rstest]
#[case(&["kt2", "noop", "--test", "exec"], true)]
#[case(&["kt2", "noop", "--test", "exec", "--", "true"], false)]
#[case(&["kt2", "noop", "--test", "ginkgo"], false)]
fn exec_tester_needs_a_command(#[case] args: &[&str], #[case] rejected: bool) {
    let Cli::Noop(command) = parse(args) else {
        panic!("expected the noop subcommand");
    };

    assert_eq!(check_tester(&command.common).is_err(), rejected);
}

#[rstest]
fn interrupted_runs_exit_130() {
    let interrupted = CliError::from(PipelineError::<std::io::Error>::Interrupted);
    let failed = CliError::from(PipelineError::Up(std::io::Error::other("quota")));

    assert_eq!(interrupted.exit_code(), 130);
    assert_eq!(failed.exit_code(), 1);
    assert_eq!(failed.to_string(), "up failed: quota");
}

#[rstest]
fn write_error_prefixes_binary_name() {
    let mut buf = Vec::new();

    write_error(&mut buf, &CliError::MissingTesterCommand);

    let rendered = String::from_utf8(buf).expect("utf8");
    assert_eq!(rendered, "kt2: --test=exec needs a command after --\n");
}

#[tokio::test]
async fn noop_run_writes_results() {
    let temp = TempDir::new().expect("tempdir");
    let artifacts = temp.path().join("out");
    let artifacts_arg = artifacts.to_str().expect("utf8 path");
    let cli = parse(&[
        "kt2",
        "noop",
        "--up",
        "--down",
        "--run-id",
        "unit",
        "--artifacts",
        artifacts_arg,
        "--kubeconfig",
        "/tmp/kubeconfig",
    ]);

    dispatch(cli, future::pending()).await.expect("noop run");

    assert!(artifacts.join("junit_runner.xml").is_file());
    assert!(artifacts.join("metadata.json").is_file());
    assert!(temp.path().join("_rundir").join("unit").is_dir());
}
