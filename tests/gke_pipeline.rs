//! End-to-end pipeline runs against the GKE deployer with a scripted
//! `gcloud`.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use kt2::builder::BuildStrategy;
use kt2::config::{ClusterNames, GkeOptions};
use kt2::gke::GkeDeployer;
use kt2::location::LocationSet;
use kt2::pipeline::{PhaseSelection, Pipeline, PipelineError, RunContext};
use kt2::retry::PatternClassifier;
use kt2::test_support::ScriptedRunner;
use kt2::tester::{ExecTester, Tester};

const EXHAUSTED: &str = "ERROR: (gcloud.container.clusters.create) ZONE_RESOURCE_POOL_EXHAUSTED";

#[fixture]
fn options() -> GkeOptions {
    GkeOptions {
        gcloud_bin: String::from("gcloud"),
        gsutil_bin: String::from("gsutil"),
        projects: vec![String::from("proj")],
        project_count: 1,
        locations: LocationSet::Regions(vec![
            String::from("us-central1"),
            String::from("us-east1"),
        ]),
        clusters: ClusterNames::Generated(1),
        network: String::from("default"),
        num_nodes: 1,
        machine_type: String::from("e2-standard-4"),
        image_type: String::from("cos_containerd"),
        cluster_version: String::from("latest"),
        release_channel: None,
        private_cluster: None,
        extra_node_pools: Vec::new(),
        node_pool_create_concurrency: 1,
        windows_pool: None,
        retry: PatternClassifier::with_defaults().expect("defaults compile"),
        build_strategy: BuildStrategy::Make,
        repo_root: Utf8PathBuf::from("."),
        stage_location: None,
    }
}

struct Workspace {
    _temp: TempDir,
    context: RunContext,
}

#[fixture]
fn workspace() -> Workspace {
    let temp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8 tempdir");
    let context = RunContext::resolve(Some(String::from("e2e")), Some(root.join("_artifacts")), None);
    Workspace {
        _temp: temp,
        context,
    }
}

const ALL_PHASES: PhaseSelection = PhaseSelection {
    build: false,
    up: true,
    down: true,
};

#[rstest]
#[tokio::test]
async fn retried_region_is_published_to_the_tester(options: GkeOptions, workspace: Workspace) {
    let gcloud = Arc::new(ScriptedRunner::permissive());
    gcloud.on_command(
        &["clusters create", "--region=us-central1"],
        Some(1),
        "",
        EXHAUSTED,
    );
    let deployer = GkeDeployer::new(Arc::clone(&gcloud), options);
    let tester_runner = Arc::new(ScriptedRunner::permissive());
    let tester = ExecTester::new(Arc::clone(&tester_runner), "ginkgo", Vec::new());

    Pipeline::new(
        &deployer,
        Some(&tester as &dyn Tester),
        &workspace.context,
        ALL_PHASES,
    )
    .run(future::pending())
    .await
    .expect("run succeeds in the second region");

    let calls = tester_runner.invocations();
    let [call] = calls.as_slice() else {
        panic!("expected one tester invocation, got {calls:?}");
    };
    assert_eq!(call.program, "kubetest2-tester-ginkgo");
    assert_eq!(call.env_value("GKE_CLUSTER_LOCATIONS"), Some("us-east1"));
    assert_eq!(call.env_value("KUBETEST2_RUN_ID"), Some("e2e"));
    assert_eq!(
        call.env_value("KUBECONFIG"),
        Some(workspace.context.kubeconfig_path().as_str())
    );
    assert_eq!(
        gcloud.count_matching(&["clusters delete kt2-e2e-1", "--region=us-east1"]),
        1
    );
}

#[rstest]
#[tokio::test]
async fn fatal_up_failure_still_tears_down(options: GkeOptions, workspace: Workspace) {
    let gcloud = Arc::new(ScriptedRunner::permissive());
    gcloud.on_command(
        &["clusters create"],
        Some(1),
        "",
        "ERROR: permission denied",
    );
    let deployer = GkeDeployer::new(Arc::clone(&gcloud), options);
    let tester_runner = Arc::new(ScriptedRunner::permissive());
    let tester = ExecTester::new(Arc::clone(&tester_runner), "ginkgo", Vec::new());

    let err = Pipeline::new(
        &deployer,
        Some(&tester as &dyn Tester),
        &workspace.context,
        ALL_PHASES,
    )
    .run(future::pending())
    .await
    .expect_err("up fails");

    assert!(matches!(err, PipelineError::Up(_)), "{err}");
    assert!(tester_runner.invocations().is_empty());
    assert_eq!(gcloud.count_matching(&["clusters create"]), 1);
    assert_eq!(
        gcloud.count_matching(&["clusters delete kt2-e2e-1", "--region=us-central1"]),
        1
    );
    let junit = std::fs::read_to_string(workspace.context.artifacts.join("junit_runner.xml"))
        .expect("junit written after failure");
    assert!(junit.contains("permission denied"));
}

#[rstest]
#[tokio::test]
async fn interrupt_during_up_runs_down(options: GkeOptions, workspace: Workspace) {
    let gcloud = Arc::new(ScriptedRunner::permissive());
    let deployer = GkeDeployer::new(Arc::clone(&gcloud), options);
    let phases = PhaseSelection {
        build: false,
        up: true,
        down: false,
    };

    let err = Pipeline::new(&deployer, None, &workspace.context, phases)
        .run(future::ready(()))
        .await
        .expect_err("interrupted");

    assert!(matches!(err, PipelineError::Interrupted));
    assert!(gcloud.count_matching(&["clusters delete kt2-e2e-1"]) >= 1);
}

#[rstest]
#[tokio::test]
async fn interrupt_during_retry_tears_down_the_location_in_flight(
    options: GkeOptions,
    workspace: Workspace,
) {
    let gcloud = Arc::new(ScriptedRunner::permissive());
    gcloud.on_command(
        &["clusters create", "--region=us-central1"],
        Some(1),
        "",
        EXHAUSTED,
    );
    gcloud.delay_command(
        &["clusters create", "--region=us-east1"],
        Duration::from_millis(800),
    );
    let deployer = GkeDeployer::new(Arc::clone(&gcloud), options);
    let phases = PhaseSelection {
        build: false,
        up: true,
        down: false,
    };

    let err = Pipeline::new(&deployer, None, &workspace.context, phases)
        .run(tokio::time::sleep(Duration::from_millis(300)))
        .await
        .expect_err("interrupted");

    assert!(matches!(err, PipelineError::Interrupted));
    assert!(
        gcloud.count_matching(&["clusters delete kt2-e2e-1", "--region=us-central1"]) >= 1,
        "the failed first attempt is cleaned up"
    );
    assert_eq!(
        gcloud.count_matching(&["clusters delete kt2-e2e-1", "--region=us-east1"]),
        1,
        "the cluster being created in us-east1 is deleted"
    );
}
