//! Unit tests for the phase driver.

use std::future;
use std::sync::Mutex;
use std::time::Duration;

use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::tester::TesterFuture;

#[derive(Debug, Error)]
#[error("scripted deployer failure")]
struct ScriptedFailure;

#[derive(Debug, Default)]
struct RecordingDeployer {
    calls: Mutex<Vec<&'static str>>,
    fail_up: bool,
    hang_up: bool,
}

impl RecordingDeployer {
    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().expect("lock").clone()
    }

    fn note(&self, call: &'static str) {
        self.calls.lock().expect("lock").push(call);
    }
}

impl Deployer for RecordingDeployer {
    type Error = ScriptedFailure;

    fn name(&self) -> &'static str {
        "recording"
    }

    fn build<'a>(&'a self, _context: &'a RunContext) -> DeployerFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.note("build");
            Ok(())
        })
    }

    fn up<'a>(&'a self, _context: &'a RunContext) -> DeployerFuture<'a, UpOutcome, Self::Error> {
        Box::pin(async move {
            self.note("up");
            if self.hang_up {
                future::pending::<()>().await;
            }
            if self.fail_up {
                return Err(ScriptedFailure);
            }
            Ok(UpOutcome {
                kubeconfig: Some(Utf8PathBuf::from("/up/kubeconfig")),
                env: vec![(String::from("GKE_CLUSTER_NAMES"), String::from("kt2-1"))],
            })
        })
    }

    fn down<'a>(&'a self, _context: &'a RunContext) -> DeployerFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.note("down");
            Ok(())
        })
    }

    fn existing(&self, _context: &RunContext) -> UpOutcome {
        UpOutcome {
            kubeconfig: Some(Utf8PathBuf::from("/existing/kubeconfig")),
            env: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct RecordingTester {
    seen: Mutex<Vec<TestEnvironment>>,
}

impl Tester for RecordingTester {
    fn name(&self) -> &str {
        "recorder"
    }

    fn test<'a>(&'a self, environment: &'a TestEnvironment) -> TesterFuture<'a> {
        Box::pin(async move {
            self.seen.lock().expect("lock").push(environment.clone());
            Ok(())
        })
    }
}

struct Workspace {
    _temp: TempDir,
    context: RunContext,
}

#[fixture]
fn workspace() -> Workspace {
    let temp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8");
    let context = RunContext::resolve(
        Some(String::from("run-1")),
        Some(root.join("_artifacts")),
        None,
    );
    Workspace {
        _temp: temp,
        context,
    }
}

const ALL: PhaseSelection = PhaseSelection {
    build: true,
    up: true,
    down: true,
};

#[rstest]
fn run_context_prefers_flag_then_env() {
    let from_env = RunContext::resolve(
        Some(String::from("abc")),
        None,
        Some(String::from("/ci/artifacts")),
    );
    assert_eq!(from_env.artifacts, "/ci/artifacts");
    assert_eq!(from_env.run_dir, "/ci/_rundir/abc");

    let from_flag = RunContext::resolve(
        Some(String::from("abc")),
        Some(Utf8PathBuf::from("/flag/out")),
        Some(String::from("/ci/artifacts")),
    );
    assert_eq!(from_flag.artifacts, "/flag/out");
    assert_eq!(from_flag.kubeconfig_path(), "/flag/_rundir/abc/kubetest2-kubeconfig");
}

#[rstest]
fn run_context_defaults() {
    let context = RunContext::resolve(None, None, None);

    assert_eq!(context.artifacts, "./_artifacts");
    assert!(Uuid::parse_str(&context.run_id).is_ok());
    assert_eq!(context.run_dir, Utf8Path::new("./_rundir").join(&context.run_id));
}

#[rstest]
#[tokio::test]
async fn phases_run_in_order_and_are_recorded(workspace: Workspace) {
    let deployer = RecordingDeployer::default();
    let tester = RecordingTester::default();
    let pipeline = Pipeline::new(&deployer, Some(&tester), &workspace.context, ALL);

    pipeline.run(future::pending()).await.expect("run succeeds");

    assert_eq!(deployer.calls(), ["build", "up", "down"]);
    let seen = tester.seen.lock().expect("lock").clone();
    let environment = seen.first().expect("tester ran");
    assert_eq!(environment.kubeconfig.as_deref(), Some(Utf8Path::new("/up/kubeconfig")));
    assert_eq!(environment.run_id, "run-1");
    let junit = std::fs::read_to_string(workspace.context.artifacts.join("junit_runner.xml"))
        .expect("junit written");
    for phase in ["Build", "Up", "Test", "Down"] {
        assert!(junit.contains(&format!(r#"name="{phase}""#)), "{phase} missing");
    }
    assert!(workspace.context.run_dir.is_dir());
}

#[rstest]
#[tokio::test]
async fn failed_up_skips_test_but_still_tears_down(workspace: Workspace) {
    let deployer = RecordingDeployer {
        fail_up: true,
        ..RecordingDeployer::default()
    };
    let tester = RecordingTester::default();
    let pipeline = Pipeline::new(&deployer, Some(&tester), &workspace.context, ALL);

    let err = pipeline.run(future::pending()).await.expect_err("up fails");

    assert!(matches!(err, PipelineError::Up(_)));
    assert_eq!(deployer.calls(), ["build", "up", "down"]);
    assert!(tester.seen.lock().expect("lock").is_empty());
}

#[rstest]
#[tokio::test]
async fn interrupt_tears_down_even_without_down_flag(workspace: Workspace) {
    let deployer = RecordingDeployer {
        hang_up: true,
        ..RecordingDeployer::default()
    };
    let phases = PhaseSelection {
        up: true,
        ..PhaseSelection::default()
    };
    let pipeline = Pipeline::new(&deployer, None, &workspace.context, phases);

    let err = pipeline
        .run(tokio::time::sleep(Duration::from_millis(20)))
        .await
        .expect_err("interrupted");

    assert!(matches!(err, PipelineError::Interrupted));
    assert_eq!(deployer.calls(), ["up", "down"]);
    let junit = std::fs::read_to_string(workspace.context.artifacts.join(results::JUNIT_FILE_NAME))
        .expect("junit written");
    let up = junit.find("name=\"Up\"").expect("interrupted Up is recorded");
    let down = junit.find("name=\"Down\"").expect("Down is recorded");
    assert!(up < down);
    assert!(junit.contains("message=\"interrupted\""), "{junit}");
}

#[rstest]
#[tokio::test]
async fn test_without_up_uses_existing_clusters(workspace: Workspace) {
    let deployer = RecordingDeployer::default();
    let tester = RecordingTester::default();
    let pipeline = Pipeline::new(
        &deployer,
        Some(&tester),
        &workspace.context,
        PhaseSelection::default(),
    );

    pipeline.run(future::pending()).await.expect("run succeeds");

    assert!(deployer.calls().is_empty());
    let seen = tester.seen.lock().expect("lock").clone();
    assert_eq!(
        seen.first().and_then(|env| env.kubeconfig.clone()),
        Some(Utf8PathBuf::from("/existing/kubeconfig"))
    );
}

#[rstest]
#[tokio::test]
async fn noop_deployer_passes_kubeconfig_through(workspace: Workspace) {
    let deployer = NoopDeployer::new(Some(Utf8PathBuf::from("/home/me/.kube/config")));

    let outcome = deployer.up(&workspace.context).await.expect("infallible");

    assert_eq!(
        outcome.kubeconfig,
        Some(Utf8PathBuf::from("/home/me/.kube/config"))
    );
    assert!(outcome.env.is_empty());
}
