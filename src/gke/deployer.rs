//! The GKE deployer: projects, network, clusters, kubeconfig, teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::cleanup::{CleanupQueue, CleanupSummary, Teardown};
use super::gcloud::Gcloud;
use super::instance_groups::{InstanceGroupCache, InstanceGroupMap};
use super::layout::{ClusterLayout, LayoutError};
use super::network::{NetworkManager, NetworkState, is_default_network};
use super::orchestrator::{CreatedClusters, OrchestrationError, Orchestrator};
use crate::boskos::{BoskosError, Heartbeat, ResourceBroker, acquire_many};
use crate::builder::{BuildError, BuildOptions, Builder};
use crate::config::{ClusterNames, GkeOptions};
use crate::naming::generate_cluster_names;
use crate::pipeline::{Deployer, DeployerFuture, RunContext, UpOutcome};
use crate::process::{CommandRunner, ProcessError};

/// Errors raised by the GKE deployer.
#[derive(Debug, Error)]
pub enum GkeError {
    /// Neither projects nor a resource broker were configured.
    #[error("no GCP projects: set --project or KT2_GKE_PROJECTS, or configure a boskos location")]
    NoProjects,
    /// Leasing projects failed.
    #[error("failed to lease projects: {0}")]
    Broker(#[from] BoskosError),
    /// The cluster layout is inconsistent.
    #[error(transparent)]
    Layout(#[from] LayoutError),
    /// The network could not be prepared.
    #[error("network setup failed: {0}")]
    Network(#[source] ProcessError),
    /// Cluster creation failed.
    #[error(transparent)]
    Create(#[from] OrchestrationError),
    /// Credentials for a cluster could not be fetched.
    #[error("fetching credentials for {cluster} failed: {source}")]
    Kubeconfig {
        /// Cluster name.
        cluster: String,
        /// Underlying process error.
        #[source]
        source: ProcessError,
    },
    /// The run directory could not be created.
    #[error("failed to create {path}: {message}")]
    RunDir {
        /// Directory path.
        path: Utf8PathBuf,
        /// Underlying error text.
        message: String,
    },
    /// Build or staging failed.
    #[error(transparent)]
    Build(#[from] BuildError),
}

/// Broker used to lease projects when none are configured.
#[derive(Clone)]
pub struct ProjectLeasing {
    /// The broker.
    pub broker: Arc<dyn ResourceBroker>,
    /// Resource type to lease.
    pub resource_type: String,
    /// Interval between lease renewals.
    pub heartbeat_interval: Duration,
}

impl std::fmt::Debug for ProjectLeasing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectLeasing")
            .field("resource_type", &self.resource_type)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct DeployState {
    layout: Option<ClusterLayout>,
    network: Option<NetworkState>,
    leased: Vec<String>,
    heartbeat: Option<Heartbeat>,
}

/// [`Deployer`] that creates GKE clusters through `gcloud`.
#[derive(Debug)]
pub struct GkeDeployer<R: ?Sized> {
    gcloud: Gcloud<R>,
    options: Arc<GkeOptions>,
    leasing: Option<ProjectLeasing>,
    instance_groups: InstanceGroupCache,
    cleanup: CleanupQueue,
    state: Mutex<DeployState>,
    /// Attempt whose location holds the clusters: the one in flight, the one
    /// that succeeded, or the one that failed last.
    attempt: AtomicUsize,
}

impl<R> GkeDeployer<R>
where
    R: CommandRunner + ?Sized + 'static,
{
    /// Creates a deployer. Must be called inside a Tokio runtime, which
    /// hosts the background cleanup worker.
    #[must_use]
    pub fn new(runner: Arc<R>, options: GkeOptions) -> Self {
        Self {
            gcloud: Gcloud::new(runner, options.gcloud_bin.clone()),
            options: Arc::new(options),
            leasing: None,
            instance_groups: InstanceGroupCache::new(),
            cleanup: CleanupQueue::spawn(),
            state: Mutex::new(DeployState::default()),
            attempt: AtomicUsize::new(0),
        }
    }

    /// Leases projects from `leasing` when no projects are configured.
    #[must_use]
    pub fn with_leasing(mut self, leasing: ProjectLeasing) -> Self {
        self.leasing = Some(leasing);
        self
    }

    /// Options in use.
    #[must_use]
    pub fn options(&self) -> &GkeOptions {
        &self.options
    }

    fn layout_for(&self, projects: Vec<String>, run_id: &str) -> Result<ClusterLayout, LayoutError> {
        match self.options.clusters {
            ClusterNames::Explicit(ref specs) => ClusterLayout::new(projects, specs),
            ClusterNames::Generated(count) => {
                ClusterLayout::round_robin(projects, &generate_cluster_names(count, run_id))
            }
        }
    }

    async fn projects(&self, state: &mut DeployState) -> Result<Vec<String>, GkeError> {
        if !self.options.projects.is_empty() {
            return Ok(self.options.projects.clone());
        }
        let leasing = self.leasing.as_ref().ok_or(GkeError::NoProjects)?;
        let leased = acquire_many(
            leasing.broker.as_ref(),
            &leasing.resource_type,
            self.options.project_count,
        )
        .await?;
        let names: Vec<String> = leased.into_iter().map(|resource| resource.name).collect();
        state.heartbeat = Some(Heartbeat::start(
            Arc::clone(&leasing.broker),
            names.clone(),
            leasing.heartbeat_interval,
        ));
        state.leased.clone_from(&names);
        Ok(names)
    }

    async fn bring_up(&self, context: &RunContext) -> Result<UpOutcome, GkeError> {
        let mut state = self.state.lock().await;
        let projects = self.projects(&mut state).await?;
        let layout = self.layout_for(projects, &context.run_id)?;
        state.layout = Some(layout.clone());
        info!(
            projects = ?layout.project_names(),
            clusters = layout.targets().len(),
            network = %self.options.network,
            "bringing clusters up"
        );

        let network = NetworkManager::new(&self.gcloud, &layout, &self.options.network)
            .ensure_network()
            .await
            .map_err(GkeError::Network)?;
        state.network = Some(network);

        let outcome = Orchestrator::new(
            &self.gcloud,
            &layout,
            Arc::clone(&self.options),
            &self.options.retry,
            &self.instance_groups,
            &self.cleanup,
        )
        .report_attempts_to(&self.attempt)
        .create_clusters()
        .await;
        drop(state);
        let created = outcome?;

        let kubeconfig = self.fetch_credentials(context, &created).await?;
        Ok(UpOutcome {
            kubeconfig: Some(kubeconfig),
            env: created.env_pairs(),
        })
    }

    /// Writes credentials for every cluster, one at a time, into the run's
    /// kubeconfig.
    async fn fetch_credentials(
        &self,
        context: &RunContext,
        created: &CreatedClusters,
    ) -> Result<Utf8PathBuf, GkeError> {
        Dir::create_ambient_dir_all(&context.run_dir, ambient_authority()).map_err(|err| {
            GkeError::RunDir {
                path: context.run_dir.clone(),
                message: err.to_string(),
            }
        })?;
        let kubeconfig = context.kubeconfig_path();
        for target in &created.targets {
            let spec = self
                .gcloud
                .spec(vec![
                    String::from("container"),
                    String::from("clusters"),
                    String::from("get-credentials"),
                    target.cluster.name.clone(),
                    format!("--project={}", target.project),
                    created.location_arg.clone(),
                ])
                .env("KUBECONFIG", kubeconfig.to_string());
            self.gcloud
                .run_spec(spec)
                .await
                .map_err(|source| GkeError::Kubeconfig {
                    cluster: target.cluster.name.clone(),
                    source,
                })?;
        }
        info!(%kubeconfig, "kubeconfig written");
        Ok(kubeconfig)
    }

    async fn tear_down(&self, context: &RunContext) {
        let mut state = self.state.lock().await;
        let mut summary = CleanupSummary::default();
        for report in self.cleanup.drain().await {
            summary.absorb(report.summary);
        }

        let known = state.layout.clone().or_else(|| {
            self.layout_for(self.options.projects.clone(), &context.run_id)
                .inspect_err(|err| warn!(error = %err, "no cluster layout to tear down"))
                .ok()
        });
        if let Some(layout) = known {
            let network = match state.network.take() {
                Some(network) => network,
                None => self.rebuild_network_state(&layout).await,
            };
            summary.absorb(self.delete_everything(layout, &network).await);
        }

        if let Some(heartbeat) = state.heartbeat.take() {
            heartbeat.stop().await;
        }
        if let Some(ref leasing) = self.leasing {
            for name in std::mem::take(&mut state.leased) {
                if let Err(err) = leasing.broker.release(&name).await {
                    warn!(project = %name, error = %err, "failed to release project");
                }
            }
        }

        if summary.leaked > 0 {
            warn!(
                deleted = summary.clusters_deleted,
                leaked = summary.leaked,
                "down finished; some resources may have leaked"
            );
        } else {
            info!(deleted = summary.clusters_deleted, "down finished");
        }
    }

    async fn delete_everything(&self, layout: ClusterLayout, network: &NetworkState) -> CleanupSummary {
        let attempt = self.attempt.load(Ordering::SeqCst);
        let locations = &self.options.locations;
        let location_arg = locations.location_arg(attempt);
        let region = locations.region(attempt);
        let groups = if is_default_network(&self.options.network) {
            InstanceGroupMap::new()
        } else {
            self.instance_groups
                .get_or_discover(&self.gcloud, &layout.targets(), &location_arg)
                .await
                .unwrap_or_else(|err| {
                    warn!(error = %err, "instance groups unknown; firewall rules left to the network sweep");
                    InstanceGroupMap::new()
                })
        };
        info!(location = %locations.location(attempt), "tearing clusters down");
        Teardown::new(
            self.gcloud.clone(),
            layout,
            self.options.network.clone(),
            self.options.private_cluster.is_some(),
        )
        .full(&location_arg, &region, &groups, network)
        .await
    }

    /// Recovers what Up would have bound for Shared VPC when Down runs in a
    /// separate invocation.
    async fn rebuild_network_state(&self, layout: &ClusterLayout) -> NetworkState {
        if !layout.is_multi_project() || is_default_network(&self.options.network) {
            return NetworkState::default();
        }
        let manager = NetworkManager::new(&self.gcloud, layout, &self.options.network);
        match manager.shared_vpc_plan().await {
            Ok(plan) => NetworkState {
                shared_vpc: Some(plan),
            },
            Err(err) => {
                warn!(error = %err, "could not rebuild shared VPC bindings");
                NetworkState::default()
            }
        }
    }

    async fn build_release(&self, context: &RunContext) -> Result<(), GkeError> {
        let builder = Builder::new(
            self.gcloud.runner(),
            BuildOptions {
                strategy: self.options.build_strategy,
                repo_root: self.options.repo_root.clone(),
                stage_location: self.options.stage_location.clone(),
                gsutil_bin: self.options.gsutil_bin.clone(),
            },
        );
        if let Some(staged) = builder.build(&context.run_id).await? {
            info!(%staged, "release staged");
        }
        Ok(())
    }
}

impl<R> Deployer for GkeDeployer<R>
where
    R: CommandRunner + ?Sized + 'static,
{
    type Error = GkeError;

    fn name(&self) -> &'static str {
        "gke"
    }

    fn build<'a>(&'a self, context: &'a RunContext) -> DeployerFuture<'a, (), Self::Error> {
        Box::pin(async move { self.build_release(context).await })
    }

    fn up<'a>(&'a self, context: &'a RunContext) -> DeployerFuture<'a, UpOutcome, Self::Error> {
        Box::pin(async move { self.bring_up(context).await })
    }

    fn down<'a>(&'a self, context: &'a RunContext) -> DeployerFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.tear_down(context).await;
            Ok(())
        })
    }

    fn existing(&self, context: &RunContext) -> UpOutcome {
        UpOutcome {
            kubeconfig: Some(context.kubeconfig_path()),
            env: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;
    use crate::boskos::{BrokerFuture, Resource};
    use crate::builder::BuildStrategy;
    use crate::gke::args::LATEST_VERSION;
    use crate::location::LocationSet;
    use crate::retry::PatternClassifier;
    use crate::test_support::ScriptedRunner;

    fn options(projects: &[&str]) -> GkeOptions {
        GkeOptions {
            gcloud_bin: String::from("gcloud"),
            gsutil_bin: String::from("gsutil"),
            projects: projects.iter().map(|p| (*p).to_owned()).collect(),
            project_count: 1,
            locations: LocationSet::Zones(vec![String::from("us-west1-b")]),
            clusters: ClusterNames::Generated(2),
            network: String::from("default"),
            num_nodes: 1,
            machine_type: String::from("e2-standard-4"),
            image_type: String::from("cos_containerd"),
            cluster_version: String::from(LATEST_VERSION),
            release_channel: None,
            private_cluster: None,
            extra_node_pools: Vec::new(),
            node_pool_create_concurrency: 1,
            windows_pool: None,
            retry: PatternClassifier::default(),
            build_strategy: BuildStrategy::Make,
            repo_root: Utf8PathBuf::from("."),
            stage_location: None,
        }
    }

    fn context(temp: &TempDir) -> RunContext {
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8");
        RunContext::resolve(Some(String::from("r9")), Some(root.join("_artifacts")), None)
    }

    #[derive(Debug, Default)]
    struct SinglePool {
        released: std::sync::Mutex<Vec<String>>,
    }

    impl ResourceBroker for SinglePool {
        fn acquire<'a>(&'a self, resource_type: &'a str) -> BrokerFuture<'a, Resource> {
            Box::pin(async move {
                Ok(Resource {
                    name: String::from("leased-proj"),
                    resource_type: resource_type.to_owned(),
                    state: String::from("busy"),
                })
            })
        }

        fn heartbeat<'a>(&'a self, _name: &'a str) -> BrokerFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn release<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()> {
            Box::pin(async move {
                self.released.lock().expect("lock").push(name.to_owned());
                Ok(())
            })
        }
    }

    #[rstest]
    #[tokio::test]
    async fn up_fetches_credentials_into_run_dir() {
        let temp = TempDir::new().expect("tempdir");
        let context = context(&temp);
        let runner = Arc::new(ScriptedRunner::permissive());
        let deployer = GkeDeployer::new(Arc::clone(&runner), options(&["proj"]));

        let outcome = deployer.up(&context).await.expect("up");

        let kubeconfig = context.kubeconfig_path();
        assert_eq!(outcome.kubeconfig.as_ref(), Some(&kubeconfig));
        let fetches = runner.invocations_matching(&["get-credentials"]);
        assert_eq!(fetches.len(), 2);
        assert!(
            fetches
                .iter()
                .all(|call| call.env_value("KUBECONFIG") == Some(kubeconfig.as_str()))
        );
        assert!(
            outcome
                .env
                .contains(&(String::from("GKE_CLUSTER_NAMES"), String::from("kt2-r9-1,kt2-r9-2")))
        );
    }

    #[rstest]
    #[tokio::test]
    async fn missing_projects_without_broker_is_an_error() {
        let temp = TempDir::new().expect("tempdir");
        let deployer = GkeDeployer::new(Arc::new(ScriptedRunner::permissive()), options(&[]));

        let err = deployer.up(&context(&temp)).await.expect_err("no projects");

        assert!(matches!(err, GkeError::NoProjects));
    }

    #[rstest]
    #[tokio::test]
    async fn leased_projects_are_released_on_down() {
        let temp = TempDir::new().expect("tempdir");
        let context = context(&temp);
        let broker = Arc::new(SinglePool::default());
        let runner = Arc::new(ScriptedRunner::permissive());
        let deployer = GkeDeployer::new(Arc::clone(&runner), options(&[])).with_leasing(
            ProjectLeasing {
                broker: Arc::clone(&broker) as Arc<dyn ResourceBroker>,
                resource_type: String::from("gke-project"),
                heartbeat_interval: Duration::from_secs(300),
            },
        );

        deployer.up(&context).await.expect("up");
        deployer.down(&context).await.expect("down");

        assert_eq!(
            runner.count_matching(&["clusters create", "--project=leased-proj"]),
            2
        );
        assert_eq!(
            *broker.released.lock().expect("lock"),
            vec![String::from("leased-proj")]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn standalone_down_derives_clusters_from_run_id() {
        let temp = TempDir::new().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::permissive());
        let deployer = GkeDeployer::new(Arc::clone(&runner), options(&["proj"]));

        deployer.down(&context(&temp)).await.expect("down never fails");

        for name in ["kt2-r9-1", "kt2-r9-2"] {
            let delete = format!("clusters delete {name}");
            assert_eq!(
                runner.count_matching(&[delete.as_str(), "--zone=us-west1-b"]),
                1
            );
        }
    }

    #[rstest]
    #[tokio::test]
    async fn down_tolerates_failed_deletions() {
        let temp = TempDir::new().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::permissive());
        runner.on_command(&["clusters delete"], Some(1), "", "backend error");
        let deployer = GkeDeployer::new(Arc::clone(&runner), options(&["proj"]));

        deployer
            .down(&context(&temp))
            .await
            .expect("best-effort teardown succeeds");
    }

    #[rstest]
    #[tokio::test]
    async fn build_runs_in_repo_root() {
        let temp = TempDir::new().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::permissive());
        let deployer = GkeDeployer::new(Arc::clone(&runner), options(&["proj"]));

        deployer.build(&context(&temp)).await.expect("build");

        assert_eq!(runner.count_matching(&["make quick-release"]), 1);
    }
}
