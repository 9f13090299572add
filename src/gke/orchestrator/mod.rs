//! Concurrent cluster creation with location failover.
//!
//! Each attempt creates every (project, cluster) pair in one location. The
//! first failure cancels siblings that have not finished; processes already
//! running are left to complete on their own. A retryable failure queues
//! cleanup for the attempt and moves on to the next location at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::args::{
    CreateClusterArgs, SharedSubnet, WINDOWS_POOL_NAME, extra_node_pool_args,
    windows_node_pool_args,
};
use super::cleanup::{CleanupQueue, Teardown};
use super::gcloud::Gcloud;
use super::instance_groups::{InstanceGroupCache, InstanceGroupError, InstanceGroupMap};
use super::layout::{ClusterLayout, ClusterTarget};
use super::network::{NetworkManager, is_default_network, network_reference, shared_subnet};
use crate::config::GkeOptions;
use crate::location::LocationSet;
use crate::process::{CommandRunner, ProcessError};
use crate::retry::RetryClassifier;

/// Port range opened for NodePort e2e tests.
pub const E2E_PORT_RANGE: &str = "30000-32767";

/// A failure inside one creation attempt.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CreationError {
    /// Subnet or NAT setup for the attempt failed.
    #[error("network setup in {region} failed: {source}")]
    Network {
        /// Region being prepared.
        region: String,
        /// Underlying process error.
        #[source]
        source: ProcessError,
    },
    /// `clusters create` failed.
    #[error("creating cluster {cluster} in {project} failed: {source}")]
    Cluster {
        /// Project of the cluster.
        project: String,
        /// Cluster name.
        cluster: String,
        /// Underlying process error.
        #[source]
        source: ProcessError,
    },
    /// A node pool could not be added to a created cluster.
    #[error("creating node pool {pool} on {cluster} failed: {source}")]
    NodePool {
        /// Cluster name.
        cluster: String,
        /// Pool name.
        pool: String,
        /// Underlying process error.
        #[source]
        source: ProcessError,
    },
    /// Instance groups could not be discovered.
    #[error(transparent)]
    InstanceGroups(#[from] InstanceGroupError),
    /// An e2e firewall rule could not be created.
    #[error("creating firewall rule {rule} failed: {source}")]
    Firewall {
        /// Rule name.
        rule: String,
        /// Underlying process error.
        #[source]
        source: ProcessError,
    },
    /// A creation task ended without reporting.
    #[error("creation task failed: {0}")]
    Task(String),
    /// The attempt was cancelled because a sibling failed.
    #[error("cancelled after a sibling creation failed")]
    Cancelled,
}

/// Errors that end cluster creation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum OrchestrationError {
    /// An attempt failed and no retry is possible.
    #[error("cluster creation failed on attempt {attempt} at {location}: {source}")]
    Failed {
        /// Zero-based attempt that failed.
        attempt: usize,
        /// Location of the attempt.
        location: String,
        /// What failed.
        #[source]
        source: CreationError,
    },
    /// No location was available to try.
    #[error("no locations to create clusters in")]
    NoLocations,
}

/// Clusters that came up, and where.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreatedClusters {
    /// Zero-based attempt that succeeded.
    pub attempt: usize,
    /// Bare region or zone name.
    pub location: String,
    /// `--region=` or `--zone=` argument used.
    pub location_arg: String,
    /// Region the clusters live in.
    pub region: String,
    /// Every created (project, cluster) pair.
    pub targets: Vec<ClusterTarget>,
}

impl CreatedClusters {
    /// Variables that identify the clusters to test runners:
    /// `GKE_CLUSTER_PROJECTS`, `GKE_CLUSTER_NAMES`, `GKE_CLUSTER_LOCATIONS`,
    /// each a comma-separated list aligned by position.
    #[must_use]
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        let projects: Vec<&str> = self
            .targets
            .iter()
            .map(|target| target.project.as_str())
            .collect();
        let names: Vec<&str> = self
            .targets
            .iter()
            .map(|target| target.cluster.name.as_str())
            .collect();
        let locations = vec![self.location.as_str(); self.targets.len()];
        vec![
            (String::from("GKE_CLUSTER_PROJECTS"), projects.join(",")),
            (String::from("GKE_CLUSTER_NAMES"), names.join(",")),
            (String::from("GKE_CLUSTER_LOCATIONS"), locations.join(",")),
        ]
    }
}

/// Drives creation attempts for one layout.
#[derive(Debug)]
pub struct Orchestrator<'a, R: ?Sized> {
    gcloud: &'a Gcloud<R>,
    layout: &'a ClusterLayout,
    options: Arc<GkeOptions>,
    classifier: &'a dyn RetryClassifier,
    instance_groups: &'a InstanceGroupCache,
    cleanup: &'a CleanupQueue,
    progress: Option<&'a AtomicUsize>,
}

impl<'a, R> Orchestrator<'a, R>
where
    R: CommandRunner + ?Sized + 'static,
{
    /// Creates an orchestrator. The network must already exist.
    #[must_use]
    pub fn new(
        gcloud: &'a Gcloud<R>,
        layout: &'a ClusterLayout,
        options: Arc<GkeOptions>,
        classifier: &'a dyn RetryClassifier,
        instance_groups: &'a InstanceGroupCache,
        cleanup: &'a CleanupQueue,
    ) -> Self {
        Self {
            gcloud,
            layout,
            options,
            classifier,
            instance_groups,
            cleanup,
            progress: None,
        }
    }

    /// Stores each attempt index in `progress` before its clusters are
    /// created, so a caller interrupted mid-attempt knows where they live.
    #[must_use]
    pub const fn report_attempts_to(mut self, progress: &'a AtomicUsize) -> Self {
        self.progress = Some(progress);
        self
    }

    fn locations(&self) -> &LocationSet {
        &self.options.locations
    }

    /// Runs attempts until one succeeds, a failure is not retryable, or the
    /// locations run out.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestrationError::Failed`] carrying the last attempt's
    /// error.
    pub async fn create_clusters(&self) -> Result<CreatedClusters, OrchestrationError> {
        let total = self.locations().total_try_count();
        for attempt in 0..total {
            let location_arg = self.locations().location_arg(attempt);
            let location = self.locations().location(attempt);
            let region = self.locations().region(attempt);
            if let Some(progress) = self.progress {
                progress.store(attempt, Ordering::SeqCst);
            }
            info!(attempt, %location, "creating clusters");

            let outcome = self.run_attempt(&location_arg, &region).await;
            let Err(err) = outcome else {
                info!(attempt, %location, clusters = self.layout.targets().len(), "clusters created");
                return Ok(CreatedClusters {
                    attempt,
                    location,
                    location_arg,
                    region,
                    targets: self.layout.targets(),
                });
            };

            if attempt + 1 < total && self.classifier.is_retryable(&err) {
                warn!(attempt, %location, error = %err, "retryable creation failure, trying next location");
                self.queue_cleanup(attempt, location_arg, region).await;
                continue;
            }
            return Err(OrchestrationError::Failed {
                attempt,
                location,
                source: err,
            });
        }
        Err(OrchestrationError::NoLocations)
    }

    async fn queue_cleanup(&self, attempt: usize, location_arg: String, region: String) {
        let groups = self.instance_groups.cached().await.unwrap_or_default();
        self.instance_groups.reset().await;
        let teardown = Teardown::new(
            self.gcloud.clone(),
            self.layout.clone(),
            self.options.network.clone(),
            self.options.private_cluster.is_some(),
        );
        self.cleanup.submit(
            format!("attempt {attempt} at {location_arg}"),
            async move { teardown.attempt(&location_arg, &region, &groups).await },
        );
    }

    async fn run_attempt(&self, location_arg: &str, region: &str) -> Result<(), CreationError> {
        let network = NetworkManager::new(self.gcloud, self.layout, &self.options.network);
        let network_error = |source| CreationError::Network {
            region: region.to_owned(),
            source,
        };
        network.ensure_subnets(region).await.map_err(network_error)?;
        if self.options.private_cluster.is_some() {
            network.ensure_nat(region).await.map_err(network_error)?;
        }

        self.fan_out(location_arg, region).await?;

        let groups = self
            .instance_groups
            .get_or_discover(self.gcloud, &self.layout.targets(), location_arg)
            .await?;
        self.ensure_firewall_rules(&groups).await
    }

    async fn fan_out(&self, location_arg: &str, region: &str) -> Result<(), CreationError> {
        let token = CancellationToken::new();
        let network_ref = network_reference(self.layout, &self.options.network);
        let mut tasks = JoinSet::new();

        for project in self.layout.projects() {
            let subnet = shared_subnet(self.layout, &self.options.network, region, project);
            for cluster in &project.clusters {
                let job = ClusterJob {
                    gcloud: self.gcloud.clone(),
                    options: Arc::clone(&self.options),
                    target: ClusterTarget {
                        project: project.project.clone(),
                        project_index: project.index,
                        cluster: cluster.clone(),
                    },
                    location_arg: location_arg.to_owned(),
                    network: network_ref.clone(),
                    subnet: subnet.clone(),
                };
                let cancelled = token.child_token();
                tasks.spawn(async move {
                    tokio::select! {
                        () = cancelled.cancelled() => Err(CreationError::Cancelled),
                        result = job.run() => result,
                    }
                });
            }
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|err| Err(CreationError::Task(err.to_string())));
            match result {
                Ok(()) | Err(CreationError::Cancelled) => {}
                Err(err) => {
                    if first_error.is_none() {
                        token.cancel();
                        first_error = Some(err);
                    }
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn ensure_firewall_rules(&self, groups: &InstanceGroupMap) -> Result<(), CreationError> {
        if is_default_network(&self.options.network) {
            return Ok(());
        }
        let host = self.layout.host_project();
        for (target, cluster_groups) in groups {
            for group in cluster_groups {
                let rule = group.firewall_rule_name();
                let describe = vec![
                    String::from("compute"),
                    String::from("firewall-rules"),
                    String::from("describe"),
                    rule.clone(),
                    format!("--project={host}"),
                ];
                let firewall_error = |source| CreationError::Firewall {
                    rule: rule.clone(),
                    source,
                };
                if self.gcloud.exists(describe).await.map_err(firewall_error)? {
                    continue;
                }
                info!(%rule, cluster = %target.cluster.name, "opening e2e node ports");
                self.gcloud
                    .run(vec![
                        String::from("compute"),
                        String::from("firewall-rules"),
                        String::from("create"),
                        rule.clone(),
                        format!("--project={host}"),
                        format!("--network={}", self.options.network),
                        format!("--allow=tcp:{E2E_PORT_RANGE},udp:{E2E_PORT_RANGE}"),
                        format!("--target-tags={}", group.node_tag(&target.cluster.name)),
                    ])
                    .await
                    .map_err(firewall_error)?;
            }
        }
        Ok(())
    }
}

/// Everything one cluster's creation task owns.
struct ClusterJob<R: ?Sized> {
    gcloud: Gcloud<R>,
    options: Arc<GkeOptions>,
    target: ClusterTarget,
    location_arg: String,
    network: String,
    subnet: Option<SharedSubnet>,
}

impl<R> ClusterJob<R>
where
    R: CommandRunner + ?Sized + 'static,
{
    async fn run(self) -> Result<(), CreationError> {
        let args = CreateClusterArgs {
            target: &self.target,
            location_arg: &self.location_arg,
            network: &self.network,
            subnetwork: self.subnet.as_ref(),
            num_nodes: self.options.num_nodes,
            machine_type: &self.options.machine_type,
            image_type: &self.options.image_type,
            cluster_version: &self.options.cluster_version,
            release_channel: self.options.release_channel.as_deref(),
            private_cluster: self.options.private_cluster.as_ref(),
        }
        .render();
        info!(project = %self.target.project, cluster = %self.target.cluster.name, "creating cluster");
        self.gcloud
            .run(args)
            .await
            .map_err(|source| CreationError::Cluster {
                project: self.target.project.clone(),
                cluster: self.target.cluster.name.clone(),
                source,
            })?;

        if let Some(ref windows) = self.options.windows_pool {
            let pool_args = windows_node_pool_args(&self.target, &self.location_arg, windows);
            self.gcloud
                .run(pool_args)
                .await
                .map_err(|source| CreationError::NodePool {
                    cluster: self.target.cluster.name.clone(),
                    pool: String::from(WINDOWS_POOL_NAME),
                    source,
                })?;
        }

        self.create_extra_pools().await
    }

    async fn create_extra_pools(&self) -> Result<(), CreationError> {
        if self.options.extra_node_pools.is_empty() {
            return Ok(());
        }
        let permits = Arc::new(Semaphore::new(self.options.node_pool_create_concurrency));
        let mut tasks = JoinSet::new();
        for pool in &self.options.extra_node_pools {
            let args = extra_node_pool_args(&self.target, &self.location_arg, pool);
            let gcloud = self.gcloud.clone();
            let permits = Arc::clone(&permits);
            let cluster = self.target.cluster.name.clone();
            let name = pool.name.clone();
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|err| CreationError::Task(err.to_string()))?;
                info!(%cluster, pool = %name, "creating node pool");
                gcloud
                    .run(args)
                    .await
                    .map(|_| ())
                    .map_err(|source| CreationError::NodePool {
                        cluster,
                        pool: name,
                        source,
                    })
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|err| Err(CreationError::Task(err.to_string())));
            if let Err(err) = result {
                warn!(cluster = %self.target.cluster.name, error = %err, "node pool creation failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
