//! Best-effort teardown of clusters and the resources around them.
//!
//! Deletion never aborts on the first failure. Each failed deletion is
//! logged at `warn` and counted as leaked; callers report the totals.
//! [`CleanupQueue`] runs teardown jobs detached from the creation loop so a
//! retry does not wait on the previous attempt's cleanup.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::gcloud::Gcloud;
use super::instance_groups::InstanceGroupMap;
use super::layout::{ClusterLayout, ClusterTarget};
use super::network::{NetworkManager, NetworkState, is_default_network};
use crate::process::{CommandRunner, ProcessError};

/// Counts from one cleanup pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CleanupSummary {
    /// Clusters confirmed deleted.
    pub clusters_deleted: usize,
    /// Resources that could not be verified as deleted.
    pub leaked: usize,
}

impl CleanupSummary {
    /// Adds `other` to this summary.
    pub const fn absorb(&mut self, other: Self) {
        self.clusters_deleted += other.clusters_deleted;
        self.leaked += other.leaked;
    }
}

/// Outcome of one background cleanup job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CleanupReport {
    /// Label the job was submitted with.
    pub label: String,
    /// Counts from the job.
    pub summary: CleanupSummary,
}

fn is_not_found(err: &ProcessError) -> bool {
    let text = err.to_string();
    text.contains("NOT_FOUND") || text.to_ascii_lowercase().contains("not found")
}

/// Owned teardown plan for one layout, cheap to move into background jobs.
#[derive(Debug)]
pub struct Teardown<R: ?Sized> {
    gcloud: Gcloud<R>,
    layout: ClusterLayout,
    network: String,
    private: bool,
}

impl<R: ?Sized> Clone for Teardown<R> {
    fn clone(&self) -> Self {
        Self {
            gcloud: self.gcloud.clone(),
            layout: self.layout.clone(),
            network: self.network.clone(),
            private: self.private,
        }
    }
}

impl<R> Teardown<R>
where
    R: CommandRunner + ?Sized + 'static,
{
    /// Creates a plan for `layout` on `network`; `private` adds the NAT
    /// router to regional teardown.
    #[must_use]
    pub fn new(gcloud: Gcloud<R>, layout: ClusterLayout, network: impl Into<String>, private: bool) -> Self {
        Self {
            gcloud,
            layout,
            network: network.into(),
            private,
        }
    }

    fn network_manager(&self) -> NetworkManager<'_, R> {
        NetworkManager::new(&self.gcloud, &self.layout, &self.network)
    }

    /// Deletes every cluster concurrently, each followed by its e2e firewall
    /// rules.
    pub async fn delete_clusters(&self, location_arg: &str, groups: &InstanceGroupMap) -> CleanupSummary {
        let firewall_project = (!is_default_network(&self.network))
            .then(|| self.layout.host_project().to_owned());
        let mut tasks = JoinSet::new();
        for target in self.layout.targets() {
            let rules = groups
                .get(&target)
                .map(|found| found.iter().map(|group| group.firewall_rule_name()).collect())
                .unwrap_or_default();
            tasks.spawn(delete_cluster(
                self.gcloud.clone(),
                target,
                location_arg.to_owned(),
                rules,
                firewall_project.clone(),
            ));
        }

        let mut summary = CleanupSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => summary.absorb(result),
                Err(err) => {
                    warn!(error = %err, "cluster deletion task failed");
                    summary.leaked += 1;
                }
            }
        }
        summary
    }

    /// Tears down what one creation attempt left in `region`: its clusters,
    /// then the region's subnets and NAT.
    pub async fn attempt(&self, location_arg: &str, region: &str, groups: &InstanceGroupMap) -> CleanupSummary {
        let mut summary = self.delete_clusters(location_arg, groups).await;
        summary.leaked += self
            .network_manager()
            .teardown_region(region, self.private)
            .await;
        summary
    }

    /// Full Down: the attempt's resources, then, once every cluster is
    /// gone, leaked firewall rules, Shared VPC wiring, and the network.
    pub async fn full(
        &self,
        location_arg: &str,
        region: &str,
        groups: &InstanceGroupMap,
        state: &NetworkState,
    ) -> CleanupSummary {
        let mut summary = self.attempt(location_arg, region, groups).await;
        summary.leaked += self.network_manager().teardown_network(state).await;
        summary
    }
}

async fn delete_cluster<R>(
    gcloud: Gcloud<R>,
    target: ClusterTarget,
    location_arg: String,
    rules: Vec<String>,
    firewall_project: Option<String>,
) -> CleanupSummary
where
    R: CommandRunner + ?Sized + 'static,
{
    let mut summary = CleanupSummary::default();
    let name = &target.cluster.name;
    info!(project = %target.project, cluster = %name, "deleting cluster");
    let deleted = gcloud
        .run(vec![
            String::from("container"),
            String::from("clusters"),
            String::from("delete"),
            name.clone(),
            format!("--project={}", target.project),
            location_arg,
            String::from("--quiet"),
        ])
        .await;
    match deleted {
        Ok(_) => summary.clusters_deleted += 1,
        Err(ref err) if is_not_found(err) => {
            debug!(project = %target.project, cluster = %name, "cluster already gone");
        }
        Err(err) => {
            warn!(project = %target.project, cluster = %name, error = %err, "failed to delete cluster");
            summary.leaked += 1;
        }
    }

    let Some(project) = firewall_project else {
        return summary;
    };
    for rule in rules {
        let result = gcloud
            .run(vec![
                String::from("compute"),
                String::from("firewall-rules"),
                String::from("delete"),
                rule.clone(),
                format!("--project={project}"),
                String::from("--quiet"),
            ])
            .await;
        match result {
            Ok(_) => {}
            Err(ref err) if is_not_found(err) => {}
            Err(err) => {
                warn!(%rule, cluster = %name, error = %err, "failed to delete firewall rule");
                summary.leaked += 1;
            }
        }
    }
    summary
}

/// A boxed cleanup job.
pub type CleanupJob = Pin<Box<dyn Future<Output = CleanupSummary> + Send + 'static>>;

enum CleanupMessage {
    Run { label: String, job: CleanupJob },
    Drain(oneshot::Sender<Vec<CleanupReport>>),
}

/// Work queue for detached cleanup jobs.
///
/// Jobs run one at a time on a worker task, outside any creation fan-out,
/// so they are not cancelled when a sibling creation fails. [`drain`]
/// waits for everything submitted so far.
///
/// [`drain`]: CleanupQueue::drain
#[derive(Clone, Debug)]
pub struct CleanupQueue {
    sender: mpsc::UnboundedSender<CleanupMessage>,
}

impl std::fmt::Debug for CleanupMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Run { label, .. } => f.debug_struct("Run").field("label", label).finish(),
            Self::Drain(_) => f.write_str("Drain"),
        }
    }
}

impl CleanupQueue {
    /// Starts the worker on the current runtime.
    #[must_use]
    pub fn spawn() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(receiver));
        Self { sender }
    }

    /// Queues `job` without waiting for it.
    pub fn submit<F>(&self, label: impl Into<String>, job: F)
    where
        F: Future<Output = CleanupSummary> + Send + 'static,
    {
        let label = label.into();
        info!(%label, "queued background cleanup");
        if self
            .sender
            .send(CleanupMessage::Run {
                label,
                job: Box::pin(job),
            })
            .is_err()
        {
            warn!("cleanup worker has stopped; job dropped");
        }
    }

    /// Waits for every job submitted so far and returns their reports.
    pub async fn drain(&self) -> Vec<CleanupReport> {
        let (reply, receive) = oneshot::channel();
        if self.sender.send(CleanupMessage::Drain(reply)).is_err() {
            return Vec::new();
        }
        receive.await.unwrap_or_default()
    }
}

async fn run_worker(mut receiver: mpsc::UnboundedReceiver<CleanupMessage>) {
    let mut reports = Vec::new();
    while let Some(message) = receiver.recv().await {
        match message {
            CleanupMessage::Run { label, job } => {
                let summary = job.await;
                if summary.leaked > 0 {
                    warn!(%label, leaked = summary.leaked, "background cleanup left resources behind");
                } else {
                    info!(%label, deleted = summary.clusters_deleted, "background cleanup finished");
                }
                reports.push(CleanupReport { label, summary });
            }
            CleanupMessage::Drain(reply) => {
                if reply.send(std::mem::take(&mut reports)).is_err() {
                    debug!("cleanup drain requester went away");
                }
            }
        }
    }
}
