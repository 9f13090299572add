//! Network, Shared VPC, subnet, and Cloud NAT setup and teardown.
//!
//! The implicit `default` network is never created, modified, or deleted.
//! A single-project run on a custom network gets an auto-mode network. A
//! multi-project run gets a custom-mode network in the host project (the
//! first project), shared with every service project, plus one subnet per
//! service project in each attempted region.

use tracing::{info, warn};

use super::args::SharedSubnet;
use super::gcloud::Gcloud;
use super::layout::{ClusterLayout, ProjectClusters};
use crate::process::{CommandRunner, ProcessError};

/// Name of the network every project already has.
pub const DEFAULT_NETWORK: &str = "default";

const NETWORK_USER_ROLE: &str = "roles/compute.networkUser";
const HOST_AGENT_ROLE: &str = "roles/container.hostServiceAgentUser";

/// Whether `network` is the provider's implicit default network.
#[must_use]
pub fn is_default_network(network: &str) -> bool {
    network == DEFAULT_NETWORK
}

/// Network reference passed to `clusters create`; fully qualified when the
/// network lives in another project.
#[must_use]
pub fn network_reference(layout: &ClusterLayout, network: &str) -> String {
    if layout.is_multi_project() && !is_default_network(network) {
        format!(
            "projects/{}/global/networks/{network}",
            layout.host_project()
        )
    } else {
        network.to_owned()
    }
}

/// Subnet name for service project `index`.
#[must_use]
pub fn subnet_name(network: &str, index: usize) -> String {
    format!("{network}-svc-{index}")
}

/// Subnet placement for clusters of `project`; `None` for the host project
/// and for single-project layouts.
#[must_use]
pub fn shared_subnet(
    layout: &ClusterLayout,
    network: &str,
    region: &str,
    project: &ProjectClusters,
) -> Option<SharedSubnet> {
    if !layout.is_multi_project() || project.index == 0 || is_default_network(network) {
        return None;
    }
    let name = subnet_name(network, project.index);
    Some(SharedSubnet {
        path: format!(
            "projects/{}/regions/{region}/subnetworks/{name}",
            layout.host_project()
        ),
        pods_range: format!("{name}-pods"),
        services_range: format!("{name}-services"),
    })
}

/// Cloud Router name for `region`.
#[must_use]
pub fn nat_router_name(network: &str, region: &str) -> String {
    format!("{network}-{region}-nat-router")
}

/// Cloud NAT configuration name for `region`.
#[must_use]
pub fn nat_config_name(network: &str, region: &str) -> String {
    format!("{network}-{region}-nat-config")
}

/// Service accounts in the host project's IAM policy that this run bound.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SharedVpcBindings {
    /// `(member, role)` pairs added to the host project.
    pub bindings: Vec<(String, String)>,
    /// Service projects associated with the host.
    pub associated: Vec<String>,
}

/// Network state created during Up and undone during Down.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NetworkState {
    /// Shared VPC associations and IAM bindings added by this run.
    pub shared_vpc: Option<SharedVpcBindings>,
}

/// Network operations against one layout.
#[derive(Debug)]
pub struct NetworkManager<'a, R: ?Sized> {
    gcloud: &'a Gcloud<R>,
    layout: &'a ClusterLayout,
    network: &'a str,
}

impl<'a, R> NetworkManager<'a, R>
where
    R: CommandRunner + ?Sized + 'static,
{
    /// Creates a manager for `network` in `layout`.
    #[must_use]
    pub const fn new(gcloud: &'a Gcloud<R>, layout: &'a ClusterLayout, network: &'a str) -> Self {
        Self {
            gcloud,
            layout,
            network,
        }
    }

    /// Creates the network (and Shared VPC wiring) when needed.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] when a creation command fails.
    pub async fn ensure_network(&self) -> Result<NetworkState, ProcessError> {
        let mut state = NetworkState::default();
        if is_default_network(self.network) {
            return Ok(state);
        }

        let host = self.layout.host_project();
        let describe = vec![
            String::from("compute"),
            String::from("networks"),
            String::from("describe"),
            self.network.to_owned(),
            format!("--project={host}"),
        ];
        if self.gcloud.exists(describe).await? {
            info!(network = %self.network, project = %host, "reusing existing network");
        } else {
            let mode = if self.layout.is_multi_project() {
                "custom"
            } else {
                "auto"
            };
            info!(network = %self.network, project = %host, mode, "creating network");
            self.gcloud
                .run(vec![
                    String::from("compute"),
                    String::from("networks"),
                    String::from("create"),
                    self.network.to_owned(),
                    format!("--project={host}"),
                    format!("--subnet-mode={mode}"),
                    String::from("--quiet"),
                ])
                .await?;
        }

        if self.layout.is_multi_project() {
            state.shared_vpc = Some(self.enable_shared_vpc().await?);
        }
        Ok(state)
    }

    /// Service project associations and IAM bindings a Shared VPC layout
    /// needs. Down uses this to rebuild what to undo when Up ran in another
    /// process.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] when a project number cannot be looked up.
    pub async fn shared_vpc_plan(&self) -> Result<SharedVpcBindings, ProcessError> {
        let mut plan = SharedVpcBindings::default();
        for service in self.layout.service_projects() {
            let number = self.project_number(&service.project).await?;
            let robot = format!(
                "serviceAccount:service-{number}@container-engine-robot.iam.gserviceaccount.com"
            );
            let services = format!("serviceAccount:{number}@cloudservices.gserviceaccount.com");
            plan.associated.push(service.project.clone());
            plan.bindings.extend([
                (robot.clone(), NETWORK_USER_ROLE.to_owned()),
                (services, NETWORK_USER_ROLE.to_owned()),
                (robot, HOST_AGENT_ROLE.to_owned()),
            ]);
        }
        Ok(plan)
    }

    async fn enable_shared_vpc(&self) -> Result<SharedVpcBindings, ProcessError> {
        let host = self.layout.host_project();
        let plan = self.shared_vpc_plan().await?;
        info!(project = %host, services = plan.associated.len(), "enabling shared VPC host");
        self.gcloud
            .run(vec![
                String::from("compute"),
                String::from("shared-vpc"),
                String::from("enable"),
                host.to_owned(),
            ])
            .await?;

        for service in &plan.associated {
            self.gcloud
                .run(vec![
                    String::from("compute"),
                    String::from("shared-vpc"),
                    String::from("associated-projects"),
                    String::from("add"),
                    service.clone(),
                    format!("--host-project={host}"),
                ])
                .await?;
        }
        for (member, role) in &plan.bindings {
            self.iam_binding("add-iam-policy-binding", member, role)
                .await?;
        }
        Ok(plan)
    }

    async fn project_number(&self, project: &str) -> Result<String, ProcessError> {
        let output = self
            .gcloud
            .run(vec![
                String::from("projects"),
                String::from("describe"),
                project.to_owned(),
                String::from("--format=value(projectNumber)"),
            ])
            .await?;
        Ok(output.stdout.trim().to_owned())
    }

    async fn iam_binding(&self, verb: &str, member: &str, role: &str) -> Result<(), ProcessError> {
        self.gcloud
            .run(vec![
                String::from("projects"),
                verb.to_owned(),
                self.layout.host_project().to_owned(),
                format!("--member={member}"),
                format!("--role={role}"),
                String::from("--condition=None"),
                String::from("--quiet"),
            ])
            .await
            .map(|_| ())
    }

    /// Creates any missing service-project subnets in `region`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] when a creation command fails.
    pub async fn ensure_subnets(&self, region: &str) -> Result<(), ProcessError> {
        if !self.layout.is_multi_project() || is_default_network(self.network) {
            return Ok(());
        }
        let host = self.layout.host_project();
        for service in self.layout.service_projects() {
            let name = subnet_name(self.network, service.index);
            let describe = vec![
                String::from("compute"),
                String::from("networks"),
                String::from("subnets"),
                String::from("describe"),
                name.clone(),
                format!("--project={host}"),
                format!("--region={region}"),
            ];
            if self.gcloud.exists(describe).await? {
                continue;
            }
            info!(subnet = %name, %region, "creating subnet");
            self.gcloud
                .run(vec![
                    String::from("compute"),
                    String::from("networks"),
                    String::from("subnets"),
                    String::from("create"),
                    name.clone(),
                    format!("--project={host}"),
                    format!("--region={region}"),
                    format!("--network={}", self.network),
                    format!("--range=10.{}.0.0/20", service.index),
                    format!(
                        "--secondary-range={name}-pods=10.{}.0.0/16,{name}-services=10.{}.0.0/20",
                        service.index + 100,
                        service.index + 200
                    ),
                    String::from("--quiet"),
                ])
                .await?;
        }
        Ok(())
    }

    /// Creates a Cloud Router and NAT in `region` so private nodes can reach
    /// the internet.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] when a creation command fails.
    pub async fn ensure_nat(&self, region: &str) -> Result<(), ProcessError> {
        if is_default_network(self.network) {
            return Ok(());
        }
        let host = self.layout.host_project();
        let router = nat_router_name(self.network, region);
        let describe = vec![
            String::from("compute"),
            String::from("routers"),
            String::from("describe"),
            router.clone(),
            format!("--project={host}"),
            format!("--region={region}"),
        ];
        if self.gcloud.exists(describe).await? {
            return Ok(());
        }
        info!(%router, %region, "creating cloud NAT");
        self.gcloud
            .run(vec![
                String::from("compute"),
                String::from("routers"),
                String::from("create"),
                router.clone(),
                format!("--project={host}"),
                format!("--region={region}"),
                format!("--network={}", self.network),
            ])
            .await?;
        self.gcloud
            .run(vec![
                String::from("compute"),
                String::from("routers"),
                String::from("nats"),
                String::from("create"),
                nat_config_name(self.network, region),
                format!("--router={router}"),
                format!("--project={host}"),
                format!("--region={region}"),
                String::from("--auto-allocate-nat-external-ips"),
                String::from("--nat-all-subnet-ip-ranges"),
            ])
            .await
            .map(|_| ())
    }

    /// Deletes the subnets and NAT router this run uses in `region`.
    /// Failures are logged; the number of leaked resources is returned.
    pub async fn teardown_region(&self, region: &str, private: bool) -> usize {
        if is_default_network(self.network) {
            return 0;
        }
        let host = self.layout.host_project();
        let mut leaked = 0;

        if private {
            let router = nat_router_name(self.network, region);
            let args = vec![
                String::from("compute"),
                String::from("routers"),
                String::from("delete"),
                router.clone(),
                format!("--project={host}"),
                format!("--region={region}"),
                String::from("--quiet"),
            ];
            if let Err(err) = self.gcloud.run(args).await {
                warn!(%router, error = %err, "failed to delete NAT router");
                leaked += 1;
            }
        }

        if self.layout.is_multi_project() {
            for service in self.layout.service_projects() {
                let name = subnet_name(self.network, service.index);
                let args = vec![
                    String::from("compute"),
                    String::from("networks"),
                    String::from("subnets"),
                    String::from("delete"),
                    name.clone(),
                    format!("--project={host}"),
                    format!("--region={region}"),
                    String::from("--quiet"),
                ];
                if let Err(err) = self.gcloud.run(args).await {
                    warn!(subnet = %name, error = %err, "failed to delete subnet");
                    leaked += 1;
                }
            }
        }
        leaked
    }

    /// Deletes every firewall rule still attached to the network, which
    /// would otherwise block its deletion. Returns the number left behind.
    pub async fn delete_network_firewall_rules(&self) -> usize {
        if is_default_network(self.network) {
            return 0;
        }
        let host = self.layout.host_project();
        let listed = self
            .gcloud
            .run(vec![
                String::from("compute"),
                String::from("firewall-rules"),
                String::from("list"),
                format!("--project={host}"),
                format!("--filter=network:{}", self.network),
                String::from("--format=value(name)"),
            ])
            .await;
        let rules = match listed {
            Ok(output) => output.stdout_lines(),
            Err(err) => {
                warn!(network = %self.network, error = %err, "failed to list firewall rules");
                return 1;
            }
        };

        let mut leaked = 0;
        for rule in rules {
            info!(%rule, network = %self.network, "deleting leaked firewall rule");
            let args = vec![
                String::from("compute"),
                String::from("firewall-rules"),
                String::from("delete"),
                rule.clone(),
                format!("--project={host}"),
                String::from("--quiet"),
            ];
            if let Err(err) = self.gcloud.run(args).await {
                warn!(%rule, error = %err, "failed to delete firewall rule");
                leaked += 1;
            }
        }
        leaked
    }

    /// Removes Shared VPC wiring and deletes the network. Failures are
    /// logged; the number of leaked resources is returned.
    pub async fn teardown_network(&self, state: &NetworkState) -> usize {
        if is_default_network(self.network) {
            return 0;
        }
        let host = self.layout.host_project();
        let mut leaked = 0;

        if let Some(ref shared) = state.shared_vpc {
            for (member, role) in &shared.bindings {
                if let Err(err) = self
                    .iam_binding("remove-iam-policy-binding", member, role)
                    .await
                {
                    warn!(%member, %role, error = %err, "failed to remove IAM binding");
                    leaked += 1;
                }
            }
            for service in &shared.associated {
                let args = vec![
                    String::from("compute"),
                    String::from("shared-vpc"),
                    String::from("associated-projects"),
                    String::from("remove"),
                    service.clone(),
                    format!("--host-project={host}"),
                ];
                if let Err(err) = self.gcloud.run(args).await {
                    warn!(project = %service, error = %err, "failed to disassociate service project");
                    leaked += 1;
                }
            }
            let args = vec![
                String::from("compute"),
                String::from("shared-vpc"),
                String::from("disable"),
                host.to_owned(),
            ];
            if let Err(err) = self.gcloud.run(args).await {
                warn!(project = %host, error = %err, "failed to disable shared VPC host");
                leaked += 1;
            }
        }

        leaked += self.delete_network_firewall_rules().await;

        let args = vec![
            String::from("compute"),
            String::from("networks"),
            String::from("delete"),
            self.network.to_owned(),
            format!("--project={host}"),
            String::from("--quiet"),
        ];
        if let Err(err) = self.gcloud.run(args).await {
            warn!(network = %self.network, error = %err, "failed to delete network");
            leaked += 1;
        }
        leaked
    }
}
