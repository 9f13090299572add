//! Argument builders for `gcloud container` commands.

use std::str::FromStr;

use thiserror::Error;

use super::layout::ClusterTarget;

/// Cluster version value that lets GKE pick its default.
pub const LATEST_VERSION: &str = "latest";

/// Errors raised while parsing cluster creation settings.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ArgsError {
    /// Unknown private cluster access level.
    #[error("unknown private cluster access level '{0}': expected no, limited, or unrestricted")]
    AccessLevel(String),
    /// An extra node pool entry could not be parsed.
    #[error("malformed extra node pool '{entry}': {reason}")]
    NodePool {
        /// Entry as configured.
        entry: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Who may reach the control plane of a private cluster.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PrivateClusterAccessLevel {
    /// Private endpoint only; no public access.
    No,
    /// Public endpoint restricted by authorized networks.
    Limited,
    /// Public endpoint open to any network.
    Unrestricted,
}

impl FromStr for PrivateClusterAccessLevel {
    type Err = ArgsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "no" => Ok(Self::No),
            "limited" => Ok(Self::Limited),
            "unrestricted" => Ok(Self::Unrestricted),
            _ => Err(ArgsError::AccessLevel(value.trim().to_owned())),
        }
    }
}

/// Private cluster settings shared by all clusters of a run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrivateCluster {
    /// Control-plane access level.
    pub access_level: PrivateClusterAccessLevel,
    /// Control-plane ranges indexed by cluster ordinal; missing entries fall
    /// back to [`default_master_ip_range`].
    pub master_ip_ranges: Vec<String>,
}

impl PrivateCluster {
    /// Control-plane range for the cluster with ordinal `index`.
    #[must_use]
    pub fn master_ip_range(&self, index: usize) -> String {
        self.master_ip_ranges
            .get(index)
            .cloned()
            .unwrap_or_else(|| default_master_ip_range(index))
    }
}

/// Default `/28` control-plane range for cluster ordinal `index`.
#[must_use]
pub fn default_master_ip_range(index: usize) -> String {
    format!("172.16.{index}.32/28")
}

/// Flags for a private cluster at `access_level` with control plane in
/// `master_ip_range`.
#[must_use]
pub fn private_cluster_args(
    access_level: PrivateClusterAccessLevel,
    master_ip_range: &str,
) -> Vec<String> {
    let mut args = vec![
        String::from("--enable-private-nodes"),
        String::from("--enable-ip-alias"),
        format!("--master-ipv4-cidr={master_ip_range}"),
    ];
    match access_level {
        PrivateClusterAccessLevel::No => {
            args.push(String::from("--enable-master-authorized-networks"));
            args.push(String::from("--enable-private-endpoint"));
        }
        PrivateClusterAccessLevel::Limited => {
            args.push(String::from("--enable-master-authorized-networks"));
        }
        PrivateClusterAccessLevel::Unrestricted => {
            args.push(String::from("--no-enable-master-authorized-networks"));
        }
    }
    args
}

/// An additional node pool created after the base cluster
/// (`name=pool,machine-type=n1-standard-8,num-nodes=2`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExtraNodePool {
    /// Node pool name.
    pub name: String,
    /// Remaining `key=value` settings, rendered as `--key=value`.
    pub settings: Vec<(String, String)>,
}

impl FromStr for ExtraNodePool {
    type Err = ArgsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let entry = value.trim();
        let failure = |reason: &str| ArgsError::NodePool {
            entry: entry.to_owned(),
            reason: reason.to_owned(),
        };

        let mut name = None;
        let mut settings = Vec::new();
        for part in entry.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            let (key, setting) = part
                .split_once('=')
                .ok_or_else(|| failure("settings must be key=value"))?;
            let (key, setting) = (key.trim(), setting.trim());
            if key.is_empty() || setting.is_empty() {
                return Err(failure("settings must be key=value"));
            }
            if key == "name" {
                name = Some(setting.to_owned());
            } else {
                settings.push((key.to_owned(), setting.to_owned()));
            }
        }

        let pool_name = name.ok_or_else(|| failure("missing name"))?;
        Ok(Self {
            name: pool_name,
            settings,
        })
    }
}

/// Windows node pool settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WindowsPool {
    /// Number of Windows nodes.
    pub num_nodes: u32,
    /// Windows image type.
    pub image_type: String,
}

/// Name used for the Windows node pool.
pub const WINDOWS_POOL_NAME: &str = "win-pool";

/// Everything needed to render one `clusters create` invocation.
#[derive(Clone, Debug)]
pub struct CreateClusterArgs<'a> {
    /// Target project and cluster.
    pub target: &'a ClusterTarget,
    /// `--region=` or `--zone=` flag for this attempt.
    pub location_arg: &'a str,
    /// Network name or fully qualified reference.
    pub network: &'a str,
    /// Subnetwork reference for service projects in a Shared VPC layout.
    pub subnetwork: Option<&'a SharedSubnet>,
    /// Nodes per zone in the default pool.
    pub num_nodes: u32,
    /// Machine type for the default pool.
    pub machine_type: &'a str,
    /// Node image type.
    pub image_type: &'a str,
    /// Cluster version or [`LATEST_VERSION`].
    pub cluster_version: &'a str,
    /// Optional release channel.
    pub release_channel: Option<&'a str>,
    /// Private cluster settings.
    pub private_cluster: Option<&'a PrivateCluster>,
}

/// Subnet placement for a service project's clusters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SharedSubnet {
    /// Fully qualified subnetwork path in the host project.
    pub path: String,
    /// Secondary range name for pods.
    pub pods_range: String,
    /// Secondary range name for services.
    pub services_range: String,
}

impl CreateClusterArgs<'_> {
    /// Renders the argument vector passed to `gcloud`.
    #[must_use]
    pub fn render(&self) -> Vec<String> {
        let mut args = vec![
            String::from("container"),
            String::from("clusters"),
            String::from("create"),
            self.target.cluster.name.clone(),
            format!("--project={}", self.target.project),
            self.location_arg.to_owned(),
            format!("--network={}", self.network),
            format!("--num-nodes={}", self.num_nodes),
            format!("--machine-type={}", self.machine_type),
            format!("--image-type={}", self.image_type),
        ];

        if let Some(subnet) = self.subnetwork {
            args.push(format!("--subnetwork={}", subnet.path));
            args.push(format!("--cluster-secondary-range-name={}", subnet.pods_range));
            args.push(format!(
                "--services-secondary-range-name={}",
                subnet.services_range
            ));
            args.push(String::from("--enable-ip-alias"));
        }

        args.extend(version_args(self.cluster_version, self.release_channel));

        if let Some(private) = self.private_cluster {
            let range = private.master_ip_range(self.target.cluster.index);
            args.extend(
                private_cluster_args(private.access_level, &range)
                    .into_iter()
                    .filter(|arg| !(self.subnetwork.is_some() && arg == "--enable-ip-alias")),
            );
        }

        args.push(String::from("--quiet"));
        args
    }
}

/// Version and release-channel flags.
#[must_use]
pub fn version_args(cluster_version: &str, release_channel: Option<&str>) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(channel) = release_channel {
        args.push(format!("--release-channel={channel}"));
    }
    if cluster_version != LATEST_VERSION && !cluster_version.trim().is_empty() {
        args.push(format!("--cluster-version={cluster_version}"));
    }
    args
}

/// Arguments for `node-pools create` of `pool` in `target`.
#[must_use]
pub fn extra_node_pool_args(
    target: &ClusterTarget,
    location_arg: &str,
    pool: &ExtraNodePool,
) -> Vec<String> {
    let mut args = node_pool_prefix(target, location_arg, &pool.name);
    args.extend(
        pool.settings
            .iter()
            .map(|(key, value)| format!("--{key}={value}")),
    );
    args.push(String::from("--quiet"));
    args
}

/// Arguments for the Windows node pool of `target`.
#[must_use]
pub fn windows_node_pool_args(
    target: &ClusterTarget,
    location_arg: &str,
    pool: &WindowsPool,
) -> Vec<String> {
    let mut args = node_pool_prefix(target, location_arg, WINDOWS_POOL_NAME);
    args.push(format!("--image-type={}", pool.image_type));
    args.push(format!("--num-nodes={}", pool.num_nodes));
    args.push(String::from("--quiet"));
    args
}

fn node_pool_prefix(target: &ClusterTarget, location_arg: &str, pool: &str) -> Vec<String> {
    vec![
        String::from("container"),
        String::from("node-pools"),
        String::from("create"),
        pool.to_owned(),
        format!("--cluster={}", target.cluster.name),
        format!("--project={}", target.project),
        location_arg.to_owned(),
    ]
}
