//! Configuration loading via `ortho-config`.
//!
//! [`GkeConfig`] holds the raw layered values (defaults, `kt2.toml`, then
//! `KT2_GKE_*` variables). [`GkeConfig::validate`] turns them into typed
//! [`GkeOptions`] and rejects bad combinations before anything external runs.

use std::ffi::OsString;
use std::fmt;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::builder::BuildStrategy;
use crate::gke::args::{
    ExtraNodePool, LATEST_VERSION, PrivateCluster, PrivateClusterAccessLevel, WindowsPool,
};
use crate::gke::layout::{ClusterLayout, ClusterSpec};
use crate::location::LocationSet;
use crate::retry::PatternClassifier;

/// Name of the project configuration file.
pub const CONFIG_FILE_NAME: &str = "kt2.toml";

/// GKE deployer settings derived from environment variables, configuration
/// files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KT2_GKE",
    discovery(
        app_name = "kt2",
        env_var = "KT2_CONFIG_PATH",
        config_file_name = "kt2.toml",
        dotfile_name = ".kt2.toml",
        project_file_name = "kt2.toml"
    )
)]
pub struct GkeConfig {
    /// Path to the `gcloud` executable.
    #[ortho_config(default = "gcloud".to_owned())]
    pub gcloud_bin: String,
    /// Path to the `gsutil` executable.
    #[ortho_config(default = "gsutil".to_owned())]
    pub gsutil_bin: String,
    /// Comma-separated projects. When unset, projects are leased from the
    /// resource broker.
    pub projects: Option<String>,
    /// Number of projects to lease when none are listed.
    #[ortho_config(default = 1)]
    pub project_count: usize,
    /// Comma-separated regions, tried in order.
    pub regions: Option<String>,
    /// Comma-separated zones, tried in order.
    pub zones: Option<String>,
    /// Comma-separated `name` or `name:projectIndex` entries.
    pub cluster_names: Option<String>,
    /// Number of clusters to generate names for when none are listed.
    #[ortho_config(default = 1)]
    pub num_clusters: usize,
    /// Network name; `default` reuses the project's implicit network.
    #[ortho_config(default = "default".to_owned())]
    pub network: String,
    /// Nodes in the default pool.
    #[ortho_config(default = 3)]
    pub num_nodes: u32,
    /// Machine type for the default pool.
    #[ortho_config(default = "e2-standard-4".to_owned())]
    pub machine_type: String,
    /// Node image type.
    #[ortho_config(default = "cos_containerd".to_owned())]
    pub image_type: String,
    /// Cluster version, or `latest`.
    #[ortho_config(default = LATEST_VERSION.to_owned())]
    pub cluster_version: String,
    /// Release channel, if any.
    pub release_channel: Option<String>,
    /// `no`, `limited` or `unrestricted`; unset creates public clusters.
    pub private_cluster_access_level: Option<String>,
    /// Comma-separated control plane CIDRs, one per cluster index.
    pub private_cluster_master_ip_ranges: Option<String>,
    /// `;`-separated pools, each `name=<pool>,key=value,...`.
    pub extra_node_pools: Option<String>,
    /// How many extra node pools are created at once per cluster.
    #[ortho_config(default = 1)]
    pub node_pool_create_concurrency: usize,
    /// Whether a Windows node pool is added to each cluster.
    #[ortho_config(default = false)]
    pub windows_enabled: bool,
    /// Nodes in the Windows pool.
    #[ortho_config(default = 1)]
    pub windows_num_nodes: u32,
    /// Image type for the Windows pool.
    #[ortho_config(default = "WINDOWS_LTSC_CONTAINERD".to_owned())]
    pub windows_image_type: String,
    /// `;`-separated regular expressions marking retryable errors. Unset
    /// uses the built-in set; an empty string disables retries.
    pub retryable_error_patterns: Option<String>,
    /// `make` or `bazel`.
    #[ortho_config(default = "make".to_owned())]
    pub build_strategy: String,
    /// Repository root for builds.
    #[ortho_config(default = ".".to_owned())]
    pub repo_root: String,
    /// Bucket path that receives built release tarballs.
    pub stage_location: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn invalid(&self, reason: &dyn fmt::Display) -> ConfigError {
        ConfigError::Invalid(format!(
            "invalid {}: {reason}; set {} or {} at the top level of {CONFIG_FILE_NAME}",
            self.description, self.env_var, self.toml_key
        ))
    }
}

const PROJECTS: FieldMetadata = FieldMetadata::new("projects", "KT2_GKE_PROJECTS", "projects");
const LOCATIONS: FieldMetadata = FieldMetadata::new(
    "regions/zones",
    "KT2_GKE_REGIONS or KT2_GKE_ZONES",
    "regions or zones",
);
const CLUSTERS: FieldMetadata = FieldMetadata::new(
    "cluster names",
    "KT2_GKE_CLUSTER_NAMES or KT2_GKE_NUM_CLUSTERS",
    "cluster_names or num_clusters",
);
const ACCESS_LEVEL: FieldMetadata = FieldMetadata::new(
    "private cluster access level",
    "KT2_GKE_PRIVATE_CLUSTER_ACCESS_LEVEL",
    "private_cluster_access_level",
);
const NODE_POOLS: FieldMetadata = FieldMetadata::new(
    "extra node pools",
    "KT2_GKE_EXTRA_NODE_POOLS",
    "extra_node_pools",
);
const POOL_CONCURRENCY: FieldMetadata = FieldMetadata::new(
    "node pool concurrency",
    "KT2_GKE_NODE_POOL_CREATE_CONCURRENCY",
    "node_pool_create_concurrency",
);
const RETRY_PATTERNS: FieldMetadata = FieldMetadata::new(
    "retryable error patterns",
    "KT2_GKE_RETRYABLE_ERROR_PATTERNS",
    "retryable_error_patterns",
);
const BUILD_STRATEGY: FieldMetadata = FieldMetadata::new(
    "build strategy",
    "KT2_GKE_BUILD_STRATEGY",
    "build_strategy",
);

/// Cluster naming as configured.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClusterNames {
    /// Explicit names, optionally pinned to a project index.
    Explicit(Vec<ClusterSpec>),
    /// Generate this many names from the run id.
    Generated(usize),
}

/// Validated GKE deployer options.
#[derive(Clone, Debug)]
pub struct GkeOptions {
    /// Path to `gcloud`.
    pub gcloud_bin: String,
    /// Path to `gsutil`.
    pub gsutil_bin: String,
    /// Explicit projects; empty means lease from the broker.
    pub projects: Vec<String>,
    /// Projects to lease when `projects` is empty.
    pub project_count: usize,
    /// Candidate locations per attempt.
    pub locations: LocationSet,
    /// Clusters to create.
    pub clusters: ClusterNames,
    /// Network name.
    pub network: String,
    /// Nodes in the default pool.
    pub num_nodes: u32,
    /// Machine type.
    pub machine_type: String,
    /// Node image type.
    pub image_type: String,
    /// Cluster version.
    pub cluster_version: String,
    /// Release channel.
    pub release_channel: Option<String>,
    /// Private cluster settings, when private clusters are wanted.
    pub private_cluster: Option<PrivateCluster>,
    /// Extra node pools created after each cluster.
    pub extra_node_pools: Vec<ExtraNodePool>,
    /// Concurrent extra node pool creations per cluster.
    pub node_pool_create_concurrency: usize,
    /// Windows pool settings, when enabled.
    pub windows_pool: Option<WindowsPool>,
    /// Classifier for creation failures.
    pub retry: PatternClassifier,
    /// Build strategy.
    pub build_strategy: BuildStrategy,
    /// Repository root for builds.
    pub repo_root: Utf8PathBuf,
    /// Stage location for built tarballs.
    pub stage_location: Option<String>,
}

/// Splits a comma-separated list, dropping blank entries.
#[must_use]
pub fn split_list(value: Option<&str>) -> Vec<String> {
    split_on(value, ',')
}

fn split_on(value: Option<&str>, separator: char) -> Vec<String> {
    value
        .map(|raw| {
            raw.split(separator)
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

impl GkeConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("kt2")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation and produces typed options. Error
    /// messages name the environment variable and TOML key to fix.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for the first invalid setting.
    pub fn validate(&self) -> Result<GkeOptions, ConfigError> {
        let projects = split_list(self.projects.as_deref());
        if projects.is_empty() && self.project_count == 0 {
            return Err(PROJECTS.invalid(&"list projects or lease at least one"));
        }

        let locations = LocationSet::new(
            split_list(self.regions.as_deref()),
            split_list(self.zones.as_deref()),
        )
        .map_err(|err| LOCATIONS.invalid(&err))?;

        let clusters = self.cluster_names()?;
        if let ClusterNames::Explicit(ref specs) = clusters
            && !projects.is_empty()
        {
            ClusterLayout::new(projects.clone(), specs).map_err(|err| CLUSTERS.invalid(&err))?;
        }

        let private_cluster = self
            .private_cluster_access_level
            .as_deref()
            .filter(|level| !level.trim().is_empty())
            .map(|level| {
                level
                    .parse::<PrivateClusterAccessLevel>()
                    .map(|access_level| PrivateCluster {
                        access_level,
                        master_ip_ranges: split_list(
                            self.private_cluster_master_ip_ranges.as_deref(),
                        ),
                    })
                    .map_err(|err| ACCESS_LEVEL.invalid(&err))
            })
            .transpose()?;

        let extra_node_pools = split_on(self.extra_node_pools.as_deref(), ';')
            .iter()
            .map(|entry| entry.parse::<ExtraNodePool>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| NODE_POOLS.invalid(&err))?;

        if self.node_pool_create_concurrency == 0 {
            return Err(POOL_CONCURRENCY.invalid(&"must be at least 1"));
        }

        let retry = match self.retryable_error_patterns {
            Some(ref raw) => PatternClassifier::compile(split_on(Some(raw), ';')),
            None => PatternClassifier::with_defaults(),
        }
        .map_err(|err| RETRY_PATTERNS.invalid(&err))?;

        let build_strategy = self
            .build_strategy
            .parse::<BuildStrategy>()
            .map_err(|err| BUILD_STRATEGY.invalid(&err))?;

        let windows_pool = self.windows_enabled.then(|| WindowsPool {
            num_nodes: self.windows_num_nodes,
            image_type: self.windows_image_type.clone(),
        });

        Ok(GkeOptions {
            gcloud_bin: self.gcloud_bin.clone(),
            gsutil_bin: self.gsutil_bin.clone(),
            projects,
            project_count: self.project_count,
            locations,
            clusters,
            network: self.network.clone(),
            num_nodes: self.num_nodes,
            machine_type: self.machine_type.clone(),
            image_type: self.image_type.clone(),
            cluster_version: self.cluster_version.clone(),
            release_channel: self
                .release_channel
                .clone()
                .filter(|channel| !channel.trim().is_empty()),
            private_cluster,
            extra_node_pools,
            node_pool_create_concurrency: self.node_pool_create_concurrency,
            windows_pool,
            retry,
            build_strategy,
            repo_root: Utf8PathBuf::from(self.repo_root.as_str()),
            stage_location: self.stage_location.clone(),
        })
    }

    fn cluster_names(&self) -> Result<ClusterNames, ConfigError> {
        let names = split_list(self.cluster_names.as_deref());
        if names.is_empty() {
            if self.num_clusters == 0 {
                return Err(CLUSTERS.invalid(&"at least one cluster is required"));
            }
            return Ok(ClusterNames::Generated(self.num_clusters));
        }
        names
            .iter()
            .map(|name| name.parse::<ClusterSpec>())
            .collect::<Result<Vec<_>, _>>()
            .map(ClusterNames::Explicit)
            .map_err(|err| CLUSTERS.invalid(&err))
    }
}

/// Values given as command-line flags. Anything set here replaces the
/// layered value of the same setting.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GkeOverrides {
    /// `--project`, repeatable or comma-separated.
    pub projects: Vec<String>,
    /// `--region`.
    pub regions: Vec<String>,
    /// `--zone`.
    pub zones: Vec<String>,
    /// `--cluster-name`.
    pub cluster_names: Vec<String>,
    /// `--num-clusters`.
    pub num_clusters: Option<usize>,
    /// `--network`.
    pub network: Option<String>,
    /// `--private-cluster-access-level`.
    pub private_cluster_access_level: Option<String>,
    /// `--retryable-error-pattern`, repeatable.
    pub retryable_error_patterns: Vec<String>,
    /// `--build-strategy`.
    pub build_strategy: Option<String>,
    /// `--stage-location`.
    pub stage_location: Option<String>,
}

fn join_non_empty(values: &[String], separator: &str) -> Option<String> {
    (!values.is_empty()).then(|| values.join(separator))
}

impl GkeConfig {
    /// Applies command-line flags over the layered values.
    pub fn apply_overrides(&mut self, overrides: &GkeOverrides) {
        if let Some(projects) = join_non_empty(&overrides.projects, ",") {
            self.projects = Some(projects);
        }
        if let Some(regions) = join_non_empty(&overrides.regions, ",") {
            self.regions = Some(regions);
        }
        if let Some(zones) = join_non_empty(&overrides.zones, ",") {
            self.zones = Some(zones);
        }
        if let Some(names) = join_non_empty(&overrides.cluster_names, ",") {
            self.cluster_names = Some(names);
        }
        if let Some(patterns) = join_non_empty(&overrides.retryable_error_patterns, ";") {
            self.retryable_error_patterns = Some(patterns);
        }
        if let Some(count) = overrides.num_clusters {
            self.num_clusters = count;
        }
        if let Some(ref network) = overrides.network {
            self.network.clone_from(network);
        }
        if let Some(ref level) = overrides.private_cluster_access_level {
            self.private_cluster_access_level = Some(level.clone());
        }
        if let Some(ref strategy) = overrides.build_strategy {
            self.build_strategy.clone_from(strategy);
        }
        if let Some(ref stage) = overrides.stage_location {
            self.stage_location = Some(stage.clone());
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// A setting is missing, malformed, or conflicts with another.
    #[error("configuration error: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
