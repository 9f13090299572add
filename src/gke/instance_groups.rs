//! Instance group discovery and the per-process cache.
//!
//! GKE reports the managed instance groups behind each node pool as URLs
//! such as
//! `https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-c/instanceGroupManagers/gke-kt2-1-default-pool-1a2b3c4d-grp`.
//! The zone, pool name, and hash parsed from them name the e2e firewall rule
//! and its node target tag.

use std::collections::BTreeMap;

use thiserror::Error;
use tokio::sync::Mutex;

use super::gcloud::Gcloud;
use super::layout::ClusterTarget;
use crate::process::{CommandRunner, ProcessError};

/// Errors raised while discovering instance groups.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum InstanceGroupError {
    /// The URL did not have the expected shape.
    #[error("unrecognised instance group URL '{0}'")]
    MalformedUrl(String),
    /// The describe call failed.
    #[error("failed to describe cluster {cluster}: {source}")]
    Describe {
        /// Cluster being described.
        cluster: String,
        /// Underlying process error.
        #[source]
        source: ProcessError,
    },
}

/// Node pool instance group metadata.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceGroup {
    /// Zone of the group.
    pub zone: String,
    /// Node pool name.
    pub pool: String,
    /// Hash GKE appends to the group and node tag names.
    pub hash: String,
}

impl InstanceGroup {
    /// Parses an instance group manager URL for `cluster`.
    ///
    /// The zone comes from the `zones/<zone>` segment and the hash from the
    /// trailing `-<hash>-grp`. GKE shortens long cluster and pool names inside
    /// group names, so the cluster name is not required to appear in full;
    /// when it does not, `pool` holds the shortened `<cluster>-<pool>` text.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceGroupError::MalformedUrl`] when the URL does not name
    /// a zone and a `gke-<name>-<hash>-grp` group.
    pub fn parse(cluster: &str, url: &str) -> Result<Self, InstanceGroupError> {
        let malformed = || InstanceGroupError::MalformedUrl(url.to_owned());
        let segments: Vec<&str> = url.trim().trim_end_matches('/').split('/').collect();
        let zone = segments
            .iter()
            .position(|segment| *segment == "zones")
            .and_then(|pos| segments.get(pos + 1))
            .filter(|zone| !zone.is_empty())
            .ok_or_else(malformed)?;
        let group = segments.last().ok_or_else(malformed)?;
        let body = group
            .strip_prefix("gke-")
            .and_then(|rest| rest.strip_suffix("-grp"))
            .ok_or_else(malformed)?;
        let (name, hash) = body.rsplit_once('-').ok_or_else(malformed)?;
        if name.is_empty() || hash.is_empty() {
            return Err(malformed());
        }
        let pool = name
            .strip_prefix(cluster)
            .and_then(|rest| rest.strip_prefix('-'))
            .filter(|pool| !pool.is_empty())
            .unwrap_or(name);
        Ok(Self {
            zone: (*zone).to_owned(),
            pool: pool.to_owned(),
            hash: hash.to_owned(),
        })
    }

    /// Name of the e2e NodePort firewall rule for this group.
    #[must_use]
    pub fn firewall_rule_name(&self) -> String {
        firewall_rule_name(&self.hash)
    }

    /// Network tag GKE puts on this group's nodes in `cluster`.
    #[must_use]
    pub fn node_tag(&self, cluster: &str) -> String {
        format!("gke-{cluster}-{}-node", self.hash)
    }
}

/// Firewall rule name derived from an instance group hash.
#[must_use]
pub fn firewall_rule_name(hash: &str) -> String {
    format!("e2e-ports-{hash}")
}

/// Instance groups keyed by cluster target.
pub type InstanceGroupMap = BTreeMap<ClusterTarget, Vec<InstanceGroup>>;

/// Queries GKE for the instance groups of every target, bypassing any cache.
///
/// # Errors
///
/// Returns [`InstanceGroupError`] for the first target that cannot be
/// described or whose URLs do not parse.
pub async fn discover_instance_groups<R>(
    gcloud: &Gcloud<R>,
    targets: &[ClusterTarget],
    location_arg: &str,
) -> Result<InstanceGroupMap, InstanceGroupError>
where
    R: CommandRunner + ?Sized + 'static,
{
    let mut groups = InstanceGroupMap::new();
    for target in targets {
        let args = vec![
            String::from("container"),
            String::from("clusters"),
            String::from("describe"),
            target.cluster.name.clone(),
            format!("--project={}", target.project),
            location_arg.to_owned(),
            String::from("--format=value(instanceGroupUrls)"),
        ];
        let output = gcloud
            .run(args)
            .await
            .map_err(|source| InstanceGroupError::Describe {
                cluster: target.cluster.name.clone(),
                source,
            })?;
        let parsed = output
            .stdout
            .split([';', '\n'])
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(|url| InstanceGroup::parse(&target.cluster.name, url))
            .collect::<Result<Vec<_>, _>>()?;
        groups.insert(target.clone(), parsed);
    }
    Ok(groups)
}

/// Computed-once instance group lookup shared by Up and Down.
///
/// Only the orchestration path touches the cache, between fan-out rounds;
/// concurrent creation and deletion tasks receive copies.
#[derive(Debug, Default)]
pub struct InstanceGroupCache {
    groups: Mutex<Option<InstanceGroupMap>>,
}

impl InstanceGroupCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached map, running discovery only when nothing is cached.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceGroupError`] from discovery; failures are not
    /// cached.
    pub async fn get_or_discover<R>(
        &self,
        gcloud: &Gcloud<R>,
        targets: &[ClusterTarget],
        location_arg: &str,
    ) -> Result<InstanceGroupMap, InstanceGroupError>
    where
        R: CommandRunner + ?Sized + 'static,
    {
        let mut guard = self.groups.lock().await;
        if let Some(ref cached) = *guard {
            return Ok(cached.clone());
        }
        let discovered = discover_instance_groups(gcloud, targets, location_arg).await?;
        *guard = Some(discovered.clone());
        Ok(discovered)
    }

    /// Clears the cache so the next lookup queries GKE again.
    pub async fn reset(&self) {
        *self.groups.lock().await = None;
    }

    /// Returns the cached map without discovering.
    pub async fn cached(&self) -> Option<InstanceGroupMap> {
        self.groups.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use super::*;
    use crate::gke::layout::Cluster;
    use crate::test_support::ScriptedRunner;

    const URL: &str = "https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-c/instanceGroupManagers/gke-kt2-1-default-pool-1a2b3c4d-grp";

    fn target() -> ClusterTarget {
        ClusterTarget {
            project: String::from("p"),
            project_index: 0,
            cluster: Cluster {
                index: 0,
                name: String::from("kt2-1"),
            },
        }
    }

    #[rstest]
    fn parse_extracts_zone_pool_and_hash() {
        let group = InstanceGroup::parse("kt2-1", URL).expect("valid url");
        assert_eq!(
            group,
            InstanceGroup {
                zone: String::from("us-central1-c"),
                pool: String::from("default-pool"),
                hash: String::from("1a2b3c4d"),
            }
        );
        assert_eq!(group.firewall_rule_name(), "e2e-ports-1a2b3c4d");
        assert_eq!(group.node_tag("kt2-1"), "gke-kt2-1-1a2b3c4d-node");
    }

    #[rstest]
    fn parse_accepts_shortened_cluster_names() {
        let cluster = "kt2-0b8e2c1a-5f4d-4c1e-9a7b-3e2d1c0f9a-1";
        let url = "https://www.googleapis.com/compute/v1/projects/p/zones/us-east1-b/instanceGroupManagers/gke-kt2-0b8e2c1a-5f4d-default-pool-1a2b3c4d-grp";

        let group = InstanceGroup::parse(cluster, url).expect("shortened name parses");

        assert_eq!(group.zone, "us-east1-b");
        assert_eq!(group.hash, "1a2b3c4d");
        assert_eq!(group.pool, "kt2-0b8e2c1a-5f4d-default-pool");
        assert_eq!(group.firewall_rule_name(), "e2e-ports-1a2b3c4d");
    }

    #[rstest]
    #[case("https://example.com/instanceGroupManagers/gke-kt2-1-pool-abc-grp")]
    #[case("https://example.com/zones/us-central1-c/instanceGroupManagers/other-grp")]
    #[case("https://example.com/zones/us-central1-c/instanceGroupManagers/gke-abc-grp")]
    #[case("https://example.com/zones/us-central1-c/instanceGroupManagers/gke-kt2-1-pool-abc")]
    fn parse_rejects_unexpected_urls(#[case] url: &str) {
        assert!(InstanceGroup::parse("kt2-1", url).is_err());
    }

    #[tokio::test]
    async fn cache_queries_provider_once_until_reset() {
        let runner = Arc::new(ScriptedRunner::permissive());
        runner.on_command(&["clusters describe kt2-1"], Some(0), format!("{URL}\n"), "");
        let gcloud = Gcloud::new(Arc::clone(&runner), "gcloud");
        let cache = InstanceGroupCache::new();
        let targets = vec![target()];

        let first = cache
            .get_or_discover(&gcloud, &targets, "--zone=us-central1-c")
            .await
            .expect("discovery succeeds");
        let second = cache
            .get_or_discover(&gcloud, &targets, "--zone=us-central1-c")
            .await
            .expect("cache hit");
        assert_eq!(first, second);
        assert_eq!(runner.count_matching(&["clusters describe"]), 1);

        cache.reset().await;
        assert!(cache.cached().await.is_none());
        cache
            .get_or_discover(&gcloud, &targets, "--zone=us-central1-c")
            .await
            .expect("rediscovery succeeds");
        assert_eq!(runner.count_matching(&["clusters describe"]), 2);
    }

    #[tokio::test]
    async fn failed_discovery_is_not_cached() {
        let runner = Arc::new(ScriptedRunner::permissive());
        runner.on_command_once(&["clusters describe"], Some(1), "", "NOT_FOUND");
        runner.on_command(&["clusters describe"], Some(0), URL, "");
        let gcloud = Gcloud::new(Arc::clone(&runner), "gcloud");
        let cache = InstanceGroupCache::new();
        let targets = vec![target()];

        let err = cache
            .get_or_discover(&gcloud, &targets, "--region=us-central1")
            .await
            .expect_err("first describe fails");
        assert!(matches!(err, InstanceGroupError::Describe { .. }));
        assert!(cache.cached().await.is_none());

        let groups = cache
            .get_or_discover(&gcloud, &targets, "--region=us-central1")
            .await
            .expect("second describe succeeds");
        assert_eq!(groups.get(&target()).map(Vec::len), Some(1));
    }
}
