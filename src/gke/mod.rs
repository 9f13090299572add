//! Google Kubernetes Engine deployer.
//!
//! Clusters are created with `gcloud` across one or more projects. With
//! several projects the first one hosts a Shared VPC network that the others
//! attach to through per-project subnets. Creation fails over between the
//! configured regions or zones; teardown is best effort.

pub mod args;
pub mod cleanup;
pub mod deployer;
pub mod gcloud;
pub mod instance_groups;
pub mod layout;
pub mod network;
pub mod orchestrator;

pub use cleanup::{CleanupQueue, CleanupReport, CleanupSummary, Teardown};
pub use deployer::{GkeDeployer, GkeError, ProjectLeasing};
pub use gcloud::Gcloud;
pub use instance_groups::{InstanceGroup, InstanceGroupCache};
pub use layout::{ClusterLayout, ClusterSpec, ClusterTarget};
pub use network::{NetworkManager, NetworkState};
pub use orchestrator::{CreatedClusters, CreationError, OrchestrationError, Orchestrator};
