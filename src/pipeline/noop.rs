//! Deployer for clusters that already exist.

use std::convert::Infallible;

use camino::Utf8PathBuf;
use tracing::info;

use super::{Deployer, DeployerFuture, RunContext, UpOutcome};

/// Creates and deletes nothing; points testers at an existing cluster.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NoopDeployer {
    kubeconfig: Option<Utf8PathBuf>,
}

impl NoopDeployer {
    /// Uses `kubeconfig`, normally `--kubeconfig` or the caller's
    /// `KUBECONFIG`.
    #[must_use]
    pub const fn new(kubeconfig: Option<Utf8PathBuf>) -> Self {
        Self { kubeconfig }
    }
}

impl Deployer for NoopDeployer {
    type Error = Infallible;

    fn name(&self) -> &'static str {
        "noop"
    }

    fn build<'a>(&'a self, _context: &'a RunContext) -> DeployerFuture<'a, (), Self::Error> {
        Box::pin(async { Ok(()) })
    }

    fn up<'a>(&'a self, context: &'a RunContext) -> DeployerFuture<'a, UpOutcome, Self::Error> {
        Box::pin(async move {
            info!(kubeconfig = ?self.kubeconfig, "using existing cluster");
            Ok(self.existing(context))
        })
    }

    fn down<'a>(&'a self, _context: &'a RunContext) -> DeployerFuture<'a, (), Self::Error> {
        Box::pin(async { Ok(()) })
    }

    fn existing(&self, _context: &RunContext) -> UpOutcome {
        UpOutcome {
            kubeconfig: self.kubeconfig.clone(),
            env: Vec::new(),
        }
    }
}
