//! Partitioning of clusters across projects.

use std::collections::BTreeSet;
use std::str::FromStr;

use thiserror::Error;

/// Most projects a layout may span. Service-project subnet ranges are derived
/// from the project index and must stay inside `10.0.0.0/8`.
pub const MAX_PROJECTS: usize = 50;

/// A cluster to create, identified by its declaration ordinal and name.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Cluster {
    /// Ordinal across the whole run; keys per-cluster settings such as the
    /// private control-plane range.
    pub index: usize,
    /// Cluster name, unique within its project.
    pub name: String,
}

/// A requested cluster as written in configuration (`name` or
/// `name:projectIndex`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClusterSpec {
    /// Cluster name.
    pub name: String,
    /// Explicit project index, if given.
    pub project_index: Option<usize>,
}

impl FromStr for ClusterSpec {
    type Err = LayoutError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (name, project_index) = match trimmed.split_once(':') {
            Some((name, index)) => {
                let parsed = index
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| LayoutError::MalformedSpec(trimmed.to_owned()))?;
                (name.trim(), Some(parsed))
            }
            None => (trimmed, None),
        };
        if name.is_empty() {
            return Err(LayoutError::MalformedSpec(trimmed.to_owned()));
        }
        Ok(Self {
            name: name.to_owned(),
            project_index,
        })
    }
}

/// Clusters assigned to one project.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProjectClusters {
    /// Position of the project in the layout; 0 is the host project.
    pub index: usize,
    /// Project identifier.
    pub project: String,
    /// Clusters created in this project, in declaration order.
    pub clusters: Vec<Cluster>,
}

/// A single (project, cluster) pair; the unit of creation and deletion.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ClusterTarget {
    /// Project identifier.
    pub project: String,
    /// Position of the project in the layout.
    pub project_index: usize,
    /// The cluster itself.
    pub cluster: Cluster,
}

/// Errors raised while building a [`ClusterLayout`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LayoutError {
    /// No projects were supplied.
    #[error("at least one project is required")]
    NoProjects,
    /// More projects than the subnet plan supports.
    #[error("at most {MAX_PROJECTS} projects are supported, got {0}")]
    TooManyProjects(usize),
    /// No clusters were requested.
    #[error("at least one cluster is required")]
    NoClusters,
    /// A cluster entry could not be parsed.
    #[error("malformed cluster name '{0}': expected name or name:projectIndex")]
    MalformedSpec(String),
    /// A multi-project layout omitted the project index.
    #[error("cluster '{0}' needs a :projectIndex suffix when several projects are used")]
    MissingProjectIndex(String),
    /// A project index pointed past the project list.
    #[error("cluster '{name}' refers to project index {index}, but only {count} projects exist")]
    ProjectIndexOutOfRange {
        /// Cluster name.
        name: String,
        /// Index supplied.
        index: usize,
        /// Number of projects available.
        count: usize,
    },
    /// A project would receive two clusters with the same name.
    #[error("cluster name '{name}' is used twice in project {project}")]
    DuplicateName {
        /// Cluster name.
        name: String,
        /// Project that holds the duplicate.
        project: String,
    },
}

/// Assignment of every cluster to exactly one project.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClusterLayout {
    projects: Vec<ProjectClusters>,
}

impl ClusterLayout {
    /// Builds a layout from explicit cluster specs.
    ///
    /// With one project, specs without an index go to that project. With
    /// several projects, every spec must carry `:projectIndex`.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError`] when the projects or specs are inconsistent.
    pub fn new(projects: Vec<String>, specs: &[ClusterSpec]) -> Result<Self, LayoutError> {
        let mut layout = Self::empty(projects)?;
        if specs.is_empty() {
            return Err(LayoutError::NoClusters);
        }
        let count = layout.projects.len();
        for (index, spec) in specs.iter().enumerate() {
            let project_index = match spec.project_index {
                Some(value) => value,
                None if count == 1 => 0,
                None => return Err(LayoutError::MissingProjectIndex(spec.name.clone())),
            };
            if project_index >= count {
                return Err(LayoutError::ProjectIndexOutOfRange {
                    name: spec.name.clone(),
                    index: project_index,
                    count,
                });
            }
            layout.assign(project_index, index, &spec.name)?;
        }
        Ok(layout)
    }

    /// Builds a layout from generated names, spreading clusters round-robin
    /// across projects.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError`] when no projects or names are supplied.
    pub fn round_robin(projects: Vec<String>, names: &[String]) -> Result<Self, LayoutError> {
        let mut layout = Self::empty(projects)?;
        if names.is_empty() {
            return Err(LayoutError::NoClusters);
        }
        let count = layout.projects.len();
        for (index, name) in names.iter().enumerate() {
            let project_index = index.checked_rem(count).unwrap_or_default();
            layout.assign(project_index, index, name)?;
        }
        Ok(layout)
    }

    fn empty(projects: Vec<String>) -> Result<Self, LayoutError> {
        if projects.is_empty() {
            return Err(LayoutError::NoProjects);
        }
        if projects.len() > MAX_PROJECTS {
            return Err(LayoutError::TooManyProjects(projects.len()));
        }
        Ok(Self {
            projects: projects
                .into_iter()
                .enumerate()
                .map(|(index, project)| ProjectClusters {
                    index,
                    project,
                    clusters: Vec::new(),
                })
                .collect(),
        })
    }

    fn assign(&mut self, project_index: usize, index: usize, name: &str) -> Result<(), LayoutError> {
        let Some(entry) = self.projects.get_mut(project_index) else {
            return Err(LayoutError::ProjectIndexOutOfRange {
                name: name.to_owned(),
                index: project_index,
                count: self.projects.len(),
            });
        };
        if entry.clusters.iter().any(|cluster| cluster.name == name) {
            return Err(LayoutError::DuplicateName {
                name: name.to_owned(),
                project: entry.project.clone(),
            });
        }
        entry.clusters.push(Cluster {
            index,
            name: name.to_owned(),
        });
        Ok(())
    }

    /// Projects with their clusters.
    #[must_use]
    pub fn projects(&self) -> &[ProjectClusters] {
        &self.projects
    }

    /// Project names in layout order.
    #[must_use]
    pub fn project_names(&self) -> Vec<String> {
        self.projects.iter().map(|entry| entry.project.clone()).collect()
    }

    /// The project that owns shared network resources.
    #[must_use]
    pub fn host_project(&self) -> &str {
        self.projects
            .first()
            .map_or("", |entry| entry.project.as_str())
    }

    /// Whether clusters span more than one project (Shared VPC layout).
    #[must_use]
    pub fn is_multi_project(&self) -> bool {
        self.projects.len() > 1
    }

    /// Every (project, cluster) pair, ordered by cluster ordinal.
    #[must_use]
    pub fn targets(&self) -> Vec<ClusterTarget> {
        let mut targets: Vec<ClusterTarget> = self
            .projects
            .iter()
            .flat_map(|entry| {
                entry.clusters.iter().map(|cluster| ClusterTarget {
                    project: entry.project.clone(),
                    project_index: entry.index,
                    cluster: cluster.clone(),
                })
            })
            .collect();
        targets.sort_by_key(|target| target.cluster.index);
        targets
    }

    /// Project indices that hold at least one cluster, excluding the host.
    #[must_use]
    pub fn service_projects(&self) -> Vec<&ProjectClusters> {
        self.projects.iter().skip(1).collect()
    }

    /// Distinct project names that hold clusters.
    #[must_use]
    pub fn projects_with_clusters(&self) -> BTreeSet<String> {
        self.projects
            .iter()
            .filter(|entry| !entry.clusters.is_empty())
            .map(|entry| entry.project.clone())
            .collect()
    }
}
