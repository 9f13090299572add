//! Cluster name generation.

/// Prefix shared by every generated cluster name.
pub const CLUSTER_NAME_PREFIX: &str = "kt2";

/// Longest run-id segment kept in generated names. GKE caps cluster names at
/// 40 characters; this leaves room for the prefix and ordinal suffix.
pub const MAX_RUN_ID_SEGMENT: usize = 33;

/// Generates `num_clusters` names of the form `kt2-<run-id>-<n>` (1-based),
/// or `kt2-<n>` when `run_id` is empty.
#[must_use]
pub fn generate_cluster_names(num_clusters: usize, run_id: &str) -> Vec<String> {
    let segment: String = run_id.chars().take(MAX_RUN_ID_SEGMENT).collect();
    (1..=num_clusters)
        .map(|ordinal| {
            if segment.is_empty() {
                format!("{CLUSTER_NAME_PREFIX}-{ordinal}")
            } else {
                format!("{CLUSTER_NAME_PREFIX}-{segment}-{ordinal}")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn names_include_run_id() {
        assert_eq!(
            generate_cluster_names(3, "foobar"),
            vec!["kt2-foobar-1", "kt2-foobar-2", "kt2-foobar-3"]
        );
    }

    #[rstest]
    fn names_omit_empty_run_id() {
        assert_eq!(generate_cluster_names(3, ""), vec!["kt2-1", "kt2-2", "kt2-3"]);
    }

    #[rstest]
    fn zero_clusters_yield_no_names() {
        assert!(generate_cluster_names(0, "foobar").is_empty());
    }

    #[rstest]
    fn long_run_ids_are_truncated() {
        let run_id = "a".repeat(40);
        let names = generate_cluster_names(1, &run_id);
        assert_eq!(names, vec![format!("kt2-{}-1", "a".repeat(33))]);
    }
}
