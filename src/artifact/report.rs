//! Artifact statistics over a task tree.

use indexmap::IndexMap;

use crate::task::ArcTask;
use crate::tree::WorkTree;

use super::ArcArtifact;

/// Per-description aggregate of artifacts found in a tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactStatistics {
    pub count: usize,
    pub in_cache: usize,
    pub stored_bytes: u64,
}

/// Walk a work tree (ignoring the cache gate, so pruned subtrees are still
/// counted) and aggregate artifact statistics grouped by task class name.
pub fn artifact_report(work: &WorkTree) -> IndexMap<String, ArtifactStatistics> {
    let mut report: IndexMap<String, ArtifactStatistics> = IndexMap::new();
    let mut visit = |task: &ArcTask, _reqs: Option<serde_json::Value>| {
        if let Some(artifact) = task.artifact() {
            accumulate(&mut report, &task.name(), &artifact);
        }
        Ok(serde_json::Value::Null)
    };
    // Errors cannot occur in the visitor; a cycle bound error leaves the
    // partial report, which is the best available answer.
    let _ = work.resolve(&mut visit, true);
    report
}

fn accumulate(
    report: &mut IndexMap<String, ArtifactStatistics>,
    task_name: &str,
    artifact: &ArcArtifact,
) {
    let stats = report.entry(task_name.to_string()).or_default();
    stats.count += 1;
    if artifact.exists() {
        stats.in_cache += 1;
        stats.stored_bytes += artifact.size();
    }
}

/// Every filesystem path reachable from the artifacts of a tree, including
/// composite children, deduplicated and sorted.
pub fn artifact_paths(work: &WorkTree, max_depth: Option<usize>) -> Vec<std::path::PathBuf> {
    let mut paths = std::collections::BTreeSet::new();
    collect_paths(work, max_depth.unwrap_or(usize::MAX), &mut paths);
    paths.into_iter().collect()
}

fn collect_paths(
    work: &WorkTree,
    depth_left: usize,
    paths: &mut std::collections::BTreeSet<std::path::PathBuf>,
) {
    for task in work.tasks() {
        if let Some(artifact) = task.artifact() {
            push_artifact_paths(&artifact, paths);
        }
        if depth_left > 0 {
            if let Some(requirements) = task.requirements() {
                collect_paths(&requirements, depth_left - 1, paths);
            }
        }
    }
}

fn push_artifact_paths(
    artifact: &ArcArtifact,
    paths: &mut std::collections::BTreeSet<std::path::PathBuf>,
) {
    if let Some(path) = artifact.path() {
        paths.insert(path.to_path_buf());
    }
    if let Some(children) = artifact.children() {
        for child in children {
            push_artifact_paths(child, paths);
        }
    }
}
