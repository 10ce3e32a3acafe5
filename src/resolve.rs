//! The resolver: cache probing, requirement expansion and backend
//! invocation for a root work item.
//!
//! `run_on` is the single entry point: it binds the force set and the
//! backend into the ambient context, hands the work tree to the backend,
//! and restores the prior context when it returns, normally or not. The
//! save/load policy lives here too so every backend shares it.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::{self, ArcBackend, ImmediateBackend};
use crate::context::{self, Context, ForceSet};
use crate::error::{AqueductError, TaskError};
use crate::task::{self, ArcTask};
use crate::tree::WorkTree;

/// Execute a work tree on the default backend with nothing forced.
pub async fn run(work: &WorkTree) -> Result<Value, AqueductError> {
    let backend = backend::default_backend()?;
    run_on(&backend, work, ForceSet::new()).await
}

/// Execute a work tree on a specific backend.
///
/// Installs `(config, backend, force)` into the ambient context for the
/// duration of the call; the prior context is restored on exit even when the
/// run fails.
pub async fn run_on(
    backend: &ArcBackend,
    work: &WorkTree,
    force: ForceSet,
) -> Result<Value, AqueductError> {
    let context = Context {
        config: context::current_config(),
        backend: Some(backend.clone()),
        backend_spec: Some(backend.spec()),
        force: force.clone(),
    };
    let _guard = context::install(context);
    info!(backend = %backend.spec(), "running work tree");
    backend.run(work, &force).await
}

/// Execute a work tree from inside a running task.
///
/// Tasks run on worker threads; this resolves the ambient backend (the
/// handle when present, else one reconstructed from the serialized spec) and
/// blocks on it. On a distributed worker this makes nested runs execute
/// against the same cluster that scheduled the outer task.
pub fn run_nested(work: &WorkTree) -> Result<Value, AqueductError> {
    let ctx = context::current();
    let backend: ArcBackend = match ctx.backend {
        Some(handle) => handle,
        None => match &ctx.backend_spec {
            Some(spec) => backend::resolve_backend_from_spec(spec)?,
            None => Arc::new(ImmediateBackend),
        },
    };
    let force = ctx.force;
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle.block_on(run_on(&backend, work, force)),
        Err(_) => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(run_on(&backend, work, force)),
    }
}

/// Execute one task with immediate semantics and apply the save policy.
pub fn execute_and_save(task: &ArcTask, requirements: Option<Value>) -> Result<Value, TaskError> {
    let key = task.unique_key();
    debug!(task = %key, "executing");
    let value = task::run_immediate(task.as_ref(), requirements)
        .map_err(|e| annotate(&key, e))?;
    store_result(task, &value).map_err(|e| annotate(&key, e))?;
    Ok(value)
}

/// The save policy: a present artifact with `autosave` stores
/// every non-null result; a null result from a task that owns an artifact is
/// expected to have produced it as a side effect, which `check_storage`
/// verifies.
pub fn store_result(task: &ArcTask, value: &Value) -> Result<(), AqueductError> {
    let Some(artifact) = task.artifact() else {
        return Ok(());
    };

    if !value.is_null() {
        if task.autosave() {
            artifact
                .save(value)
                .map_err(|e| TaskError::new(task.unique_key(), e))?;
        }
        return Ok(());
    }

    if !artifact.exists() {
        let check = context::current_config()
            .get("aqueduct.check_storage")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if check {
            return Err(AqueductError::ArtifactMissing(task.unique_key()));
        }
        warn!(
            task = %task.unique_key(),
            artifact = %artifact.describe(),
            "task completed without creating its artifact"
        );
    }
    Ok(())
}

/// Read a pruned task's value from its artifact.
pub fn load_value(task: &ArcTask) -> Result<Value, TaskError> {
    let key = task.unique_key();
    info!(task = %key, "loading from cache");
    task.load().map_err(|e| annotate(&key, e))
}

/// Load when the cache gate prunes and the task autoloads, execute
/// otherwise. Shared by the immediate and pool backends.
pub fn execute_or_load(task: &ArcTask, requirements: Option<Value>) -> Result<Value, TaskError> {
    if task::should_prune(task.as_ref(), false) && task.autoload() {
        load_value(task)
    } else {
        execute_and_save(task, requirements)
    }
}

pub(crate) fn annotate(key: &str, err: AqueductError) -> TaskError {
    match err {
        // Keep the original failing key when a nested task already failed.
        AqueductError::TaskExecution(inner) => inner,
        other => TaskError::new(key, other),
    }
}

/// Count the tasks a run would execute, grouped by class name, with
/// duplicate instances (same unique key) collapsed.
pub fn count_tasks_to_run(
    work: &WorkTree,
    ignore_cache: bool,
) -> indexmap::IndexMap<String, usize> {
    let mut seen: std::collections::HashMap<String, std::collections::HashSet<String>> =
        std::collections::HashMap::new();
    let mut order: Vec<String> = Vec::new();

    let mut visit = |task: &ArcTask, _reqs: Option<Value>| {
        if ignore_cache || !task::is_cached(task.as_ref()) {
            let name = task.name();
            let keys = seen.entry(name.clone()).or_insert_with(|| {
                order.push(name.clone());
                std::collections::HashSet::new()
            });
            keys.insert(task.unique_key());
        }
        Ok(Value::Null)
    };
    let _ = work.resolve(&mut visit, ignore_cache);

    let mut counts = indexmap::IndexMap::new();
    for name in order {
        let n = seen.get(&name).map(|keys| keys.len()).unwrap_or(0);
        counts.insert(name, n);
    }
    counts
}

/// Render the dependency tree a run would expand, one task per line,
/// indented by depth. Cached subtrees are pruned exactly as `run` would
/// prune them.
pub fn render_task_tree(work: &WorkTree) -> String {
    let mut out = String::new();
    render_level(work, 0, &mut out);
    out
}

fn render_level(work: &WorkTree, indent: usize, out: &mut String) {
    for task in work.tasks() {
        out.push_str(&"    ".repeat(indent));
        out.push_str(&task.unique_key());
        out.push('\n');
        if let Some(requirements) = task::gated_requirements(task.as_ref(), false) {
            render_level(&requirements, indent + 1, out);
        }
    }
}

/// The class names of `target` and every task in `work` that (transitively)
/// requires it. Passing the result as the force set re-executes the target
/// and its dependents while still loading everything below it from cache.
pub fn downstream_of(work: &WorkTree, target: &str) -> ForceSet {
    let mut marked = ForceSet::new();
    let mut memo: std::collections::HashMap<String, bool> = std::collections::HashMap::new();
    for task in work.tasks() {
        depends_on_target(&task, target, &mut marked, &mut memo, 0);
    }
    marked
}

fn depends_on_target(
    task: &ArcTask,
    target: &str,
    marked: &mut ForceSet,
    memo: &mut std::collections::HashMap<String, bool>,
    depth: usize,
) -> bool {
    let key = task.unique_key();
    if let Some(&known) = memo.get(&key) {
        return known;
    }
    if depth >= crate::tree::MAX_DEPTH {
        return false;
    }

    let mut hit = task.name() == target;
    // The full graph is inspected, ignoring the cache gate: forcing must
    // reach dependents whose subtrees are currently pruned.
    if let Some(requirements) = task.requirements() {
        for child in requirements.tasks() {
            if depends_on_target(&child, target, marked, memo, depth + 1) {
                hit = true;
            }
        }
    }

    if hit {
        marked.insert(task.name());
    }
    memo.insert(key, hit);
    hit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::memory::{InMemoryArtifact, MemoryStore};
    use crate::artifact::Artifact;
    use crate::task::testing::Constant;
    use crate::task::{Exec, SimpleTask, Task};
    use serde_json::json;

    struct Chain {
        name: &'static str,
        below: Option<ArcTask>,
        artifact: Option<crate::artifact::ArcArtifact>,
    }

    impl Task for Chain {
        fn name(&self) -> String {
            self.name.into()
        }
        fn exec(&self) -> Exec<'_> {
            Exec::Simple(self)
        }
        fn requirements(&self) -> Option<WorkTree> {
            self.below.clone().map(WorkTree::Task)
        }
        fn artifact(&self) -> Option<crate::artifact::ArcArtifact> {
            self.artifact.clone()
        }
    }

    impl SimpleTask for Chain {
        fn run(&self, reqs: Option<Value>) -> Result<Value, AqueductError> {
            Ok(reqs.unwrap_or(Value::Null))
        }
    }

    fn chain(store: &MemoryStore) -> ArcTask {
        let leaf: ArcTask = Arc::new(Chain {
            name: "Leaf",
            below: None,
            artifact: Some(InMemoryArtifact::shared("leaf", store.clone())),
        });
        let mid: ArcTask = Arc::new(Chain {
            name: "Mid",
            below: Some(leaf),
            artifact: Some(InMemoryArtifact::shared("mid", store.clone())),
        });
        Arc::new(Chain {
            name: "Root",
            below: Some(mid),
            artifact: Some(InMemoryArtifact::shared("root", store.clone())),
        })
    }

    #[test]
    fn downstream_of_marks_target_and_ancestors() {
        let store = MemoryStore::new();
        let tree = WorkTree::Task(chain(&store));
        let forced = downstream_of(&tree, "Mid");
        assert!(forced.contains("Mid"));
        assert!(forced.contains("Root"));
        assert!(!forced.contains("Leaf"));
    }

    #[test]
    fn count_collapses_duplicate_instances() {
        let shared = Constant::new(json!(7));
        let tree = WorkTree::List(vec![
            WorkTree::Task(shared.clone()),
            WorkTree::Task(shared.clone()),
            WorkTree::Task(Constant::new(json!(8))),
        ]);
        let counts = count_tasks_to_run(&tree, false);
        assert_eq!(counts["Constant"], 2);
    }

    #[test]
    fn render_tree_prunes_cached_subtrees() {
        let _serial = crate::context::test_lock();
        let store = MemoryStore::new();
        let root = chain(&store);

        let rendered = render_task_tree(&WorkTree::Task(root.clone()));
        assert!(rendered.contains("Root"));
        assert!(rendered.contains("Leaf"));

        // Cache Mid: its subtree disappears from the rendering.
        InMemoryArtifact::new("mid", store.clone())
            .save(&json!(0))
            .unwrap();
        let rendered = render_task_tree(&WorkTree::Task(root));
        assert!(rendered.contains("Mid"));
        assert!(!rendered.contains("Leaf"));
    }

    #[test]
    fn store_result_skips_null_and_warns() {
        let _serial = crate::context::test_lock();
        let store = MemoryStore::new();
        let artifact = InMemoryArtifact::shared("side", store.clone());
        let task: ArcTask = Constant::with_artifact(Value::Null, artifact.clone());

        // Null result, artifact absent, check_storage off: warning only.
        store_result(&task, &Value::Null).unwrap();
        assert!(!artifact.exists());

        // With the flag on it becomes an error.
        let mut cfg = crate::config::Config::new();
        cfg.set("aqueduct.check_storage", json!(true));
        let _guard = context::install(Context {
            config: cfg,
            ..Context::default()
        });
        assert!(store_result(&task, &Value::Null).is_err());
    }

    #[test]
    fn execute_or_load_prefers_fresh_cache() {
        let _serial = crate::context::test_lock();
        let store = MemoryStore::new();
        let artifact = InMemoryArtifact::shared("v", store.clone());
        let task: ArcTask = Constant::with_artifact(json!(3), artifact.clone());

        // First call executes and saves.
        assert_eq!(execute_or_load(&task, None).unwrap(), json!(3));
        assert!(artifact.exists());

        // Second call loads; the run counter stays put.
        let constant = Constant::with_artifact(json!(3), artifact.clone());
        assert_eq!(
            execute_or_load(&(constant.clone() as ArcTask), None).unwrap(),
            json!(3)
        );
        assert_eq!(constant.runs.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
