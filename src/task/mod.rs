//! Task descriptors.
//!
//! A task is an immutable value describing one unit of work: identity
//! (class name + content-hashed arguments), requirements (a [`WorkTree`] of
//! other tasks), an optional [`Artifact`](crate::artifact::Artifact) gating
//! re-execution, and an execute function. Two execution shapes exist, and
//! backends dispatch on the closed [`Exec`] variant set:
//!
//! - [`SimpleTask`]: `run(requirements) -> value`
//! - [`MapReduceTask`]: `items` / `map` / `accumulator` / `reduce` / `post`,
//!   semantically a fold of `reduce` over `map(items)` seeded with
//!   `accumulator`, then `post`. `reduce` must be associative: parallel
//!   backends re-parenthesize.

pub mod apply;
pub mod bind;
pub mod repeat;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::artifact::ArcArtifact;
use crate::config::Config;
use crate::context;
use crate::error::AqueductError;
use crate::tree::WorkTree;

pub use apply::{apply, Applied};
pub use bind::{bind_args, Param};
pub use repeat::Repeat;

/// Shared handle to a task descriptor.
pub type ArcTask = Arc<dyn Task>;

/// The closed set of execution shapes.
pub enum Exec<'a> {
    Simple(&'a dyn SimpleTask),
    MapReduce(&'a dyn MapReduceTask),
}

impl std::fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.args())
    }
}

/// Base descriptor shared by every task kind.
///
/// Implementors provide identity and structure here and the execute function
/// through [`SimpleTask`] or [`MapReduceTask`], then point [`Task::exec`] at
/// themselves.
pub trait Task: Send + Sync {
    /// Stable class name; the first half of the unique key.
    fn name(&self) -> String;

    /// The bound arguments in canonical-friendly form. Task-valued arguments
    /// should be rendered with [`crate::value::task_arg`].
    fn args(&self) -> Value {
        Value::Null
    }

    /// Which execution shape this task has.
    fn exec(&self) -> Exec<'_>;

    /// The tasks that must resolve before this one runs. The resolved tree,
    /// collapsed to values in the original shape, is passed to the execute
    /// function.
    fn requirements(&self) -> Option<WorkTree> {
        None
    }

    /// Where the result is cached, if anywhere.
    fn artifact(&self) -> Option<ArcArtifact> {
        None
    }

    /// Artifacts last modified before this instant are stale.
    fn updated_at(&self) -> SystemTime {
        UNIX_EPOCH
    }

    /// Write the result to the artifact after a successful run.
    fn autosave(&self) -> bool {
        true
    }

    /// Read the artifact instead of running when the cache gate prunes.
    fn autoload(&self) -> bool {
        true
    }

    /// Per-instance cache bypass.
    fn force(&self) -> bool {
        false
    }

    /// Configuration section for argument defaulting. `None` uses the class
    /// name as the section path.
    fn config_section(&self) -> Option<String> {
        None
    }

    /// `"<ClassName>-<hex_hash>"`, the memoization and graph-node key.
    fn unique_key(&self) -> String {
        crate::value::unique_key(&self.name(), &self.args())
    }

    /// Read this task's value back from its artifact. Override to compose
    /// decoding with post-processing.
    fn load(&self) -> Result<Value, AqueductError> {
        match self.artifact() {
            Some(artifact) => Ok(artifact.load()?),
            None => Err(AqueductError::other(format!(
                "task {} has no artifact to load",
                self.unique_key()
            ))),
        }
    }

    /// This task's sub-configuration, resolved from the ambient config.
    fn config(&self) -> Config {
        let section = self.config_section().unwrap_or_else(|| self.name());
        context::current_config().section(&section)
    }
}

/// A task that produces its value in a single call.
pub trait SimpleTask: Task {
    fn run(&self, requirements: Option<Value>) -> Result<Value, AqueductError>;
}

/// A task whose value is a reduction over independently-mapped items.
///
/// `reduce` must be associative; backends are free to re-parenthesize and do
/// not guarantee left-to-right order.
pub trait MapReduceTask: Task {
    /// The input items, in a stable order.
    fn items(&self) -> Vec<Value>;

    fn map(&self, item: &Value, requirements: Option<&Value>) -> Result<Value, AqueductError>;

    /// Seed of the reduction.
    fn accumulator(&self, requirements: Option<&Value>) -> Result<Value, AqueductError>;

    fn reduce(
        &self,
        lhs: Value,
        rhs: Value,
        requirements: Option<&Value>,
    ) -> Result<Value, AqueductError>;

    /// Runs once after all reductions complete, on the final accumulator.
    fn post(&self, acc: Value, requirements: Option<&Value>) -> Result<Value, AqueductError> {
        let _ = requirements;
        Ok(acc)
    }
}

/// Is there a fresh artifact for this task?
///
/// Fresh means the artifact exists and its `last_modified` (unknown counts
/// as oldest) is at or after the task's `updated_at`.
pub fn is_cached(task: &dyn Task) -> bool {
    match task.artifact() {
        None => false,
        Some(artifact) => {
            let modified = artifact.last_modified().unwrap_or(UNIX_EPOCH);
            artifact.exists() && modified >= task.updated_at()
        }
    }
}

/// The cache gate: cached, not forced (neither per-class nor per-instance),
/// and the caller is not ignoring the cache.
pub fn should_prune(task: &dyn Task, ignore_cache: bool) -> bool {
    is_cached(task) && !context::is_forced(&task.name()) && !task.force() && !ignore_cache
}

/// Requirements, gated: a pruned task exposes no requirements at all, which
/// cuts its whole subtree out of the graph.
pub fn gated_requirements(task: &dyn Task, ignore_cache: bool) -> Option<WorkTree> {
    if should_prune(task, ignore_cache) {
        None
    } else {
        task.requirements()
    }
}

/// Execute a task with immediate semantics, dispatching on its shape.
///
/// For map-reduce tasks this performs the sequential left fold; parallel
/// backends lay the same computation out across workers instead of calling
/// this.
pub fn run_immediate(task: &dyn Task, requirements: Option<Value>) -> Result<Value, AqueductError> {
    match task.exec() {
        Exec::Simple(simple) => simple.run(requirements),
        Exec::MapReduce(mr) => {
            let reqs = requirements.as_ref();
            let mut acc = mr.accumulator(reqs)?;
            for item in mr.items() {
                let mapped = mr.map(&item, reqs)?;
                acc = mr.reduce(mapped, acc, reqs)?;
            }
            mr.post(acc, reqs)
        }
    }
}
