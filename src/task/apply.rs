//! The `apply` combinator: post-process a task's output without changing
//! its requirements.

use std::sync::Arc;

use serde_json::Value;

use crate::artifact::ArcArtifact;
use crate::error::AqueductError;
use crate::tree::WorkTree;

use super::{run_immediate, ArcTask, Exec, SimpleTask, Task};

/// The function applied on top of a task's result.
pub type ApplyFn = dyn Fn(Value) -> Result<Value, AqueductError> + Send + Sync;

/// A wrapper task whose `run` is `fn(inner.run(…))`.
///
/// Requirements and artifact are the inner task's; loading composes the
/// function with the inner loader, so cached values come back transformed
/// too. The unique key appends `*<fn_name>` so the wrapper and the inner
/// task never collide in memoization tables.
pub struct Applied {
    inner: ArcTask,
    fn_name: String,
    f: Arc<ApplyFn>,
}

/// Wrap `task` so its result passes through `f`.
pub fn apply(
    fn_name: impl Into<String>,
    f: impl Fn(Value) -> Result<Value, AqueductError> + Send + Sync + 'static,
    task: ArcTask,
) -> Arc<Applied> {
    Arc::new(Applied {
        inner: task,
        fn_name: fn_name.into(),
        f: Arc::new(f),
    })
}

impl Task for Applied {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn args(&self) -> Value {
        self.inner.args()
    }

    fn exec(&self) -> Exec<'_> {
        Exec::Simple(self)
    }

    fn requirements(&self) -> Option<WorkTree> {
        self.inner.requirements()
    }

    fn artifact(&self) -> Option<ArcArtifact> {
        self.inner.artifact()
    }

    fn updated_at(&self) -> std::time::SystemTime {
        self.inner.updated_at()
    }

    fn autoload(&self) -> bool {
        self.inner.autoload()
    }

    // The inner task owns its artifact; the wrapper never writes a
    // transformed value over it.
    fn autosave(&self) -> bool {
        false
    }

    fn force(&self) -> bool {
        self.inner.force()
    }

    fn config_section(&self) -> Option<String> {
        self.inner.config_section()
    }

    fn unique_key(&self) -> String {
        format!("{}*{}", self.inner.unique_key(), self.fn_name)
    }

    fn load(&self) -> Result<Value, AqueductError> {
        let loaded = self.inner.load()?;
        (self.f)(loaded)
    }
}

impl SimpleTask for Applied {
    fn run(&self, requirements: Option<Value>) -> Result<Value, AqueductError> {
        let value = run_immediate(self.inner.as_ref(), requirements)?;
        (self.f)(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::memory::{InMemoryArtifact, MemoryStore};
    use crate::task::testing::{Constant, SumOfSquares};
    use serde_json::json;

    fn double(value: Value) -> Result<Value, AqueductError> {
        Ok(json!(value.as_i64().unwrap_or(0) * 2))
    }

    #[test]
    fn run_composes_the_function() {
        let wrapped = apply("double", double, Constant::new(json!(21)));
        assert_eq!(run_immediate(wrapped.as_ref(), None).unwrap(), json!(42));
    }

    #[test]
    fn key_appends_the_function_name() {
        let inner = Constant::new(json!(1));
        let inner_key = inner.unique_key();
        let wrapped = apply("double", double, inner);
        assert_eq!(
            crate::task::Task::unique_key(wrapped.as_ref()),
            format!("{inner_key}*double")
        );
    }

    #[test]
    fn wrapping_a_map_reduce_runs_its_fold() {
        let wrapped = apply(
            "double",
            double,
            std::sync::Arc::new(SumOfSquares {
                items: vec![1, 2, 3],
            }),
        );
        assert_eq!(run_immediate(wrapped.as_ref(), None).unwrap(), json!(28));
    }

    #[test]
    fn load_composes_with_the_inner_loader() {
        let _serial = crate::context::test_lock();
        let artifact = InMemoryArtifact::shared("v", MemoryStore::new());
        artifact.save(&json!(10)).unwrap();
        let inner = Constant::with_artifact(json!(10), artifact);
        let wrapped = apply("double", double, inner);
        assert_eq!(crate::task::Task::load(wrapped.as_ref()).unwrap(), json!(20));
    }
}
