//! Shared fixtures for integration tests.

// Each test binary uses a different subset of these fixtures.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value};

use aqueduct::artifact::ArcArtifact;
use aqueduct::{AqueductError, Exec, SimpleTask, Task, WorkTree};

/// Tests install process-wide context; keep them serial per test binary.
pub fn serial() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

type ComputeFn = dyn Fn(Option<Value>) -> Result<Value, AqueductError> + Send + Sync;

/// A fully instrumented task: counts `run` and `requirements` calls,
/// carries an optional artifact and an arbitrary compute function.
pub struct Probe {
    name: String,
    args: Value,
    below: Option<WorkTree>,
    artifact: Option<ArcArtifact>,
    pub runs: Arc<AtomicUsize>,
    pub requirement_calls: Arc<AtomicUsize>,
    compute: Arc<ComputeFn>,
}

impl Probe {
    pub fn computed(
        name: &str,
        args: Value,
        below: Option<WorkTree>,
        compute: impl Fn(Option<Value>) -> Result<Value, AqueductError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::build(name, args, below, None, compute)
    }

    pub fn build(
        name: &str,
        args: Value,
        below: Option<WorkTree>,
        artifact: Option<ArcArtifact>,
        compute: impl Fn(Option<Value>) -> Result<Value, AqueductError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            args,
            below,
            artifact,
            runs: Arc::new(AtomicUsize::new(0)),
            requirement_calls: Arc::new(AtomicUsize::new(0)),
            compute: Arc::new(compute),
        })
    }

    pub fn with_artifact(&self, artifact: ArcArtifact) -> Arc<Self> {
        Arc::new(Self {
            name: self.name.clone(),
            args: self.args.clone(),
            below: self.below.clone(),
            artifact: Some(artifact),
            runs: self.runs.clone(),
            requirement_calls: self.requirement_calls.clone(),
            compute: self.compute.clone(),
        })
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn requirement_count(&self) -> usize {
        self.requirement_calls.load(Ordering::SeqCst)
    }
}

impl Task for Probe {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn args(&self) -> Value {
        self.args.clone()
    }

    fn exec(&self) -> Exec<'_> {
        Exec::Simple(self)
    }

    fn requirements(&self) -> Option<WorkTree> {
        if self.below.is_some() {
            self.requirement_calls.fetch_add(1, Ordering::SeqCst);
        }
        self.below.clone()
    }

    fn artifact(&self) -> Option<ArcArtifact> {
        self.artifact.clone()
    }
}

impl SimpleTask for Probe {
    fn run(&self, requirements: Option<Value>) -> Result<Value, AqueductError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        (self.compute)(requirements)
    }
}

/// Scenario fixture: `A -> {B, C}`, both depending on the same `D() = 7`.
/// `A` returns `B + C`, `B` returns `d + 1`, `C` returns `d * 2`.
pub struct Diamond {
    pub a: Arc<Probe>,
    pub d: Arc<Probe>,
}

pub fn diamond(tag: &str) -> Diamond {
    // Identity includes the tag so tests in one process never share
    // memoized results.
    let d = Probe::computed("DiamondD", json!({ "tag": tag }), None, |_| Ok(json!(7)));

    let b = Probe::computed(
        "DiamondB",
        json!({ "tag": tag }),
        Some(WorkTree::Task(d.clone())),
        |reqs| {
            let d = reqs.and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(json!(d + 1))
        },
    );
    let c = Probe::computed(
        "DiamondC",
        json!({ "tag": tag }),
        Some(WorkTree::Task(d.clone())),
        |reqs| {
            let d = reqs.and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(json!(d * 2))
        },
    );

    let mut reqs = indexmap::IndexMap::new();
    reqs.insert("B".to_string(), WorkTree::Task(b as aqueduct::ArcTask));
    reqs.insert("C".to_string(), WorkTree::Task(c as aqueduct::ArcTask));

    let a = Probe::computed(
        "DiamondA",
        json!({ "tag": tag }),
        Some(WorkTree::Map(reqs)),
        |reqs| {
            let reqs = reqs.unwrap_or(Value::Null);
            let b = reqs["B"].as_i64().unwrap_or(0);
            let c = reqs["C"].as_i64().unwrap_or(0);
            Ok(json!(b + c))
        },
    );

    Diamond { a, d }
}

/// Scenario fixture: sum of squares as a map-reduce task.
pub struct SquareSum {
    pub items: Vec<i64>,
    pub tag: String,
}

impl Task for SquareSum {
    fn name(&self) -> String {
        "SquareSum".into()
    }

    fn args(&self) -> Value {
        json!({ "items": self.items, "tag": self.tag })
    }

    fn exec(&self) -> Exec<'_> {
        Exec::MapReduce(self)
    }
}

impl aqueduct::MapReduceTask for SquareSum {
    fn items(&self) -> Vec<Value> {
        self.items.iter().map(|i| json!(i)).collect()
    }

    fn map(&self, item: &Value, _reqs: Option<&Value>) -> Result<Value, AqueductError> {
        let x = item.as_i64().unwrap_or(0);
        Ok(json!(x * x))
    }

    fn accumulator(&self, _reqs: Option<&Value>) -> Result<Value, AqueductError> {
        Ok(json!(0))
    }

    fn reduce(
        &self,
        lhs: Value,
        rhs: Value,
        _reqs: Option<&Value>,
    ) -> Result<Value, AqueductError> {
        Ok(json!(lhs.as_i64().unwrap_or(0) + rhs.as_i64().unwrap_or(0)))
    }
}
