//! Work trees and the tree walker.
//!
//! A work tree is a possibly-nested container of tasks and plain values:
//! lists, fixed-arity tuples, insertion-ordered string maps, task nodes and
//! leaves. This module is the single place that knows the container set;
//! backends never match on containers themselves. The walker offers mapping,
//! left-fold reduction and dependency-aware resolution, always rebuilding
//! results in the input's shape.

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::error::AqueductError;
use crate::task::{gated_requirements, ArcTask, Task};

/// Expansion depth bound. A chain of requirements deeper than this is
/// reported as a cycle.
pub(crate) const MAX_DEPTH: usize = 512;

/// A recursively-defined unit of schedulable work.
#[derive(Clone)]
pub enum WorkTree {
    /// A task node.
    Task(ArcTask),
    /// An ordered, growable sequence.
    List(Vec<WorkTree>),
    /// A fixed-arity sequence; rebuilt with the same arity.
    Tuple(Vec<WorkTree>),
    /// String-keyed children, traversed in insertion order.
    Map(IndexMap<String, WorkTree>),
    /// A plain value passed through untouched.
    Leaf(Value),
}

impl WorkTree {
    pub fn task(task: impl Task + 'static) -> Self {
        WorkTree::Task(std::sync::Arc::new(task))
    }

    pub fn leaf(value: impl Into<Value>) -> Self {
        WorkTree::Leaf(value.into())
    }

    /// Replace every task node through `f`, preserving shape.
    pub fn map_tasks(
        &self,
        f: &mut dyn FnMut(&ArcTask) -> Result<WorkTree, AqueductError>,
    ) -> Result<WorkTree, AqueductError> {
        match self {
            WorkTree::Task(task) => f(task),
            WorkTree::List(items) => Ok(WorkTree::List(
                items
                    .iter()
                    .map(|item| item.map_tasks(f))
                    .collect::<Result<_, _>>()?,
            )),
            WorkTree::Tuple(items) => Ok(WorkTree::Tuple(
                items
                    .iter()
                    .map(|item| item.map_tasks(f))
                    .collect::<Result<_, _>>()?,
            )),
            WorkTree::Map(entries) => {
                let mut mapped = IndexMap::with_capacity(entries.len());
                for (key, item) in entries {
                    mapped.insert(key.clone(), item.map_tasks(f)?);
                }
                Ok(WorkTree::Map(mapped))
            }
            WorkTree::Leaf(value) => Ok(WorkTree::Leaf(value.clone())),
        }
    }

    /// Left-fold over task nodes in natural traversal order: lists and
    /// tuples by index, maps by insertion order.
    pub fn reduce_tasks<A>(&self, init: A, f: &mut dyn FnMut(A, &ArcTask) -> A) -> A {
        match self {
            WorkTree::Task(task) => f(init, task),
            WorkTree::List(items) | WorkTree::Tuple(items) => items
                .iter()
                .fold(init, |acc, item| item.reduce_tasks(acc, f)),
            WorkTree::Map(entries) => entries
                .values()
                .fold(init, |acc, item| item.reduce_tasks(acc, f)),
            WorkTree::Leaf(_) => init,
        }
    }

    /// All task nodes in traversal order.
    pub fn tasks(&self) -> Vec<ArcTask> {
        self.reduce_tasks(Vec::new(), &mut |mut acc, task| {
            acc.push(task.clone());
            acc
        })
    }

    /// Depth-first dependency resolution.
    ///
    /// For every task node: expand its requirements through the cache gate,
    /// recursively resolve them, then hand the task and its resolved
    /// requirements (or `None` when absent or pruned) to `visit`. Container
    /// nodes are rebuilt in shape with each task replaced by `visit`'s
    /// value; leaves pass through.
    pub fn resolve(
        &self,
        visit: &mut dyn FnMut(&ArcTask, Option<Value>) -> Result<Value, AqueductError>,
        ignore_cache: bool,
    ) -> Result<Value, AqueductError> {
        self.resolve_at(visit, ignore_cache, 0)
    }

    fn resolve_at(
        &self,
        visit: &mut dyn FnMut(&ArcTask, Option<Value>) -> Result<Value, AqueductError>,
        ignore_cache: bool,
        depth: usize,
    ) -> Result<Value, AqueductError> {
        match self {
            WorkTree::Task(task) => {
                if depth >= MAX_DEPTH {
                    return Err(AqueductError::CycleDetected(task.unique_key()));
                }
                match gated_requirements(task.as_ref(), ignore_cache) {
                    Some(requirements) => {
                        let resolved =
                            requirements.resolve_at(visit, ignore_cache, depth + 1)?;
                        visit(task, Some(resolved))
                    }
                    None => visit(task, None),
                }
            }
            WorkTree::List(items) | WorkTree::Tuple(items) => {
                let resolved: Result<Vec<_>, _> = items
                    .iter()
                    .map(|item| item.resolve_at(visit, ignore_cache, depth))
                    .collect();
                Ok(Value::Array(resolved?))
            }
            WorkTree::Map(entries) => {
                let mut resolved = Map::new();
                for (key, item) in entries {
                    resolved.insert(key.clone(), item.resolve_at(visit, ignore_cache, depth)?);
                }
                Ok(Value::Object(resolved))
            }
            WorkTree::Leaf(value) => Ok(value.clone()),
        }
    }
}

impl From<ArcTask> for WorkTree {
    fn from(task: ArcTask) -> Self {
        WorkTree::Task(task)
    }
}

impl From<Value> for WorkTree {
    fn from(value: Value) -> Self {
        WorkTree::Leaf(value)
    }
}

impl<T: Into<WorkTree>> From<Vec<T>> for WorkTree {
    fn from(items: Vec<T>) -> Self {
        WorkTree::List(items.into_iter().map(Into::into).collect())
    }
}
