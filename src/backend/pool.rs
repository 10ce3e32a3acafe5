//! Worker-pool backends.
//!
//! [`PoolBackend`] (wire type `concurrent`) executes the whole DAG across a
//! bounded pool of worker threads. The driver walks the tree, awaits every
//! child before submitting its parent, and memoizes results per unique key
//! with shared futures so diamonds execute once. Worker closures carry the
//! `(config, backend spec, force set)` payload and install it into the
//! worker-local context before running the task.
//!
//! [`MultiprocessingBackend`] (wire type `multiprocessing`) shares the same
//! machinery but walks containers sequentially: only map-reduce items fan
//! out across the pool; everything else behaves like the immediate backend.
//!
//! Failure: the first error is returned annotated with the failing task's
//! unique key; siblings already scheduled run to completion, and nothing
//! below a failed branch is ever submitted.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::Config;
use crate::context::{self, ForceSet};
use crate::error::{AqueductError, TaskError};
use crate::resolve;
use crate::task::{gated_requirements, should_prune, ArcTask, Exec};
use crate::tree::WorkTree;

use super::{Backend, BackendSpec};

/// Full-DAG worker pool.
pub struct PoolBackend {
    n_workers: usize,
}

impl PoolBackend {
    pub fn new(n_workers: usize) -> Self {
        Self {
            n_workers: n_workers.max(1),
        }
    }
}

#[async_trait]
impl Backend for PoolBackend {
    fn spec(&self) -> BackendSpec {
        BackendSpec::Concurrent {
            n_workers: self.n_workers,
        }
    }

    async fn run(&self, work: &WorkTree, force: &ForceSet) -> Result<Value, AqueductError> {
        let pool = Pool::start(self.n_workers, self.spec(), force.clone(), true);
        Pool::schedule_tree(&pool, work.clone())
            .await
            .map_err(Into::into)
    }
}

/// Item-parallel pool: immediate semantics except for map-reduce items.
pub struct MultiprocessingBackend {
    n_workers: usize,
}

impl MultiprocessingBackend {
    pub fn new(n_workers: usize) -> Self {
        Self {
            n_workers: n_workers.max(1),
        }
    }
}

#[async_trait]
impl Backend for MultiprocessingBackend {
    fn spec(&self) -> BackendSpec {
        BackendSpec::Multiprocessing {
            n_workers: self.n_workers,
        }
    }

    async fn run(&self, work: &WorkTree, force: &ForceSet) -> Result<Value, AqueductError> {
        let pool = Pool::start(self.n_workers, self.spec(), force.clone(), false);
        Pool::schedule_tree(&pool, work.clone())
            .await
            .map_err(Into::into)
    }
}

/// Result future memoized per unique key; `Shared` hands every dependent the
/// same outcome.
type TaskFuture = Shared<BoxFuture<'static, Result<Value, TaskError>>>;

/// Context snapshot shipped with every worker closure.
#[derive(Clone)]
struct WorkerPayload {
    config: Config,
    spec: BackendSpec,
    force: ForceSet,
}

struct Pool {
    semaphore: Arc<Semaphore>,
    memo: DashMap<String, TaskFuture>,
    payload: WorkerPayload,
    /// Whether sibling tasks fan out; map-reduce items always do.
    parallel_tasks: bool,
}

impl Pool {
    fn start(
        n_workers: usize,
        spec: BackendSpec,
        force: ForceSet,
        parallel_tasks: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(n_workers.max(1))),
            memo: DashMap::new(),
            payload: WorkerPayload {
                config: context::current_config(),
                spec,
                force,
            },
            parallel_tasks,
        })
    }

    fn schedule_tree(
        pool: &Arc<Self>,
        tree: WorkTree,
    ) -> BoxFuture<'static, Result<Value, TaskError>> {
        let pool = pool.clone();
        async move {
            match tree {
                WorkTree::Leaf(value) => Ok(value),
                WorkTree::Task(task) => Pool::schedule_task(&pool, task).await,
                WorkTree::List(items) | WorkTree::Tuple(items) => {
                    let futures: Vec<_> = items
                        .into_iter()
                        .map(|item| Pool::schedule_tree(&pool, item))
                        .collect();
                    let results = if pool.parallel_tasks {
                        futures::future::join_all(futures).await
                    } else {
                        let mut collected = Vec::new();
                        for fut in futures {
                            collected.push(fut.await);
                        }
                        collected
                    };
                    let mut values = Vec::with_capacity(results.len());
                    for result in results {
                        values.push(result?);
                    }
                    Ok(Value::Array(values))
                }
                WorkTree::Map(entries) => {
                    let (keys, futures): (Vec<_>, Vec<_>) = entries
                        .into_iter()
                        .map(|(key, item)| (key, Pool::schedule_tree(&pool, item)))
                        .unzip();
                    let results = if pool.parallel_tasks {
                        futures::future::join_all(futures).await
                    } else {
                        let mut collected = Vec::new();
                        for fut in futures {
                            collected.push(fut.await);
                        }
                        collected
                    };
                    let mut object = Map::new();
                    for (key, result) in keys.into_iter().zip(results) {
                        object.insert(key, result?);
                    }
                    Ok(Value::Object(object))
                }
            }
        }
        .boxed()
    }

    /// Memoized scheduling: the first caller builds the future, everyone
    /// else shares it.
    fn schedule_task(pool: &Arc<Self>, task: ArcTask) -> TaskFuture {
        let key = task.unique_key();
        if let Some(existing) = pool.memo.get(&key) {
            return existing.clone();
        }

        let owner = pool.clone();
        let future = async move { owner.run_task(task).await }.boxed().shared();

        match pool.memo.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(future.clone());
                future
            }
        }
    }

    async fn run_task(self: Arc<Self>, task: ArcTask) -> Result<Value, TaskError> {
        let key = task.unique_key();

        if should_prune(task.as_ref(), false) && task.autoload() {
            let loaded = task.clone();
            return self
                .submit(&key, move || resolve::load_value(&loaded))
                .await;
        }

        // Children complete and their results are inlined before the parent
        // closure is submitted.
        let requirements = match gated_requirements(task.as_ref(), false) {
            Some(req_tree) => Some(Pool::schedule_tree(&self, req_tree).await?),
            None => None,
        };

        let is_map_reduce = matches!(task.exec(), Exec::MapReduce(_));
        if is_map_reduce {
            self.run_map_reduce(task, requirements).await
        } else {
            let executed = task.clone();
            self.submit(&key, move || {
                resolve::execute_and_save(&executed, requirements)
            })
            .await
        }
    }

    /// Distribute `map` calls across workers; reduce on the driver as
    /// results arrive (order unspecified, `reduce` is associative); `post`
    /// runs on the driver.
    async fn run_map_reduce(
        &self,
        task: ArcTask,
        requirements: Option<Value>,
    ) -> Result<Value, TaskError> {
        let key = task.unique_key();
        let reqs = requirements.clone();

        let (items, mut acc) = match task.exec() {
            Exec::MapReduce(mr) => {
                let items = mr.items();
                let acc = mr
                    .accumulator(reqs.as_ref())
                    .map_err(|e| TaskError::new(&key, e))?;
                (items, acc)
            }
            Exec::Simple(_) => {
                return Err(TaskError::new(&key, "task changed execution shape"));
            }
        };
        debug!(task = %key, items = items.len(), "distributing map-reduce items");

        let mut in_flight: FuturesUnordered<_> = items
            .into_iter()
            .map(|item| {
                let task = task.clone();
                let reqs = reqs.clone();
                let key = key.clone();
                self.submit_deferred(move || match task.exec() {
                    Exec::MapReduce(mr) => mr
                        .map(&item, reqs.as_ref())
                        .map_err(|e| TaskError::new(&key, e)),
                    Exec::Simple(_) => {
                        Err(TaskError::new(&key, "task changed execution shape"))
                    }
                })
            })
            .collect();

        while let Some(mapped) = in_flight.next().await {
            let mapped = mapped?;
            acc = match task.exec() {
                Exec::MapReduce(mr) => mr
                    .reduce(mapped, acc, reqs.as_ref())
                    .map_err(|e| TaskError::new(&key, e))?,
                Exec::Simple(_) => {
                    return Err(TaskError::new(&key, "task changed execution shape"));
                }
            };
        }

        let value = match task.exec() {
            Exec::MapReduce(mr) => mr
                .post(acc, reqs.as_ref())
                .map_err(|e| TaskError::new(&key, e))?,
            Exec::Simple(_) => {
                return Err(TaskError::new(&key, "task changed execution shape"));
            }
        };
        resolve::store_result(&task, &value).map_err(|e| resolve::annotate(&key, e))?;
        Ok(value)
    }

    /// Run a closure on a worker thread with the payload installed, bounded
    /// by the pool's permit count.
    async fn submit(
        &self,
        key: &str,
        work: impl FnOnce() -> Result<Value, TaskError> + Send + 'static,
    ) -> Result<Value, TaskError> {
        self.submit_deferred_inner(key.to_string(), work).await
    }

    /// Same as [`Pool::submit`], but returns the future unawaited so callers
    /// can fan out.
    fn submit_deferred(
        &self,
        work: impl FnOnce() -> Result<Value, TaskError> + Send + 'static,
    ) -> impl std::future::Future<Output = Result<Value, TaskError>> {
        self.submit_deferred_inner("worker".to_string(), work)
    }

    fn submit_deferred_inner(
        &self,
        key: String,
        work: impl FnOnce() -> Result<Value, TaskError> + Send + 'static,
    ) -> impl std::future::Future<Output = Result<Value, TaskError>> {
        let semaphore = self.semaphore.clone();
        let payload = self.payload.clone();
        async move {
            let permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| TaskError::new(&key, format!("worker pool closed: {e}")))?;
            let joined = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                context::install_on_worker(
                    payload.config,
                    Some(payload.spec),
                    payload.force,
                );
                work()
            })
            .await;
            match joined {
                Ok(result) => result,
                Err(join_err) => Err(TaskError::new(
                    &key,
                    format!("worker panicked: {join_err}"),
                )),
            }
        }
    }
}
