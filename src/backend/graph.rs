//! Distributed-graph backend.
//!
//! The whole DAG is materialized as an explicit graph: a map from node key
//! to a computation `(op, inputs…)`. Tasks contribute one node keyed by
//! their unique key; containers contribute rebuild nodes; cached tasks
//! contribute load-only nodes; an autosaved task gains a follow-on
//! save-and-return node which becomes its true output key. Map-reduce tasks
//! expand into a balanced binary reduce tree with a logarithmic critical
//! path.
//!
//! Before execution the graph goes through two correctness-preserving
//! rewrites, both flag-guarded: fusion of single-consumer task chains into
//! composite nodes, and inlining of cheap container-rebuild nodes at their
//! call sites.
//!
//! Execution is delegated to a [`GraphScheduler`]. The bundled
//! [`LocalGraphScheduler`] runs the graph on a bounded pool of local worker
//! threads; remote schedulers are provided by the embedding application.
//! Every node evaluation first reinstalls `(config, backend spec, force)`
//! into the worker-local context, so tasks that spawn nested runs execute
//! them against the same cluster.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::config::Config;
use crate::context::{self, ForceSet};
use crate::error::{AqueductError, TaskError};
use crate::resolve;
use crate::task::{self, gated_requirements, should_prune, ArcTask, Exec};
use crate::tree::{WorkTree, MAX_DEPTH};

use super::{Backend, BackendSpec, DaskSpec};

/// A node input: another node's result, an immediate value, or a fused
/// sub-node evaluated at the call site.
#[derive(Clone)]
pub enum Input {
    Key(String),
    Literal(Value),
    Inline(Box<Node>),
}

/// One computation in the graph.
#[derive(Clone)]
pub struct Node {
    pub op: Op,
    pub inputs: Vec<Input>,
}

/// The closed set of node operations. Input layouts are fixed per
/// operation; optional requirements are always the trailing input.
#[derive(Clone)]
pub enum Op {
    /// Run the task. Inputs: `[requirements?]`.
    Execute(ArcTask),
    /// Load the task's artifact. No inputs.
    Load(ArcTask),
    /// Write input 0 through the task's artifact, then forward it.
    SaveAndReturn(ArcTask),
    /// Map-reduce seed. Inputs: `[requirements?]`.
    Accumulator(ArcTask),
    /// One balanced-tree step: `reduce(map(item), reduce(left, right))`.
    /// Inputs: `[left, right, requirements?]`.
    MapReduceStep { task: ArcTask, item: Value },
    /// Final map-reduce stage. Inputs: `[root_reduce, requirements?]`.
    Post(ArcTask),
    /// Rebuild an ordered sequence from all inputs.
    List,
    /// Rebuild a fixed-arity sequence from all inputs.
    Tuple,
    /// Rebuild a keyed mapping; `keys.len()` must match the input count.
    MapObject(Vec<String>),
}

impl Op {
    fn describe(&self) -> String {
        match self {
            Op::Execute(t) => format!("execute {}", t.unique_key()),
            Op::Load(t) => format!("load {}", t.unique_key()),
            Op::SaveAndReturn(t) => format!("save {}", t.unique_key()),
            Op::Accumulator(t) => format!("accumulator {}", t.unique_key()),
            Op::MapReduceStep { task, .. } => format!("map-reduce {}", task.unique_key()),
            Op::Post(t) => format!("post {}", t.unique_key()),
            Op::List => "rebuild list".into(),
            Op::Tuple => "rebuild tuple".into(),
            Op::MapObject(_) => "rebuild map".into(),
        }
    }

    fn is_container_rebuild(&self) -> bool {
        matches!(self, Op::List | Op::Tuple | Op::MapObject(_))
    }
}

/// `{key -> computation}` plus bookkeeping for anonymous container nodes.
pub struct Graph {
    nodes: IndexMap<String, Node>,
    task_outputs: HashMap<String, String>,
    counter: usize,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: IndexMap::new(),
            task_outputs: HashMap::new(),
            counter: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn node_keys(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Keys this node waits on, including those referenced through fused
    /// sub-nodes.
    pub fn key_dependencies(&self, key: &str) -> Vec<String> {
        let mut deps = Vec::new();
        if let Some(node) = self.nodes.get(key) {
            collect_key_inputs(node, &mut deps);
        }
        deps
    }

    fn fresh(&mut self, kind: &str) -> String {
        let key = format!("__{kind}_{}", self.counter);
        self.counter += 1;
        key
    }

    fn insert(&mut self, key: String, node: Node) {
        self.nodes.insert(key, node);
    }

    /// Apply the flag-guarded rewrite passes. `protected` keys are never
    /// absorbed, which preserves the externally observable output.
    pub fn optimize(&mut self, options: &GraphOptions, protected: &HashSet<String>) {
        loop {
            let counts = self.consumer_counts();
            let candidate = self.nodes.keys().find(|key| {
                if protected.contains(*key) || counts.get(*key) != Some(&1) {
                    return false;
                }
                let op = &self.nodes[*key].op;
                if op.is_container_rebuild() {
                    options.inline_containers
                } else {
                    options.fuse
                }
            });
            let Some(key) = candidate.cloned() else {
                break;
            };
            let node = self
                .nodes
                .shift_remove(&key)
                .expect("candidate comes from the key set");
            for consumer in self.nodes.values_mut() {
                absorb_input(&mut consumer.inputs, &key, &node);
            }
        }
    }

    fn consumer_counts(&self) -> HashMap<String, usize> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for node in self.nodes.values() {
            let mut keys = Vec::new();
            collect_key_inputs(node, &mut keys);
            for key in keys {
                *counts.entry(key).or_default() += 1;
            }
        }
        counts
    }
}

fn collect_key_inputs(node: &Node, out: &mut Vec<String>) {
    for input in &node.inputs {
        match input {
            Input::Key(key) => out.push(key.clone()),
            Input::Literal(_) => {}
            Input::Inline(inner) => collect_key_inputs(inner, out),
        }
    }
}

fn absorb_input(inputs: &mut [Input], key: &str, node: &Node) {
    for input in inputs {
        match input {
            Input::Key(k) if k == key => {
                *input = Input::Inline(Box::new(node.clone()));
            }
            Input::Inline(inner) => absorb_input(&mut inner.inputs, key, node),
            _ => {}
        }
    }
}

/// Rewrite-pass switches; both on by default, and disabling them is the
/// supported way to debug a graph.
#[derive(Debug, Clone, Copy)]
pub struct GraphOptions {
    pub fuse: bool,
    pub inline_containers: bool,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            fuse: true,
            inline_containers: true,
        }
    }
}

/// Build the graph for a work tree. Returns the graph and the root input:
/// a node key, or an immediate value when the tree holds no tasks at all.
pub fn build_graph(work: &WorkTree) -> Result<(Graph, Input), AqueductError> {
    let mut graph = Graph::new();
    let root = add_work(work, &mut graph, 0)?;
    Ok((graph, root))
}

fn add_work(work: &WorkTree, graph: &mut Graph, depth: usize) -> Result<Input, AqueductError> {
    match work {
        WorkTree::Leaf(value) => Ok(Input::Literal(value.clone())),
        WorkTree::Task(task) => add_task(task, graph, depth).map(Input::Key),
        WorkTree::List(items) => add_container(items, Op::List, "list", graph, depth),
        WorkTree::Tuple(items) => add_container(items, Op::Tuple, "tuple", graph, depth),
        WorkTree::Map(entries) => {
            let keys: Vec<String> = entries.keys().cloned().collect();
            let items: Vec<&WorkTree> = entries.values().collect();
            let inputs = items
                .iter()
                .map(|item| add_work(item, graph, depth))
                .collect::<Result<Vec<_>, _>>()?;
            let key = graph.fresh("map");
            graph.insert(
                key.clone(),
                Node {
                    op: Op::MapObject(keys),
                    inputs,
                },
            );
            Ok(Input::Key(key))
        }
    }
}

fn add_container(
    items: &[WorkTree],
    op: Op,
    kind: &str,
    graph: &mut Graph,
    depth: usize,
) -> Result<Input, AqueductError> {
    let inputs = items
        .iter()
        .map(|item| add_work(item, graph, depth))
        .collect::<Result<Vec<_>, _>>()?;
    let key = graph.fresh(kind);
    graph.insert(key.clone(), Node { op, inputs });
    Ok(Input::Key(key))
}

fn add_task(task: &ArcTask, graph: &mut Graph, depth: usize) -> Result<String, AqueductError> {
    let task_key = task.unique_key();
    if let Some(final_key) = graph.task_outputs.get(&task_key) {
        return Ok(final_key.clone());
    }
    if depth >= MAX_DEPTH {
        return Err(AqueductError::CycleDetected(task_key));
    }

    let final_key = if should_prune(task.as_ref(), false) && task.autoload() {
        debug!(task = %task_key, "cached; adding load-only node");
        graph.insert(
            task_key.clone(),
            Node {
                op: Op::Load(task.clone()),
                inputs: Vec::new(),
            },
        );
        task_key.clone()
    } else {
        let requirements = match gated_requirements(task.as_ref(), false) {
            Some(req_tree) => Some(add_work(&req_tree, graph, depth + 1)?),
            None => None,
        };

        match task.exec() {
            Exec::Simple(_) => {
                let inputs = requirements.into_iter().collect();
                graph.insert(
                    task_key.clone(),
                    Node {
                        op: Op::Execute(task.clone()),
                        inputs,
                    },
                );
            }
            Exec::MapReduce(mr) => {
                add_map_reduce(task, mr.items(), requirements, graph, &task_key);
            }
        }

        if task.artifact().is_some() && task.autosave() {
            // The save node forwards the value and becomes the true output.
            let save_key = format!("{task_key}_save_and_return");
            graph.insert(
                save_key.clone(),
                Node {
                    op: Op::SaveAndReturn(task.clone()),
                    inputs: vec![Input::Key(task_key.clone())],
                },
            );
            save_key
        } else {
            task_key.clone()
        }
    };

    graph.task_outputs.insert(task_key, final_key.clone());
    Ok(final_key)
}

/// Lay the reduction out as a balanced binary tree: item `idx` reduces the
/// nodes at `2·idx+1` and `2·idx+2`, falling back to the accumulator when an
/// index runs past the item list. The root reduce sits at index 0 and the
/// post node consumes it, so the critical path is logarithmic in the item
/// count.
fn add_map_reduce(
    task: &ArcTask,
    items: Vec<Value>,
    requirements: Option<Input>,
    graph: &mut Graph,
    base_key: &str,
) {
    let accumulator_key = format!("{base_key}_accumulator");
    graph.insert(
        accumulator_key.clone(),
        Node {
            op: Op::Accumulator(task.clone()),
            inputs: requirements.iter().cloned().collect(),
        },
    );

    let n = items.len();
    for (idx, item) in items.into_iter().enumerate() {
        let child_key = |child_idx: usize| {
            if child_idx < n {
                format!("{base_key}_reduce_{child_idx}")
            } else {
                accumulator_key.clone()
            }
        };
        let mut inputs = vec![
            Input::Key(child_key(2 * idx + 1)),
            Input::Key(child_key(2 * idx + 2)),
        ];
        inputs.extend(requirements.iter().cloned());
        graph.insert(
            format!("{base_key}_reduce_{idx}"),
            Node {
                op: Op::MapReduceStep {
                    task: task.clone(),
                    item,
                },
                inputs,
            },
        );
    }

    let root_key = if n > 0 {
        format!("{base_key}_reduce_0")
    } else {
        accumulator_key
    };
    let mut inputs = vec![Input::Key(root_key)];
    inputs.extend(requirements.iter().cloned());
    graph.insert(
        base_key.to_string(),
        Node {
            op: Op::Post(task.clone()),
            inputs,
        },
    );
}

/// Context shipped to workers alongside each node.
#[derive(Clone)]
pub struct NodeContext {
    pub config: Config,
    pub backend_spec: BackendSpec,
    pub force: ForceSet,
}

/// An external scheduler capable of executing a materialized graph.
#[async_trait]
pub trait GraphScheduler: Send + Sync {
    /// Wire form describing the cluster this scheduler talks to.
    fn spec(&self) -> BackendSpec;

    /// Execute the graph and return the value of `output`.
    async fn execute(
        &self,
        graph: Graph,
        output: String,
        context: NodeContext,
    ) -> Result<Value, AqueductError>;

    /// Release cluster resources. Idempotent.
    fn close(&self) {}
}

/// Graph-building backend; execution strategy is the scheduler's.
pub struct GraphBackend {
    scheduler: Arc<dyn GraphScheduler>,
    options: GraphOptions,
}

impl GraphBackend {
    pub fn new(scheduler: Arc<dyn GraphScheduler>) -> Self {
        Self {
            scheduler,
            options: GraphOptions::default(),
        }
    }

    pub fn with_options(scheduler: Arc<dyn GraphScheduler>, options: GraphOptions) -> Self {
        Self { scheduler, options }
    }
}

#[async_trait]
impl Backend for GraphBackend {
    fn spec(&self) -> BackendSpec {
        self.scheduler.spec()
    }

    async fn run(&self, work: &WorkTree, force: &ForceSet) -> Result<Value, AqueductError> {
        let (mut graph, root) = build_graph(work)?;
        info!(nodes = graph.len(), "built computation graph");

        let output = match root {
            // A tree without tasks needs no cluster round-trip.
            Input::Literal(value) => return Ok(value),
            Input::Key(key) => key,
            Input::Inline(_) => {
                return Err(AqueductError::other(
                    "graph construction produced an unkeyed root",
                ))
            }
        };

        let mut protected = HashSet::new();
        protected.insert(output.clone());
        graph.optimize(&self.options, &protected);
        info!(nodes = graph.len(), "optimized computation graph");

        let node_context = NodeContext {
            config: context::current_config(),
            backend_spec: self.spec(),
            force: force.clone(),
        };
        self.scheduler.execute(graph, output, node_context).await
    }

    fn close(&self) {
        self.scheduler.close();
    }
}

/// Executes graphs on a bounded pool of local worker threads.
///
/// Stands in for a cluster: same scheduling contract, one machine. Nodes
/// run as their key dependencies complete; in-flight nodes finish after a
/// failure, queued ones are abandoned.
pub struct LocalGraphScheduler {
    n_workers: usize,
}

impl LocalGraphScheduler {
    pub fn new(n_workers: usize) -> Self {
        Self {
            n_workers: n_workers.max(1),
        }
    }
}

#[async_trait]
impl GraphScheduler for LocalGraphScheduler {
    fn spec(&self) -> BackendSpec {
        BackendSpec::Dask(DaskSpec::Workers {
            n_workers: self.n_workers,
        })
    }

    async fn execute(
        &self,
        graph: Graph,
        output: String,
        context: NodeContext,
    ) -> Result<Value, AqueductError> {
        let mut indegree: HashMap<String, usize> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for key in graph.node_keys() {
            let deps = graph.key_dependencies(key);
            indegree.insert(key.to_string(), deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(key.to_string());
            }
        }

        let nodes = Arc::new(graph.nodes);
        let results: Arc<DashMap<String, Value>> = Arc::new(DashMap::new());
        let semaphore = Arc::new(Semaphore::new(self.n_workers));

        let mut ready: Vec<String> = indegree
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(k, _)| k.clone())
            .collect();
        let mut in_flight: JoinSet<Result<(String, Value), TaskError>> = JoinSet::new();
        let mut completed = 0usize;
        let mut failure: Option<TaskError> = None;

        loop {
            if failure.is_none() {
                for key in ready.drain(..) {
                    let node = nodes
                        .get(&key)
                        .cloned()
                        .ok_or_else(|| AqueductError::other(format!("missing node {key}")))?;
                    let results = results.clone();
                    let semaphore = semaphore.clone();
                    let node_context = context.clone();
                    in_flight.spawn(async move {
                        let permit = semaphore.acquire_owned().await.map_err(|e| {
                            TaskError::new(&key, format!("scheduler closed: {e}"))
                        })?;
                        let evaluated = tokio::task::spawn_blocking(move || {
                            let _permit = permit;
                            context::install_on_worker(
                                node_context.config,
                                Some(node_context.backend_spec),
                                node_context.force,
                            );
                            eval_node(&key, &node, &results).map(|value| (key.clone(), value))
                        })
                        .await;
                        match evaluated {
                            Ok(result) => result,
                            Err(join_err) => Err(TaskError::new(
                                "scheduler",
                                format!("worker panicked: {join_err}"),
                            )),
                        }
                    });
                }
            } else {
                ready.clear();
            }

            match in_flight.join_next().await {
                None => break,
                Some(Ok(Ok((key, value)))) => {
                    completed += 1;
                    results.insert(key.clone(), value);
                    if let Some(waiting) = dependents.get(&key) {
                        for dependent in waiting {
                            let remaining = indegree
                                .get_mut(dependent)
                                .expect("dependent seen during graph scan");
                            *remaining -= 1;
                            if *remaining == 0 {
                                ready.push(dependent.clone());
                            }
                        }
                    }
                }
                Some(Ok(Err(task_err))) => {
                    failure.get_or_insert(task_err);
                }
                Some(Err(join_err)) => {
                    failure.get_or_insert(TaskError::new(
                        "scheduler",
                        format!("worker panicked: {join_err}"),
                    ));
                }
            }
        }

        if let Some(err) = failure {
            return Err(err.into());
        }
        if completed < nodes.len() {
            let stuck = indegree
                .iter()
                .filter(|(_, n)| **n > 0)
                .map(|(k, _)| k.clone())
                .next()
                .unwrap_or_else(|| output.clone());
            return Err(AqueductError::CycleDetected(stuck));
        }

        results
            .get(&output)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AqueductError::other(format!("output node {output} never ran")))
    }
}

fn eval_node(
    key: &str,
    node: &Node,
    results: &DashMap<String, Value>,
) -> Result<Value, TaskError> {
    let mut inputs = Vec::with_capacity(node.inputs.len());
    for input in &node.inputs {
        match input {
            Input::Key(dep) => {
                let value = results
                    .get(dep)
                    .map(|entry| entry.value().clone())
                    .ok_or_else(|| {
                        TaskError::new(key, format!("dependency {dep} has no result"))
                    })?;
                inputs.push(value);
            }
            Input::Literal(value) => inputs.push(value.clone()),
            Input::Inline(inner) => inputs.push(eval_node(key, inner, results)?),
        }
    }

    let annotate = |e: AqueductError| resolve_annotation(key, &node.op, e);
    match &node.op {
        Op::Execute(task) => {
            let requirements = inputs.into_iter().next();
            let value =
                task::run_immediate(task.as_ref(), requirements).map_err(annotate)?;
            Ok(value)
        }
        Op::Load(task) => {
            let handle: ArcTask = task.clone();
            resolve::load_value(&handle)
        }
        Op::SaveAndReturn(task) => {
            let mut inputs = inputs.into_iter();
            let value = inputs
                .next()
                .ok_or_else(|| TaskError::new(key, "save node has no input"))?;
            resolve::store_result(task, &value).map_err(annotate)?;
            Ok(value)
        }
        Op::Accumulator(task) => match task.exec() {
            Exec::MapReduce(mr) => {
                let requirements = inputs.into_iter().next();
                mr.accumulator(requirements.as_ref()).map_err(annotate)
            }
            Exec::Simple(_) => Err(TaskError::new(key, "task changed execution shape")),
        },
        Op::MapReduceStep {
            task,
            item,
        } => match task.exec() {
            Exec::MapReduce(mr) => {
                let mut inputs = inputs.into_iter();
                let left = inputs
                    .next()
                    .ok_or_else(|| TaskError::new(key, "reduce node lost its left input"))?;
                let right = inputs
                    .next()
                    .ok_or_else(|| TaskError::new(key, "reduce node lost its right input"))?;
                let requirements = inputs.next();
                let reqs = requirements.as_ref();
                let children = mr.reduce(left, right, reqs).map_err(annotate)?;
                let mapped = mr.map(item, reqs).map_err(annotate)?;
                mr.reduce(mapped, children, reqs).map_err(annotate)
            }
            Exec::Simple(_) => Err(TaskError::new(key, "task changed execution shape")),
        },
        Op::Post(task) => match task.exec() {
            Exec::MapReduce(mr) => {
                let mut inputs = inputs.into_iter();
                let root = inputs
                    .next()
                    .ok_or_else(|| TaskError::new(key, "post node lost its input"))?;
                let requirements = inputs.next();
                mr.post(root, requirements.as_ref()).map_err(annotate)
            }
            Exec::Simple(_) => Err(TaskError::new(key, "task changed execution shape")),
        },
        Op::List | Op::Tuple => Ok(Value::Array(inputs)),
        Op::MapObject(keys) => {
            if keys.len() != inputs.len() {
                return Err(TaskError::new(
                    key,
                    AqueductError::UnsupportedTreeNode(format!(
                        "map rebuild expected {} children, got {}",
                        keys.len(),
                        inputs.len()
                    )),
                ));
            }
            let mut object = serde_json::Map::new();
            for (name, value) in keys.iter().zip(inputs) {
                object.insert(name.clone(), value);
            }
            Ok(Value::Object(object))
        }
    }
}

fn resolve_annotation(key: &str, op: &Op, err: AqueductError) -> TaskError {
    match err {
        AqueductError::TaskExecution(inner) => inner,
        other => {
            let task_key = match op {
                Op::Execute(t)
                | Op::Load(t)
                | Op::SaveAndReturn(t)
                | Op::Accumulator(t)
                | Op::Post(t) => t.unique_key(),
                Op::MapReduceStep { task, .. } => task.unique_key(),
                _ => key.to_string(),
            };
            TaskError::new(task_key, format!("{} failed: {other}", op.describe()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::testing::{Constant, SumOfSquares};
    use serde_json::json;

    fn reduce_depth(graph: &Graph, base: &str) -> usize {
        // Longest chain among `<base>_reduce_*` nodes.
        fn depth_of(graph: &Graph, key: &str, base: &str) -> usize {
            let own = usize::from(key.starts_with(&format!("{base}_reduce_")));
            graph
                .key_dependencies(key)
                .iter()
                .map(|dep| depth_of(graph, dep, base))
                .max()
                .unwrap_or(0)
                + own
        }
        graph
            .node_keys()
            .filter(|k| k.starts_with(&format!("{base}_reduce_")))
            .map(|k| depth_of(graph, k, base))
            .max()
            .unwrap_or(0)
    }

    #[test]
    fn balanced_reduce_tree_layout() {
        let _serial = crate::context::test_lock();
        let task = std::sync::Arc::new(SumOfSquares {
            items: vec![1, 2, 3],
        });
        let base = crate::task::Task::unique_key(task.as_ref());
        let tree = WorkTree::Task(task);
        let (graph, root) = build_graph(&tree).unwrap();

        match root {
            Input::Key(key) => assert_eq!(key, base),
            _ => panic!("root must be the post node"),
        }

        // reduce_0 waits on reduce_1 and reduce_2; both lean on the
        // accumulator for their out-of-range children.
        let deps_of_root = graph.key_dependencies(&format!("{base}_reduce_0"));
        assert!(deps_of_root.contains(&format!("{base}_reduce_1")));
        assert!(deps_of_root.contains(&format!("{base}_reduce_2")));

        // ceil(log2(3)) = 2
        assert_eq!(reduce_depth(&graph, &base), 2);
    }

    #[test]
    fn empty_map_reduce_posts_the_accumulator() {
        let _serial = crate::context::test_lock();
        let task = std::sync::Arc::new(SumOfSquares { items: vec![] });
        let base = crate::task::Task::unique_key(task.as_ref());
        let (graph, _) = build_graph(&WorkTree::Task(task)).unwrap();
        let post_deps = graph.key_dependencies(&base);
        assert_eq!(post_deps, vec![format!("{base}_accumulator")]);
    }

    #[test]
    fn single_item_reduce_uses_accumulator_twice() {
        let _serial = crate::context::test_lock();
        let task = std::sync::Arc::new(SumOfSquares { items: vec![5] });
        let base = crate::task::Task::unique_key(task.as_ref());
        let (graph, _) = build_graph(&WorkTree::Task(task)).unwrap();
        let deps = graph.key_dependencies(&format!("{base}_reduce_0"));
        assert_eq!(
            deps,
            vec![
                format!("{base}_accumulator"),
                format!("{base}_accumulator")
            ]
        );
    }

    #[test]
    fn duplicate_tasks_share_one_node() {
        let _serial = crate::context::test_lock();
        let shared = Constant::new(json!(7));
        let tree = WorkTree::List(vec![
            WorkTree::Task(shared.clone()),
            WorkTree::Task(shared.clone()),
        ]);
        let (graph, _) = build_graph(&tree).unwrap();
        // One execute node plus one list rebuild node.
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn optimization_absorbs_single_consumer_containers() {
        let _serial = crate::context::test_lock();
        let tree = WorkTree::List(vec![WorkTree::Task(Constant::new(json!(1)))]);
        let (mut graph, root) = build_graph(&tree).unwrap();
        let Input::Key(output) = root else {
            panic!("container root must be keyed")
        };
        let before = graph.len();

        let mut protected = HashSet::new();
        protected.insert(output);
        graph.optimize(&GraphOptions::default(), &protected);
        // The task node fuses into the protected list rebuild.
        assert!(graph.len() < before);
        assert_eq!(graph.len(), 1);
    }

    #[tokio::test]
    async fn local_scheduler_runs_a_graph() {
        let _serial = crate::context::test_lock();
        let backend = GraphBackend::new(Arc::new(LocalGraphScheduler::new(2)));
        let tree = WorkTree::List(vec![
            WorkTree::task(SumOfSquares {
                items: vec![1, 2, 3],
            }),
            WorkTree::Task(Constant::new(json!(10))),
            WorkTree::Leaf(json!("leaf")),
        ]);
        let result = backend.run(&tree, &ForceSet::new()).await.unwrap();
        assert_eq!(result, json!([14, 10, "leaf"]));
    }

    #[tokio::test]
    async fn disabling_rewrites_does_not_change_results() {
        let _serial = crate::context::test_lock();
        let options = GraphOptions {
            fuse: false,
            inline_containers: false,
        };
        let backend =
            GraphBackend::with_options(Arc::new(LocalGraphScheduler::new(2)), options);
        let tree = WorkTree::task(SumOfSquares {
            items: vec![1, 2, 3, 4, 5],
        });
        let result = backend.run(&tree, &ForceSet::new()).await.unwrap();
        assert_eq!(result, json!(55));
    }

    #[tokio::test]
    async fn literal_only_tree_skips_the_scheduler() {
        let _serial = crate::context::test_lock();
        let backend = GraphBackend::new(Arc::new(LocalGraphScheduler::new(1)));
        let result = backend
            .run(&WorkTree::Leaf(json!({"just": "data"})), &ForceSet::new())
            .await
            .unwrap();
        assert_eq!(result, json!({"just": "data"}));
    }
}
