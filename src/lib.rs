//! # Aqueduct
//!
//! Build-and-execute framework for data pipelines expressed as typed task
//! descriptors. Tasks declare their identity, requirements and an optional
//! cached artifact; the resolver composes them into a dependency graph,
//! prunes everything the artifact cache already covers, and executes the
//! rest on a selected backend.
//!
//! ## Architecture
//!
//! | Component | Module | Responsibility |
//! |-----------|--------|----------------|
//! | Artifact  | [`artifact`] | Cached output handles: existence, freshness, codec I/O |
//! | Task      | [`task`] | Immutable descriptors, content-hashed identity, combinators |
//! | Tree walker | [`tree`] | Shape-preserving map / reduce / resolve over work trees |
//! | Context   | [`context`] | Ambient `(config, backend, force)` with scoped restore |
//! | Backends  | [`backend`] | Immediate, worker-pool and distributed-graph execution |
//! | Resolver  | [`resolve`] | Cache gating, save/load policy, top-level `run` |
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use aqueduct::{resolve, tree::WorkTree};
//!
//! let work = WorkTree::task(MyTask::new(42)?);
//! let result = resolve::run(&work).await?;
//! ```
//!
//! Execution backends are chosen through a small wire spec
//! (`{type: "concurrent", n_workers: 4}` and friends); see
//! [`backend::BackendSpec`]. Within one `run`, a task with a given unique
//! key executes at most once regardless of how often it appears in the
//! tree, and cached tasks load instead of running without expanding their
//! requirements.

pub mod artifact;
pub mod backend;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod registry;
pub mod resolve;
pub mod task;
pub mod tree;
pub mod value;

pub use artifact::{ArcArtifact, Artifact};
pub use backend::{ArcBackend, Backend, BackendSpec};
pub use config::Config;
pub use context::{Context, ForceSet};
pub use error::{AqueductError, ArtifactError, TaskError};
pub use registry::{TaskFactory, TaskRegistry};
pub use resolve::{run, run_nested, run_on};
pub use task::{
    apply, ArcTask, Exec, MapReduceTask, Param, Repeat, SimpleTask, Task,
};
pub use tree::WorkTree;
pub use value::{task_arg, unique_key};

/// The dynamic value type tasks exchange.
pub type Value = serde_json::Value;
