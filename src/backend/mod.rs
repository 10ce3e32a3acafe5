//! Execution backends.
//!
//! A backend realizes a resolved work tree as actual computation. Three
//! models share one contract:
//!
//! - [`immediate::ImmediateBackend`] — single-threaded, synchronous; the
//!   reference semantics every other backend must match on deterministic
//!   tasks.
//! - [`pool::PoolBackend`] — a bounded pool of workers executing the full
//!   DAG in parallel (wire type `concurrent`), plus
//!   [`pool::MultiprocessingBackend`], which parallelizes only map-reduce
//!   items (wire type `multiprocessing`).
//! - [`graph::GraphBackend`] — materializes the DAG as an explicit
//!   `{key -> computation}` graph, optimizes it, and hands it to a
//!   [`graph::GraphScheduler`] (wire type `dask`).

pub mod graph;
pub mod immediate;
pub mod pool;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ForceSet;
use crate::error::AqueductError;
use crate::tree::WorkTree;

pub use graph::{GraphBackend, GraphOptions, GraphScheduler, LocalGraphScheduler};
pub use immediate::ImmediateBackend;
pub use pool::{MultiprocessingBackend, PoolBackend};

/// Shared handle to a backend.
pub type ArcBackend = Arc<dyn Backend>;

/// An execution strategy for resolved work trees.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Wire description sufficient to reconstruct an equivalent handle on a
    /// worker.
    fn spec(&self) -> BackendSpec;

    /// Execute a work tree, honoring the cache gate and the per-class force
    /// set, and return results shaped like the input.
    async fn run(&self, work: &WorkTree, force: &ForceSet) -> Result<Value, AqueductError>;

    /// Release worker resources. Idempotent; always invoked by the
    /// resolver, even on error.
    fn close(&self) {}
}

/// Wire form of a backend, as found in configuration, CLI flags and worker
/// payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendSpec {
    Immediate,
    Concurrent { n_workers: usize },
    Multiprocessing { n_workers: usize },
    Dask(DaskSpec),
}

/// The two recognized shapes of the graph backend's spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DaskSpec {
    Address { address: String },
    Workers { n_workers: usize },
}

impl std::fmt::Display for BackendSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendSpec::Immediate => write!(f, "immediate"),
            BackendSpec::Concurrent { n_workers } => write!(f, "concurrent({n_workers})"),
            BackendSpec::Multiprocessing { n_workers } => {
                write!(f, "multiprocessing({n_workers})")
            }
            BackendSpec::Dask(DaskSpec::Address { address }) => write!(f, "dask({address})"),
            BackendSpec::Dask(DaskSpec::Workers { n_workers }) => write!(f, "dask({n_workers})"),
        }
    }
}

impl BackendSpec {
    /// Parse the keyed wire record.
    pub fn from_value(value: &Value) -> Result<Self, AqueductError> {
        serde_json::from_value(value.clone())
            .map_err(|e| AqueductError::BackendSpec(format!("{value}: {e}")))
    }
}

/// Factory for remote graph schedulers, registered by the embedding
/// application.
pub type SchedulerFactory =
    dyn Fn(&str) -> Result<Arc<dyn GraphScheduler>, AqueductError> + Send + Sync;

static REMOTE_SCHEDULERS: std::sync::RwLock<Option<Arc<SchedulerFactory>>> =
    std::sync::RwLock::new(None);

/// Register a factory that connects `{type: "dask", address}` specs to a
/// remote scheduler. Without one, address-shaped specs fail to resolve.
pub fn set_remote_scheduler_factory(factory: Arc<SchedulerFactory>) {
    let mut slot = REMOTE_SCHEDULERS
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = Some(factory);
}

/// Construct a backend handle from its wire form.
pub fn resolve_backend_from_spec(spec: &BackendSpec) -> Result<ArcBackend, AqueductError> {
    match spec {
        BackendSpec::Immediate => Ok(Arc::new(ImmediateBackend)),
        BackendSpec::Concurrent { n_workers } => Ok(Arc::new(PoolBackend::new(*n_workers))),
        BackendSpec::Multiprocessing { n_workers } => {
            Ok(Arc::new(MultiprocessingBackend::new(*n_workers)))
        }
        BackendSpec::Dask(DaskSpec::Workers { n_workers }) => Ok(Arc::new(
            GraphBackend::new(Arc::new(LocalGraphScheduler::new(*n_workers))),
        )),
        BackendSpec::Dask(DaskSpec::Address { address }) => {
            let slot = REMOTE_SCHEDULERS
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match slot.as_ref() {
                Some(factory) => Ok(Arc::new(GraphBackend::new(factory(address)?))),
                None => Err(AqueductError::BackendSpec(format!(
                    "no scheduler registered for address '{address}'; remote schedulers are \
                     provided by the embedding application"
                ))),
            }
        }
    }
}

/// The backend configured under `aqueduct.backend`, or immediate.
pub fn default_backend() -> Result<ArcBackend, AqueductError> {
    match crate::context::current_config().get("aqueduct.backend") {
        Some(value) => resolve_backend_from_spec(&BackendSpec::from_value(value)?),
        None => Ok(Arc::new(ImmediateBackend)),
    }
}
