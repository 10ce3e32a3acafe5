//! Error types for the task framework.
//!
//! Two layers:
//!
//! - [`TaskError`] is the transportable execution failure. It is produced on
//!   worker threads, carries the failing task's unique key, and is `Clone` so
//!   memoized futures can hand the same failure to every dependent.
//! - [`AqueductError`] is the top-level error surfaced to `run` callers and
//!   the CLI, wrapping everything else with `#[from]` conversions.

use thiserror::Error;

/// Execution failure of a single task, annotated with its unique key.
///
/// Kept cheap and cloneable on purpose: the worker-pool backend memoizes
/// results per unique key and a diamond in the graph hands the same error to
/// several parents.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("task {key} failed: {message}")]
pub struct TaskError {
    /// Unique key of the failing task (`ClassName-<hash>`).
    pub key: String,
    /// Human-readable failure description.
    pub message: String,
}

impl TaskError {
    pub fn new(key: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self {
            key: key.into(),
            message: message.to_string(),
        }
    }
}

/// Artifact storage errors.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact {0} does not exist")]
    Missing(String),

    #[error("artifact {artifact} does not support {operation}")]
    Unsupported {
        artifact: String,
        operation: &'static str,
    },

    #[error("codec failure on {artifact}: {source}")]
    Codec {
        artifact: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Top-level error type for the framework.
#[derive(Debug, Error)]
pub enum AqueductError {
    /// A declared config path is missing and has no default.
    #[error("configuration key '{0}' is not set and has no default")]
    ConfigResolution(String),

    /// A required constructor parameter is absent both in the call and in config.
    #[error("parameter '{param}' of task '{task}' was not supplied and is absent from configuration")]
    ArgumentBinding { task: String, param: String },

    /// A parameter was bound twice by a combinator.
    #[error("parameter '{0}' is bound both as an iterator and as a fixed argument")]
    RepeatedParameter(String),

    /// The tree walker met a node kind it cannot rebuild.
    #[error("work tree contains a node the walker cannot rebuild: {0}")]
    UnsupportedTreeNode(String),

    /// A task's run raised; wrapped with the task's unique key.
    #[error(transparent)]
    TaskExecution(#[from] TaskError),

    /// Storage checking is enabled and a side-effect task left no artifact.
    #[error("task {0} completed without creating its artifact")]
    ArtifactMissing(String),

    /// A backend dictionary could not be interpreted.
    #[error("could not interpret backend specification: {0}")]
    BackendSpec(String),

    /// A cycle was discovered during graph construction.
    #[error("dependency cycle detected while expanding {0}")]
    CycleDetected(String),

    /// The registry has no task with the requested name.
    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl AqueductError {
    /// Create a generic error with a message.
    pub fn other(msg: impl Into<String>) -> Self {
        AqueductError::Other(msg.into())
    }

    /// The unique key of the failing task, when this error carries one.
    pub fn task_key(&self) -> Option<&str> {
        match self {
            AqueductError::TaskExecution(e) => Some(&e.key),
            AqueductError::ArtifactMissing(key) => Some(key),
            _ => None,
        }
    }
}
