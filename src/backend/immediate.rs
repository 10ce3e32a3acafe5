//! Single-threaded reference backend.

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ForceSet;
use crate::error::AqueductError;
use crate::resolve;
use crate::tree::WorkTree;

use super::{Backend, BackendSpec};

/// Executes the tree synchronously, in dependency order, on one thread.
///
/// No parallelism and fail-fast on the first error. This is the reference
/// semantics: every other backend must be observationally equivalent on
/// deterministic tasks.
pub struct ImmediateBackend;

#[async_trait]
impl Backend for ImmediateBackend {
    fn spec(&self) -> BackendSpec {
        BackendSpec::Immediate
    }

    async fn run(&self, work: &WorkTree, force: &ForceSet) -> Result<Value, AqueductError> {
        // The walk is synchronous and a task body may block; keep it off the
        // async worker threads so nested runs can block on the runtime.
        let work = work.clone();
        let config = crate::context::current_config();
        let force = force.clone();
        tokio::task::spawn_blocking(move || {
            // Blocking threads are pooled and shared across backends; the
            // walk installs its own worker context rather than trusting
            // whatever the previous occupant left behind.
            crate::context::install_on_worker(config, Some(BackendSpec::Immediate), force);
            // Diamonds in the tree execute once per unique key.
            let mut memo: std::collections::HashMap<String, Value> =
                std::collections::HashMap::new();
            work.resolve(
                &mut |task, requirements| {
                    let key = task.unique_key();
                    if let Some(value) = memo.get(&key) {
                        return Ok(value.clone());
                    }
                    let value = resolve::execute_or_load(task, requirements)?;
                    memo.insert(key, value.clone());
                    Ok(value)
                },
                false,
            )
        })
        .await
        .map_err(|e| AqueductError::other(format!("immediate backend panicked: {e}")))?
    }
}
