//! Ambient execution context.
//!
//! The context carries the current configuration, the current backend and
//! the per-run force set. Two slots exist:
//!
//! - a process-wide slot, swapped by the resolver around each top-level
//!   `run` and restored on exit (even on error, via the guard's `Drop`);
//! - a worker-local (thread-local) slot, installed from the work payload
//!   before each task executes so that tasks on worker threads see the
//!   configuration and backend of the run that scheduled them. Worker slots
//!   need not be cleared: the next task installs its own before running.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use once_cell::sync::Lazy;

use crate::backend::{ArcBackend, BackendSpec};
use crate::config::Config;

/// Task class names whose cache is bypassed for the current run.
pub type ForceSet = HashSet<String>;

/// Ambient state for one `run` invocation.
#[derive(Clone, Default)]
pub struct Context {
    pub config: Config,
    pub backend: Option<ArcBackend>,
    pub backend_spec: Option<BackendSpec>,
    pub force: ForceSet,
}

static PROCESS: Lazy<RwLock<Context>> = Lazy::new(|| RwLock::new(Context::default()));

thread_local! {
    static WORKER: std::cell::RefCell<Option<Context>> = const { std::cell::RefCell::new(None) };
}

/// Snapshot of the effective context: the worker-local slot when installed,
/// the process slot otherwise.
pub fn current() -> Context {
    let worker = WORKER.with(|slot| slot.borrow().clone());
    match worker {
        Some(ctx) => ctx,
        None => PROCESS
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone(),
    }
}

pub fn current_config() -> Config {
    current().config
}

pub fn current_backend() -> Option<ArcBackend> {
    current().backend
}

pub fn current_backend_spec() -> Option<BackendSpec> {
    current().backend_spec
}

pub fn is_forced(task_name: &str) -> bool {
    current().force.contains(task_name)
}

/// Replace the process-wide configuration in place, outside of any run.
pub fn set_config(config: Config) {
    let mut slot = PROCESS.write().unwrap_or_else(PoisonError::into_inner);
    slot.config = config;
}

/// Install a context for the duration of a run. The returned guard restores
/// the prior context when dropped, which also covers the error path.
#[must_use = "dropping the guard immediately would restore the prior context at once"]
pub fn install(context: Context) -> ContextGuard {
    let mut slot = PROCESS.write().unwrap_or_else(PoisonError::into_inner);
    let prior = std::mem::replace(&mut *slot, context);
    ContextGuard { prior: Some(prior) }
}

/// Install the worker-local context before executing a task on a worker
/// thread.
pub fn install_on_worker(config: Config, backend_spec: Option<BackendSpec>, force: ForceSet) {
    WORKER.with(|slot| {
        *slot.borrow_mut() = Some(Context {
            config,
            backend: None,
            backend_spec,
            force,
        });
    });
}

/// Serializes tests that swap the process-wide slot.
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Restores the prior process context on drop.
pub struct ContextGuard {
    prior: Option<Context>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(prior) = self.prior.take() {
            let mut slot = PROCESS.write().unwrap_or_else(PoisonError::into_inner);
            *slot = prior;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn install_restores_on_drop() {
        let _serial = test_lock();
        let mut before = Config::new();
        before.set("marker", json!("before"));
        set_config(before.clone());

        {
            let mut during = Config::new();
            during.set("marker", json!("during"));
            let _guard = install(Context {
                config: during,
                ..Context::default()
            });
            assert_eq!(current_config().get("marker"), Some(&json!("during")));
        }

        assert_eq!(current_config().get("marker"), Some(&json!("before")));
    }

    #[test]
    fn worker_slot_shadows_process_slot() {
        let _serial = test_lock();
        let mut process_cfg = Config::new();
        process_cfg.set("origin", json!("process"));
        let _guard = install(Context {
            config: process_cfg,
            ..Context::default()
        });

        std::thread::spawn(|| {
            let mut worker_cfg = Config::new();
            worker_cfg.set("origin", json!("worker"));
            install_on_worker(worker_cfg, Some(BackendSpec::Immediate), ForceSet::new());

            assert_eq!(current_config().get("origin"), Some(&json!("worker")));
            assert_eq!(current_backend_spec(), Some(BackendSpec::Immediate));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn force_set_lookup() {
        let _serial = test_lock();
        let mut force = ForceSet::new();
        force.insert("Mean".to_string());
        let _guard = install(Context {
            force,
            ..Context::default()
        });
        assert!(is_forced("Mean"));
        assert!(!is_forced("Other"));
    }
}
