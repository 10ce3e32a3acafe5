//! Ambient context lifecycle: installation during a run, visibility on
//! workers, restoration afterwards (normal and error paths), and nested
//! runs.

mod common;

use std::sync::Arc;

use serde_json::{json, Value};

use aqueduct::backend::{ImmediateBackend, PoolBackend};
use aqueduct::{
    context, resolve, AqueductError, ArcBackend, BackendSpec, Config, ForceSet, WorkTree,
};
use common::{serial, Probe};

fn config_with(key: &str, value: Value) -> Config {
    let mut cfg = Config::new();
    cfg.set(key, value);
    cfg
}

#[tokio::test]
async fn context_is_installed_during_and_restored_after_a_run() {
    let _serial = serial();
    context::set_config(config_with("phase", json!("before")));
    assert!(context::current_backend().is_none());

    let witness = Probe::computed("ContextWitness", json!({}), None, |_| {
        // The task sees the resolver-installed context: same config, and a
        // current backend to hand to nested runs.
        let phase = context::current_config()
            .get("phase")
            .cloned()
            .unwrap_or(Value::Null);
        let backend = context::current_backend_spec()
            .map(|spec| spec.to_string())
            .unwrap_or_default();
        Ok(json!({ "phase": phase, "backend": backend }))
    });

    let backend: ArcBackend = Arc::new(ImmediateBackend);
    let result = resolve::run_on(&backend, &WorkTree::Task(witness), ForceSet::new())
        .await
        .unwrap();
    assert_eq!(result["phase"], json!("before"));
    assert_eq!(result["backend"], json!("immediate"));

    // Restored: config untouched, backend slot cleared.
    assert_eq!(
        context::current_config().get("phase"),
        Some(&json!("before"))
    );
    assert!(context::current_backend().is_none());
    assert!(context::current_backend_spec().is_none());
}

#[tokio::test]
async fn context_is_restored_after_a_failing_run() {
    let _serial = serial();
    context::set_config(config_with("phase", json!("c0")));

    let failing = Probe::computed("ContextBoom", json!({}), None, |_| {
        Err(AqueductError::other("boom"))
    });
    let backend: ArcBackend = Arc::new(PoolBackend::new(2));
    let err = resolve::run_on(&backend, &WorkTree::Task(failing), ForceSet::new()).await;
    assert!(err.is_err());

    assert_eq!(context::current_config().get("phase"), Some(&json!("c0")));
    assert!(context::current_backend().is_none());
}

#[tokio::test]
async fn pool_workers_see_the_run_configuration() {
    let _serial = serial();
    context::set_config(config_with("worker.visible", json!(1234)));

    let reader = Probe::computed("WorkerConfigReader", json!({}), None, |_| {
        Ok(context::current_config()
            .get("worker.visible")
            .cloned()
            .unwrap_or(Value::Null))
    });

    let backend: ArcBackend = Arc::new(PoolBackend::new(2));
    let result = resolve::run_on(&backend, &WorkTree::Task(reader), ForceSet::new())
        .await
        .unwrap();
    assert_eq!(result, json!(1234));

    context::set_config(Config::new());
}

#[tokio::test]
async fn workers_receive_a_reconstructible_backend_spec() {
    let _serial = serial();
    let spec_probe = Probe::computed("WorkerSpecReader", json!({}), None, |_| {
        let spec = context::current_backend_spec();
        Ok(json!(matches!(
            spec,
            Some(BackendSpec::Concurrent { n_workers: 3 })
        )))
    });

    let backend: ArcBackend = Arc::new(PoolBackend::new(3));
    let result = resolve::run_on(&backend, &WorkTree::Task(spec_probe), ForceSet::new())
        .await
        .unwrap();
    assert_eq!(result, json!(true));
}

#[tokio::test]
async fn nested_runs_execute_against_the_ambient_backend() {
    let _serial = serial();
    let nested = Probe::computed("NestedOuter", json!({}), None, |_| {
        // Spawned from inside a running task: resolves the ambient backend
        // and blocks on a fresh work tree.
        let inner = Probe::computed("NestedInner", json!({}), None, |_| Ok(json!(9)));
        let value = resolve::run_nested(&WorkTree::Task(inner))?;
        Ok(json!(value.as_i64().unwrap_or(0) * 2))
    });

    let backend: ArcBackend = Arc::new(ImmediateBackend);
    let result = resolve::run_on(&backend, &WorkTree::Task(nested), ForceSet::new())
        .await
        .unwrap();
    assert_eq!(result, json!(18));
}

#[tokio::test]
async fn default_backend_comes_from_configuration() {
    let _serial = serial();
    let mut cfg = Config::new();
    cfg.set(
        "aqueduct.backend",
        json!({"type": "concurrent", "n_workers": 2}),
    );
    context::set_config(cfg);

    let task = Probe::computed("DefaultBackendProbe", json!({}), None, |_| {
        Ok(json!(context::current_backend_spec()
            .map(|s| s.to_string())
            .unwrap_or_default()))
    });
    let result = resolve::run(&WorkTree::Task(task)).await.unwrap();
    assert_eq!(result, json!("concurrent(2)"));

    context::set_config(Config::new());
}
