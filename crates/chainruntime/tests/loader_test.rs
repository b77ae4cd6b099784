// crates/chainruntime/tests/loader_test.rs

use chaincore::{capability_fn, json, CapabilityRegistry, FlowError, TriggerKind, Value};
use chainruntime::{load_workflow_file, RuntimeConfig};
use std::fs;

#[test]
fn test_load_inline_and_file_scripts() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("done.lua"),
        r#"next(next.SUCCESS, { message = "done with " .. input.n })"#,
    )
    .unwrap();
    let path = dir.path().join("workflow.json");
    fs::write(
        &path,
        json!({
            "name": "two-step",
            "description": "inline start, file-backed finish",
            "nodes": [
                {
                    "name": "start",
                    "trigger": { "type": "interval", "every_ms": 1000 },
                    "script": "next('done', input)",
                    "capabilities": ["log.info"]
                },
                { "name": "done", "script_file": "done.lua" }
            ]
        })
        .to_string(),
    )
    .unwrap();

    let workflow = load_workflow_file(&path).unwrap();

    assert_eq!(workflow.name, "two-step");
    assert_eq!(workflow.description.as_deref(), Some("inline start, file-backed finish"));
    assert_eq!(workflow.nodes[0].trigger, TriggerKind::Interval { every_ms: 1000 });
    assert_eq!(
        workflow.nodes[1].script.as_deref(),
        Some(r#"next(next.SUCCESS, { message = "done with " .. input.n })"#)
    );
    assert!(workflow.nodes[1].script_file.is_none(), "script_file should be inlined");
}

#[test]
fn test_node_without_script_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("workflow.json");
    fs::write(
        &path,
        json!({ "name": "empty", "nodes": [{ "name": "start" }] }).to_string(),
    )
    .unwrap();

    let err = load_workflow_file(&path).unwrap_err();
    assert!(matches!(err, FlowError::Execution(_)), "Unexpected error: {}", err);
}

#[test]
fn test_missing_script_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("workflow.json");
    fs::write(
        &path,
        json!({ "name": "gone", "nodes": [{ "name": "start", "script_file": "nope.lua" }] })
            .to_string(),
    )
    .unwrap();

    let err = load_workflow_file(&path).unwrap_err();
    assert!(matches!(err, FlowError::Io(_)), "Unexpected error: {}", err);
}

#[test]
fn test_runtime_config_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runtime.json");
    fs::write(
        &path,
        json!({ "event_buffer_size": 16, "log_activations": true }).to_string(),
    )
    .unwrap();

    let config = RuntimeConfig::from_file(&path).unwrap();

    assert_eq!(config.event_buffer_size, 16);
    assert!(config.log_activations);
    assert_eq!(config.sandbox.activation_timeout_ms, 10_000);
}

#[cfg(feature = "sandbox")]
#[tokio::test]
async fn test_loaded_workflow_runs() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("done.lua"),
        r#"next(next.SUCCESS, { message = "done with " .. input.n })"#,
    )
    .unwrap();
    let path = dir.path().join("workflow.json");
    fs::write(
        &path,
        json!({
            "name": "two-step",
            "nodes": [
                { "name": "start", "script": "log.info('starting') next('done', input)", "capabilities": ["log.info"] },
                { "name": "done", "script_file": "done.lua" }
            ]
        })
        .to_string(),
    )
    .unwrap();

    let workflow = load_workflow_file(&path).unwrap();
    let name = workflow.name.clone();
    let registry = CapabilityRegistry::new().with(
        "log.info",
        capability_fn(|_args: Vec<Value>| async move { Ok(Value::Null) }),
    );

    let runtime = chainruntime::FlowRuntime::new();
    let graph = runtime
        .create_workflow(name.clone(), workflow.into_definition(registry))
        .await
        .unwrap();
    assert!(graph.has_sandboxed_nodes());

    let result = runtime.execute(&name, json!({ "n": 4 })).await;
    assert!(result.success, "Workflow should succeed: {:?}", result.error);
    assert_eq!(result.message(), Some("done with 4"));
    assert_eq!(result.path, vec!["start", "done", "SUCCESS"]);
}
