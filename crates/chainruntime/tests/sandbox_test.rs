// crates/chainruntime/tests/sandbox_test.rs

use chaincore::{
    capability_fn, json, CapabilityError, CapabilityRegistry, NodeSpec, Value, WorkflowDefinition,
    WorkflowError,
};
use chainruntime::{logger_fn, ActivationLog, FlowRuntime, RuntimeConfig, SandboxConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn script(name: &str, source: &str, capabilities: &[&str]) -> NodeSpec {
    NodeSpec::sandboxed(name, source, capabilities.iter().copied())
}

fn registry() -> CapabilityRegistry {
    CapabilityRegistry::new()
        .with(
            "log.info",
            capability_fn(|_args: Vec<Value>| async move { Ok(Value::Null) }),
        )
        .with(
            "calc.double",
            capability_fn(|args: Vec<Value>| async move {
                let n = args
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| CapabilityError::InvalidArguments("expected a number".into()))?;
                Ok(json!(n * 2))
            }),
        )
        .with(
            "db.query",
            capability_fn(|args: Vec<Value>| async move {
                Ok(json!({ "sql": args[0].clone(), "rows": [1, 2, 3] }))
            }),
        )
        .with(
            "db.broken",
            capability_fn(|_args: Vec<Value>| async move {
                Err(CapabilityError::failed("database is down"))
            }),
        )
        .with(
            "secret.read",
            capability_fn(|_args: Vec<Value>| async move { Ok(json!("hunter2")) }),
        )
}

#[cfg(not(feature = "sandbox"))]
#[tokio::test]
async fn test_sandboxed_nodes_need_sandbox_support() {
    let runtime = FlowRuntime::new();
    let err = runtime
        .create_workflow(
            "restricted",
            WorkflowDefinition::new().node(script("start", "next(next.SUCCESS, input)", &[])),
        )
        .await
        .unwrap_err();

    assert_eq!(
        err,
        WorkflowError::UnsupportedEnvironment {
            node: "start".into()
        }
    );
}

#[cfg(feature = "sandbox")]
mod lua {
    use super::*;

    #[tokio::test]
    async fn test_missing_capability_fails_at_construction() {
        let runtime = FlowRuntime::new();
        let err = runtime
            .create_workflow(
                "restricted",
                WorkflowDefinition::new()
                    .capabilities(registry())
                    .node(script("start", "next(next.SUCCESS, input)", &["log.info", "net.fetch"])),
            )
            .await
            .unwrap_err();

        assert_eq!(
            err,
            WorkflowError::MissingCapability {
                node: "start".into(),
                path: "net.fetch".into()
            }
        );
        assert!(runtime.workflow("restricted").await.is_none());
        assert_eq!(runtime.worker_count().await, 0, "Validation must not provision a worker");
    }

    #[tokio::test]
    async fn test_script_success() {
        let runtime = FlowRuntime::new();
        runtime
            .create_workflow(
                "hello",
                WorkflowDefinition::new().node(script(
                    "start",
                    r#"next(next.SUCCESS, { message = "hello " .. input.name })"#,
                    &[],
                )),
            )
            .await
            .unwrap();

        let result = runtime.execute("hello", json!({ "name": "lua" })).await;

        assert!(result.success, "Workflow should succeed: {:?}", result.error);
        assert_eq!(result.message(), Some("hello lua"));
        assert_eq!(result.path, vec!["start", "SUCCESS"]);
        assert_eq!(runtime.worker_count().await, 1);
    }

    #[tokio::test]
    async fn test_scope_has_no_ambient_access() {
        let runtime = FlowRuntime::new();
        runtime
            .create_workflow(
                "isolated",
                WorkflowDefinition::new().capabilities(registry()).node(script(
                    "start",
                    r#"
                    next(next.SUCCESS, {
                        os = type(os),
                        io = type(io),
                        require = type(require),
                        load = type(load),
                        dofile = type(dofile),
                        debug = type(debug),
                        package = type(package),
                        secret = type(secret),
                        log = type(log),
                        info = type(log.info),
                        string = type(string.upper),
                    })
                    "#,
                    &["log.info"],
                )),
            )
            .await
            .unwrap();

        let result = runtime.execute("isolated", json!({})).await;

        assert!(result.success, "Isolated scope should run: {:?}", result.error);
        assert_eq!(
            result.value,
            Some(json!({
                "os": "nil",
                "io": "nil",
                "require": "nil",
                "load": "nil",
                "dofile": "nil",
                "debug": "nil",
                "package": "nil",
                "secret": "nil",
                "log": "table",
                "info": "function",
                "string": "function",
            }))
        );
    }

    #[tokio::test]
    async fn test_unlisted_capability_is_not_reachable() {
        let runtime = FlowRuntime::new();
        runtime
            .create_workflow(
                "sneaky",
                WorkflowDefinition::new().capabilities(registry()).node(script(
                    "start",
                    r#"next(next.SUCCESS, { value = secret.read() })"#,
                    &["log.info"],
                )),
            )
            .await
            .unwrap();

        let result = runtime.execute("sneaky", json!({})).await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("secret"), "Unexpected error: {}", error);
    }

    #[tokio::test]
    async fn test_globals_do_not_leak_between_activations() {
        let runtime = FlowRuntime::new();
        runtime
            .create_workflow(
                "leaky",
                WorkflowDefinition::new().node(script(
                    "start",
                    r#"
                    local seen = leaked
                    leaked = true
                    string.extra = "patched"
                    next(next.SUCCESS, { seen = type(seen), patched = type(string.extra) })
                    "#,
                    &[],
                )),
            )
            .await
            .unwrap();

        runtime.execute("leaky", json!({})).await;
        let second = runtime.execute("leaky", json!({})).await;

        assert_eq!(second.value, Some(json!({ "seen": "nil", "patched": "string" })));
        // The patch above was made on this activation's copy only.
        let third = runtime.execute("leaky", json!({})).await;
        assert_eq!(third.value, second.value);
    }

    #[tokio::test]
    async fn test_capability_relay() {
        let runtime = FlowRuntime::new();
        runtime
            .create_workflow(
                "query",
                WorkflowDefinition::new().capabilities(registry()).node(script(
                    "start",
                    r#"
                    local result = db.query("select 1")
                    next(next.SUCCESS, { sql = result.sql, count = #result.rows, doubled = calc.double(21) })
                    "#,
                    &["db.query", "calc.double"],
                )),
            )
            .await
            .unwrap();

        let result = runtime.execute("query", json!({})).await;

        assert!(result.success, "Workflow should succeed: {:?}", result.error);
        assert_eq!(
            result.value,
            Some(json!({ "sql": "select 1", "count": 3, "doubled": 42 }))
        );
    }

    #[tokio::test]
    async fn test_capability_error_propagates() {
        let runtime = FlowRuntime::new();
        runtime
            .create_workflow(
                "broken",
                WorkflowDefinition::new().capabilities(registry()).node(script(
                    "start",
                    r#"
                    db.broken()
                    next(next.SUCCESS, input)
                    "#,
                    &["db.broken"],
                )),
            )
            .await
            .unwrap();

        let result = runtime.execute("broken", json!({})).await;

        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Capability 'db.broken' failed: database is down")
        );
    }

    #[tokio::test]
    async fn test_script_can_recover_from_capability_error() {
        let runtime = FlowRuntime::new();
        runtime
            .create_workflow(
                "guarded",
                WorkflowDefinition::new().capabilities(registry()).node(script(
                    "start",
                    r#"
                    local ok = pcall(db.broken)
                    next(next.SUCCESS, { ok = ok })
                    "#,
                    &["db.broken"],
                )),
            )
            .await
            .unwrap();

        let result = runtime.execute("guarded", json!({})).await;

        assert!(result.success);
        assert_eq!(result.value, Some(json!({ "ok": false })));
    }

    #[tokio::test]
    async fn test_script_error_becomes_failed_result() {
        let runtime = FlowRuntime::new();
        runtime
            .create_workflow(
                "throws",
                WorkflowDefinition::new().node(script("start", r#"error("bad input")"#, &[])),
            )
            .await
            .unwrap();

        let result = runtime.execute("throws", json!({})).await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("bad input"), "Unexpected error: {}", error);
        assert_eq!(runtime.worker_count().await, 1, "Script errors keep the worker");
    }

    #[tokio::test]
    async fn test_syntax_error_fails_to_load() {
        let runtime = FlowRuntime::new();
        runtime
            .create_workflow(
                "garbled",
                WorkflowDefinition::new().node(script("start", "next(next.SUCCESS,", &[])),
            )
            .await
            .unwrap();

        let result = runtime.execute("garbled", json!({})).await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(
            error.starts_with("Failed to load sandboxed logic"),
            "Unexpected error: {}",
            error
        );
    }

    #[tokio::test]
    async fn test_sandboxed_fan_out() {
        let runtime = FlowRuntime::new();
        runtime
            .create_workflow(
                "math",
                WorkflowDefinition::new()
                    .node(script(
                        "start",
                        r#"
                        next("mult", input)
                        next("plus", input)
                        "#,
                        &[],
                    ))
                    .node(script("mult", r#"next("result", { m = input.a * input.b })"#, &[]))
                    .node(script("plus", r#"next("result", { p = input.a + input.b })"#, &[]))
                    .node(script(
                        "result",
                        r#"next(next.SUCCESS, { message = "result is " .. (input.m + input.p) })"#,
                        &[],
                    )),
            )
            .await
            .unwrap();

        let result = runtime.execute("math", json!({ "a": 3, "b": 2 })).await;

        assert!(result.success, "Workflow should succeed: {:?}", result.error);
        assert_eq!(result.message(), Some("result is 11"));
        assert_eq!(runtime.worker_count().await, 1, "One worker per workflow");
    }

    #[tokio::test]
    async fn test_concurrent_activations_share_one_worker() {
        let runtime = Arc::new(FlowRuntime::new());
        runtime
            .create_workflow(
                "double",
                WorkflowDefinition::new().capabilities(registry()).node(script(
                    "start",
                    r#"next(next.SUCCESS, { value = calc.double(input.n) })"#,
                    &["calc.double"],
                )),
            )
            .await
            .unwrap();

        let mut handles = Vec::new();
        for n in 0..10i64 {
            let runtime = runtime.clone();
            handles.push(tokio::spawn(async move {
                (n, runtime.execute("double", json!({ "n": n })).await)
            }));
        }

        for handle in handles {
            let (n, result) = handle.await.unwrap();
            assert!(result.success, "Execution {} failed: {:?}", n, result.error);
            assert_eq!(result.value, Some(json!({ "value": n * 2 })));
        }
        assert_eq!(runtime.worker_count().await, 1);
    }

    #[tokio::test]
    async fn test_timeout_and_worker_lifecycle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = registry().with(
            "slow",
            capability_fn(move |_args: Vec<Value>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(400)).await;
                    Ok(Value::Null)
                }
            }),
        );
        let config = RuntimeConfig {
            sandbox: SandboxConfig::with_timeout(Duration::from_millis(100)),
            ..RuntimeConfig::default()
        };
        let runtime = FlowRuntime::with_config(config);
        runtime
            .create_workflow(
                "sleepy",
                WorkflowDefinition::new().capabilities(registry).node(script(
                    "start",
                    r#"
                    if input.slow then slow() end
                    next(next.SUCCESS, { done = true })
                    "#,
                    &["slow"],
                )),
            )
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let result = runtime.execute("sleepy", json!({ "slow": true })).await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("timeout"), "Unexpected error: {}", error);
        assert!(started.elapsed() < Duration::from_millis(400), "Timeout must not wait for the capability");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.worker_count().await, 1, "A timeout leaves the worker bound");

        assert!(runtime.remove_worker("sleepy").await);
        assert!(!runtime.remove_worker("sleepy").await, "Removal is idempotent");
        assert_eq!(runtime.worker_count().await, 0);

        let result = runtime.execute("sleepy", json!({ "slow": false })).await;
        assert!(result.success, "Re-provisioned worker should run: {:?}", result.error);
        assert_eq!(runtime.worker_count().await, 1);

        runtime.cleanup().await;
        runtime.cleanup().await;
        assert_eq!(runtime.worker_count().await, 0);
    }

    #[tokio::test]
    async fn test_print_output_is_logged() {
        let entries: Arc<Mutex<Vec<ActivationLog>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = entries.clone();
        let logger = logger_fn(move |entry: &ActivationLog| {
            sink.lock().unwrap().push(entry.clone());
            Ok(())
        });
        let runtime = FlowRuntime::with_logger(RuntimeConfig::default(), Arc::new(logger));
        runtime
            .create_workflow(
                "printer",
                WorkflowDefinition::new().node(script(
                    "start",
                    r#"
                    print("hello", 42)
                    next(next.SUCCESS, input)
                    "#,
                    &[],
                )),
            )
            .await
            .unwrap();

        runtime.execute("printer", json!({ "x": 1 })).await;

        let entries = entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].sandboxed);
        assert_eq!(entries[0].logs, vec!["hello\t42".to_string()]);
        assert_eq!(entries[0].output[0].target, "SUCCESS");
        assert_eq!(entries[0].output[0].data, json!({ "x": 1 }));
    }

    #[tokio::test]
    async fn test_remove_workflow_tears_down_worker() {
        let runtime = FlowRuntime::new();
        runtime
            .create_workflow(
                "short-lived",
                WorkflowDefinition::new().node(script("start", "next(next.SUCCESS, input)", &[])),
            )
            .await
            .unwrap();

        runtime.execute("short-lived", json!({})).await;
        assert_eq!(runtime.worker_count().await, 1);

        runtime.remove_workflow("short-lived").await.unwrap();
        assert_eq!(runtime.worker_count().await, 0);
    }

    #[tokio::test]
    async fn test_null_reads_as_nil() {
        let runtime = FlowRuntime::new();
        runtime
            .create_workflow(
                "nulls",
                WorkflowDefinition::new().capabilities(registry()).node(script(
                    "start",
                    r#"
                    local logged = log.info("x")
                    next(next.SUCCESS, {
                        isnil = input.x == nil,
                        truthy = input.x and true or false,
                        logged = logged == nil,
                    })
                    "#,
                    &["log.info"],
                )),
            )
            .await
            .unwrap();

        let result = runtime.execute("nulls", json!({ "x": null })).await;

        assert!(result.success, "Workflow should succeed: {:?}", result.error);
        assert_eq!(
            result.value,
            Some(json!({ "isnil": true, "truthy": false, "logged": true }))
        );
    }

    /// Threads named after the workflow's worker.
    #[cfg(target_os = "linux")]
    fn sandbox_threads(workflow: &str) -> usize {
        // The kernel truncates thread names to 15 bytes.
        let name: String = format!("sandbox-{}", workflow).chars().take(15).collect();
        std::fs::read_dir("/proc/self/task")
            .unwrap()
            .filter_map(|task| std::fs::read_to_string(task.ok()?.path().join("comm")).ok())
            .filter(|comm| comm.trim_end() == name)
            .count()
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_runaway_script_is_interrupted() {
        let config = RuntimeConfig {
            sandbox: SandboxConfig::with_timeout(Duration::from_millis(200)),
            ..RuntimeConfig::default()
        };
        let runtime = FlowRuntime::with_config(config);
        runtime
            .create_workflow(
                "spin",
                WorkflowDefinition::new().node(script(
                    "start",
                    r#"
                    if input.spin then
                        while true do pcall(function() while true do end end) end
                    end
                    next(next.SUCCESS, input)
                    "#,
                    &[],
                )),
            )
            .await
            .unwrap();

        let result = runtime.execute("spin", json!({ "spin": true })).await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("timeout"), "Unexpected error: {}", error);

        // The timed-out script no longer holds the worker.
        let result = runtime.execute("spin", json!({ "spin": false })).await;
        assert!(result.success, "Follow-up should succeed: {:?}", result.error);
        assert_eq!(sandbox_threads("spin"), 1);

        // A script still spinning at teardown stops with its thread.
        let runtime = Arc::new(runtime);
        let spinning = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.execute("spin", json!({ "spin": true })).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        runtime.cleanup().await;
        assert_eq!(runtime.worker_count().await, 0);

        let mut remaining = sandbox_threads("spin");
        for _ in 0..50 {
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            remaining = sandbox_threads("spin");
        }
        assert_eq!(remaining, 0, "Worker thread should exit after cleanup");
        assert!(!spinning.await.unwrap().success);
    }
}
