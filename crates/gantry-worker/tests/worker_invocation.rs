//! End-to-end tests driving a worker over an in-memory duplex stream.
//!
//! Each test plays the host: it runs the init handshake, loads function
//! metadata, sends invocation requests as raw NDJSON envelopes, and
//! asserts on the correlated responses coming back. User functions are
//! registered in-process through the registry.

#![cfg(feature = "testing")]

use std::sync::Arc;
use std::sync::Mutex;

use indexmap::IndexMap;
use tokio::sync::Notify;

use gantry_worker::HookContext;
use gantry_worker::HookPoint;
use gantry_worker::Value;
use gantry_worker::WorkerConfig;
use gantry_worker::WorkerState;
use gantry_worker::test_support::WorkerHarness;
use gantry_worker::wire::BindingInfo;
use gantry_worker::wire::Direction;
use gantry_worker::wire::FunctionMetadata;
use gantry_worker::wire::HttpData;
use gantry_worker::wire::InvocationRequest;
use gantry_worker::wire::LogLevel;
use gantry_worker::wire::NamedValue;
use gantry_worker::wire::Payload;
use gantry_worker::wire::TypedValue;

fn metadata(id: &str, name: &str, bindings: &[(&str, &str, Direction)]) -> FunctionMetadata {
    let mut metadata = FunctionMetadata {
        id: id.to_string(),
        name: name.to_string(),
        ..FunctionMetadata::default()
    };
    for (binding_name, binding_type, direction) in bindings {
        metadata
            .bindings
            .insert(binding_name.to_string(), BindingInfo::new(*binding_type, *direction));
    }
    metadata
}

fn invocation(invocation_id: &str, function_id: &str, inputs: Vec<NamedValue>) -> Payload {
    Payload::InvocationRequest(InvocationRequest {
        invocation_id: invocation_id.to_string(),
        function_id: function_id.to_string(),
        input_data: inputs,
        trigger_metadata: IndexMap::new(),
    })
}

fn http_input(name: &str) -> NamedValue {
    NamedValue {
        name: name.to_string(),
        data: TypedValue::Http(Box::new(HttpData {
            method: "GET".to_string(),
            url: "http://localhost/api/run".to_string(),
            body: Some(Box::new(TypedValue::Json("{\"name\":\"pat\"}".to_string()))),
            ..HttpData::default()
        })),
    }
}

async fn started_worker() -> anyhow::Result<(Arc<WorkerState>, WorkerHarness)> {
    let state = Arc::new(WorkerState::new(WorkerConfig::new("test-worker")));
    let mut harness = WorkerHarness::spawn(Arc::clone(&state));
    harness.init().await?;
    Ok((state, harness))
}

// ---------------------------------------------------------------------------
// Output resolution over the wire
// ---------------------------------------------------------------------------

#[tokio::test]
async fn http_output_from_bindings_map() -> anyhow::Result<()> {
    let (state, mut harness) = started_worker().await?;
    state.register_function(
        "hello",
        Arc::new(|ctx, _inputs| {
            Box::pin(async move {
                let greeting = ctx
                    .http_request()
                    .and_then(|req| req.body.as_object().and_then(|b| b.get("name")).cloned())
                    .unwrap_or(Value::String("stranger".to_string()));
                ctx.set_binding(
                    "res",
                    Value::object([
                        ("statusCode", Value::Int(200)),
                        ("body", Value::object([("greeting", greeting)])),
                    ]),
                );
                Ok(None)
            })
        }),
    );
    harness
        .load_function(metadata(
            "f-hello",
            "hello",
            &[("req", "httpTrigger", Direction::In), ("res", "http", Direction::Out)],
        ))
        .await?;

    harness.send_payload("c-1", invocation("inv-1", "f-hello", vec![http_input("req")])).await?;
    let response = harness.recv().await?;

    assert_eq!(response.kind, "invocationResponse");
    assert_eq!(response.correlation_id.as_deref(), Some("c-1"));
    assert_eq!(response.body["invocationId"], "inv-1");
    assert_eq!(response.body["result"]["status"], "Success");
    assert_eq!(response.body["outputData"][0]["name"], "res");
    let http = &response.body["outputData"][0]["data"]["http"];
    assert_eq!(http["statusCode"], "200");
    let body_json: serde_json::Value = serde_json::from_str(http["body"]["json"].as_str().unwrap())?;
    assert_eq!(body_json["greeting"], "pat");
    harness.terminate().await
}

#[tokio::test]
async fn http_return_binding_fills_return_value() -> anyhow::Result<()> {
    let (state, mut harness) = started_worker().await?;
    state.register_function(
        "create",
        Arc::new(|_ctx, _inputs| {
            Box::pin(async move {
                Ok(Some(Value::object([
                    ("status", Value::Int(201)),
                    ("body", Value::String("created".to_string())),
                ])))
            })
        }),
    );
    harness
        .load_function(metadata(
            "f-create",
            "create",
            &[("req", "httpTrigger", Direction::In), ("$return", "http", Direction::Out)],
        ))
        .await?;

    harness.send_payload("c-1", invocation("inv-1", "f-create", vec![http_input("req")])).await?;
    let response = harness.recv().await?;

    assert_eq!(response.body["result"]["status"], "Success");
    // The return binding is carried in returnValue, never in outputData.
    assert!(response.body.get("outputData").is_none());
    let http = &response.body["returnValue"]["http"];
    assert_eq!(http["statusCode"], "201");
    assert_eq!(http["body"]["string"], "created");
    harness.terminate().await
}

#[tokio::test]
async fn http_output_defaults_to_response_builder_state() -> anyhow::Result<()> {
    let (state, mut harness) = started_worker().await?;
    state.register_function(
        "nocontent",
        Arc::new(|ctx, _inputs| {
            Box::pin(async move {
                ctx.http_response().status(204).header("x-served-by", "gantry");
                ctx.http_response().send();
                Ok(None)
            })
        }),
    );
    harness
        .load_function(metadata(
            "f-nc",
            "nocontent",
            &[("req", "httpTrigger", Direction::In), ("res", "http", Direction::Out)],
        ))
        .await?;

    harness.send_payload("c-1", invocation("inv-1", "f-nc", vec![http_input("req")])).await?;
    let response = harness.recv().await?;

    assert_eq!(response.body["result"]["status"], "Success");
    let http = &response.body["outputData"][0]["data"]["http"];
    assert_eq!(http["statusCode"], "204");
    assert_eq!(http["headers"]["x-served-by"], "gantry");
    harness.terminate().await
}

#[tokio::test]
async fn activity_trigger_preserves_falsy_zero_return() -> anyhow::Result<()> {
    let (state, mut harness) = started_worker().await?;
    state.register_function(
        "count",
        Arc::new(|_ctx, _inputs| Box::pin(async move { Ok(Some(Value::Int(0))) })),
    );
    harness
        .load_function(metadata("f-count", "count", &[("input", "activityTrigger", Direction::In)]))
        .await?;

    harness
        .send_payload(
            "c-1",
            invocation("inv-1", "f-count", vec![NamedValue {
                name: "input".to_string(),
                data: TypedValue::Json("{}".to_string()),
            }]),
        )
        .await?;
    let response = harness.recv().await?;

    assert_eq!(response.body["result"]["status"], "Success");
    assert_eq!(response.body["returnValue"]["int"], 0);
    harness.terminate().await
}

// ---------------------------------------------------------------------------
// Trigger metadata and hooks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn trigger_metadata_is_camel_cased_into_binding_data() -> anyhow::Result<()> {
    let (state, mut harness) = started_worker().await?;
    let seen = Arc::new(Mutex::new(None::<Value>));
    let seen_clone = Arc::clone(&seen);
    state.register_function(
        "peek",
        Arc::new(move |ctx, _inputs| {
            let seen = Arc::clone(&seen_clone);
            Box::pin(async move {
                *seen.lock().unwrap() = Some(ctx.binding_data().clone());
                Ok(None)
            })
        }),
    );
    harness
        .load_function(metadata("f-peek", "peek", &[("q", "queueTrigger", Direction::In)]))
        .await?;

    let mut trigger_metadata = IndexMap::new();
    trigger_metadata.insert("DequeueCount".to_string(), TypedValue::Json("3".to_string()));
    trigger_metadata.insert(
        "Metadata".to_string(),
        TypedValue::Json("{\"Inner\":{\"DeliveryAttempt\":1}}".to_string()),
    );
    harness
        .send_payload(
            "c-1",
            Payload::InvocationRequest(InvocationRequest {
                invocation_id: "inv-1".to_string(),
                function_id: "f-peek".to_string(),
                input_data: vec![NamedValue {
                    name: "q".to_string(),
                    data: TypedValue::String("item".to_string()),
                }],
                trigger_metadata,
            }),
        )
        .await?;
    let response = harness.recv().await?;
    assert_eq!(response.body["result"]["status"], "Success");

    let binding_data = seen.lock().unwrap().take().expect("function observed bindingData");
    let entries = binding_data.as_object().expect("bindingData is an object");
    assert_eq!(entries.get("dequeueCount"), Some(&Value::Int(3)));
    let inner = entries.get("metadata").and_then(Value::as_object).expect("nested object");
    let attempt = inner.get("inner").and_then(Value::as_object).expect("keys camel-cased recursively");
    assert_eq!(attempt.get("deliveryAttempt"), Some(&Value::Int(1)));
    assert_eq!(entries.get("invocationId"), Some(&Value::String("inv-1".to_string())));
    harness.terminate().await
}

#[tokio::test]
async fn pre_invocation_hook_replaces_inputs() -> anyhow::Result<()> {
    let (state, mut harness) = started_worker().await?;
    state.register_hook(
        HookPoint::PreInvocation,
        Arc::new(|ctx: &mut HookContext| {
            Box::pin(async move {
                if let Some(pre) = ctx.as_pre_mut() {
                    pre.inputs = vec![Value::String("swapped".to_string())];
                }
                Ok(())
            })
        }),
    );
    state.register_function(
        "echo",
        Arc::new(|_ctx, inputs| Box::pin(async move { Ok(Some(inputs[0].clone())) })),
    );
    harness
        .load_function(metadata("f-echo", "echo", &[("input", "queueTrigger", Direction::In)]))
        .await?;

    harness
        .send_payload(
            "c-1",
            invocation("inv-1", "f-echo", vec![NamedValue {
                name: "input".to_string(),
                data: TypedValue::String("original".to_string()),
            }]),
        )
        .await?;
    let response = harness.recv().await?;
    assert_eq!(response.body["returnValue"]["string"], "swapped");
    harness.terminate().await
}

// ---------------------------------------------------------------------------
// Interleaving, duplicate completion, cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invocations_complete_out_of_order() -> anyhow::Result<()> {
    let (state, mut harness) = started_worker().await?;
    let release = Arc::new(Notify::new());
    let release_clone = Arc::clone(&release);
    state.register_function(
        "slow",
        Arc::new(move |_ctx, _inputs| {
            let release = Arc::clone(&release_clone);
            Box::pin(async move {
                release.notified().await;
                Ok(Some(Value::String("slow".to_string())))
            })
        }),
    );
    state.register_function(
        "fast",
        Arc::new(|_ctx, _inputs| Box::pin(async move { Ok(Some(Value::String("fast".to_string()))) })),
    );
    harness.load_function(metadata("f-slow", "slow", &[("q", "queueTrigger", Direction::In)])).await?;
    harness.load_function(metadata("f-fast", "fast", &[("q", "queueTrigger", Direction::In)])).await?;

    harness.send_payload("c-slow", invocation("inv-slow", "f-slow", Vec::new())).await?;
    harness.send_payload("c-fast", invocation("inv-fast", "f-fast", Vec::new())).await?;

    // The second request overtakes the first.
    let first = harness.recv().await?;
    assert_eq!(first.correlation_id.as_deref(), Some("c-fast"));
    assert_eq!(first.body["invocationId"], "inv-fast");
    assert_eq!(first.body["returnValue"]["string"], "fast");

    release.notify_one();
    let second = harness.recv().await?;
    assert_eq!(second.correlation_id.as_deref(), Some("c-slow"));
    assert_eq!(second.body["invocationId"], "inv-slow");
    assert_eq!(second.body["returnValue"]["string"], "slow");
    harness.terminate().await
}

#[tokio::test]
async fn duplicate_done_yields_one_response_and_a_warning() -> anyhow::Result<()> {
    let (state, mut harness) = started_worker().await?;
    state.register_function(
        "eager",
        Arc::new(|ctx, _inputs| {
            Box::pin(async move {
                ctx.done(None, Some(Value::String("first".to_string())));
                ctx.done(None, Some(Value::String("second".to_string())));
                Ok(None)
            })
        }),
    );
    harness.load_function(metadata("f-eager", "eager", &[("q", "queueTrigger", Direction::In)])).await?;

    harness.send_payload("c-1", invocation("inv-1", "f-eager", Vec::new())).await?;
    let response = harness.recv().await?;
    assert_eq!(response.body["result"]["status"], "Success");
    assert_eq!(response.body["returnValue"]["string"], "first");

    // A status round-trip proves no second invocation response was queued.
    harness.send_payload("c-2", Payload::WorkerStatusRequest(Default::default())).await?;
    let next = harness.recv().await?;
    assert_eq!(next.kind, "workerStatusResponse");

    assert!(
        harness.log_messages().iter().any(|m| m.contains("already signaled")),
        "expected a duplicate-completion warning, got {:?}",
        harness.log_messages()
    );
    harness.terminate().await
}

#[tokio::test]
async fn empty_user_log_message_does_not_kill_the_worker() -> anyhow::Result<()> {
    let (state, mut harness) = started_worker().await?;
    state.register_function(
        "chatty",
        Arc::new(|ctx, _inputs| {
            Box::pin(async move {
                ctx.log(LogLevel::Information, "");
                Ok(Some(Value::String("done".to_string())))
            })
        }),
    );
    harness.load_function(metadata("f-chatty", "chatty", &[("q", "queueTrigger", Direction::In)])).await?;

    harness.send_payload("c-1", invocation("inv-1", "f-chatty", Vec::new())).await?;
    let response = harness.recv().await?;
    assert_eq!(response.body["result"]["status"], "Success");
    assert_eq!(response.body["returnValue"]["string"], "done");
    harness.terminate().await
}

#[tokio::test]
async fn cancellation_reaches_a_running_function() -> anyhow::Result<()> {
    let (state, mut harness) = started_worker().await?;
    let started = Arc::new(Notify::new());
    let started_clone = Arc::clone(&started);
    state.register_function(
        "watcher",
        Arc::new(move |ctx, _inputs| {
            let started = Arc::clone(&started_clone);
            Box::pin(async move {
                started.notify_one();
                while !ctx.is_cancelled() {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
                Ok(Some(Value::String("observed-cancel".to_string())))
            })
        }),
    );
    harness.load_function(metadata("f-w", "watcher", &[("q", "queueTrigger", Direction::In)])).await?;

    harness.send_payload("c-1", invocation("inv-1", "f-w", Vec::new())).await?;
    // The dispatcher routes invocations asynchronously; wait until the
    // function is actually running so the cancel cannot race ahead of it.
    started.notified().await;
    harness
        .send_payload(
            "c-cancel",
            Payload::InvocationCancel(gantry_worker::wire::InvocationCancel {
                invocation_id: "inv-1".to_string(),
            }),
        )
        .await?;

    let response = harness.recv().await?;
    assert_eq!(response.body["invocationId"], "inv-1");
    assert_eq!(response.body["returnValue"]["string"], "observed-cancel");
    harness.terminate().await
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn init_load_status_terminate_round_trip() -> anyhow::Result<()> {
    let state = Arc::new(WorkerState::new(
        WorkerConfig::new("test-worker").with_capability("RpcHttpBodyOnly", "true"),
    ));
    let mut harness = WorkerHarness::spawn(Arc::clone(&state));

    harness
        .send_payload(
            "c-init",
            Payload::WorkerInitRequest(gantry_worker::wire::WorkerInitRequest {
                host_version: "4.28.0".to_string(),
            }),
        )
        .await?;
    let init = harness.recv().await?;
    assert_eq!(init.kind, "workerInitResponse");
    assert_eq!(init.body["capabilities"]["RpcHttpBodyOnly"], "true");
    assert_eq!(init.body["workerVersion"], env!("CARGO_PKG_VERSION"));

    state.register_function("noop", Arc::new(|_ctx, _inputs| Box::pin(async move { Ok(None) })));
    harness.load_function(metadata("f-noop", "noop", &[])).await?;
    assert_eq!(state.functions().loaded_count(), 1);

    harness.send_payload("c-status", Payload::WorkerStatusRequest(Default::default())).await?;
    let status = harness.recv().await?;
    assert_eq!(status.kind, "workerStatusResponse");
    assert_eq!(status.correlation_id.as_deref(), Some("c-status"));

    harness.terminate().await
}

#[tokio::test]
async fn app_start_hook_sees_host_version_and_shares_app_data() -> anyhow::Result<()> {
    let state = Arc::new(WorkerState::new(WorkerConfig::new("test-worker")));
    state.register_hook(
        HookPoint::AppStart,
        Arc::new(|ctx: &mut HookContext| {
            Box::pin(async move {
                let start = ctx.as_app_start().expect("appStart context");
                let version = start.host_version.clone();
                start.hook_data().insert("hostVersion", Value::String(version));
                Ok(())
            })
        }),
    );
    let mut harness = WorkerHarness::spawn(Arc::clone(&state));
    harness.init().await?;

    // appStart hook_data is the app-wide map shared with invocation hooks.
    assert_eq!(
        state.app_hook_data().get("hostVersion"),
        Some(Value::String("4.0-test".to_string()))
    );
    harness.terminate().await
}
