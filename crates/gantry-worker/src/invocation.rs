//! Per-invocation orchestration state machine.
//!
//! One invocation flows `ReceivingArguments → PreHooks → Executing →
//! PostHooks → Responding → Done`; an error entered from any state still
//! flows through `PostHooks` before `Responding`, so post hooks observe
//! failures as well as successes. Resolution and metadata failures
//! short-circuit to a failure response without entering the hook phases.
//!
//! The callable runs as a spawned task feeding the completion guard's
//! future-style producer; the orchestrator awaits only the guard's first
//! signal, so a callback-style `done()` and the returned future genuinely
//! race rather than sequence.

use std::sync::Arc;

use futures::FutureExt;
use indexmap::IndexMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::app::WorkerState;
use crate::completion::Completion;
use crate::completion::CompletionGuard;
use crate::completion::CompletionMode;
use crate::context::InvocationContext;
use crate::convert;
use crate::convert::JsonCoercion;
use crate::dispatch::OutboundMessage;
use crate::hooks::HookContext;
use crate::hooks::HookPoint;
use crate::hooks::SharedMap;
use crate::logging::WireLogger;
use crate::registry::FunctionResolver;
use crate::value::Value;
use crate::wire::Envelope;
use crate::wire::InvocationRequest;
use crate::wire::InvocationResponse;
use crate::wire::LogLevel;
use crate::wire::Payload;
use crate::wire::Status;
use crate::wire::StatusResult;
use crate::wire::TypedValue;

/// Drives invocations end to end against a shared [`WorkerState`].
pub struct InvocationOrchestrator {
    state: Arc<WorkerState>,
    resolver: Arc<dyn FunctionResolver>,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
}

impl InvocationOrchestrator {
    pub fn new(
        state: Arc<WorkerState>,
        resolver: Arc<dyn FunctionResolver>,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Self {
        Self {
            state,
            resolver,
            outbound,
        }
    }

    /// Run one invocation to completion and write its response.
    ///
    /// Every invocation-scoped failure is caught here and turned into a
    /// failure response; nothing propagates out to terminate the worker or
    /// disturb concurrent invocations.
    pub async fn invoke(&self, request: InvocationRequest, correlation_id: Option<String>) {
        let invocation_id = request.invocation_id.clone();
        let logger = WireLogger::new(self.outbound.clone(), "gantry.invocation").for_invocation(&invocation_id);
        debug!(invocation_id = %invocation_id, function_id = %request.function_id, "invocation received");

        let cancellation = self.state.track_invocation(&invocation_id);
        let response = self.run_lifecycle(request, &logger, cancellation).await;
        self.state.finish_invocation(&invocation_id);

        let envelope = Envelope::new(correlation_id, Payload::InvocationResponse(response));
        let _ = self.outbound.send(OutboundMessage::Envelope(envelope));
    }

    async fn run_lifecycle(
        &self,
        request: InvocationRequest,
        logger: &WireLogger,
        cancellation: tokio_util::sync::CancellationToken,
    ) -> InvocationResponse {
        let invocation_id = request.invocation_id.clone();

        // ReceivingArguments: resolve metadata and callable, then build the
        // context from the wire inputs. Failures here short-circuit to a
        // failure response without entering the hook phases.
        let Some(metadata) = self.state.functions().get(&request.function_id) else {
            return failure_response(
                &invocation_id,
                &format!("function '{}' is not loaded", request.function_id),
                String::new(),
            );
        };
        let function = match self.resolver.resolve(&metadata).await {
            Ok(function) => function,
            Err(e) => return failure_response(&invocation_id, &e.to_string(), String::new()),
        };

        let (guard, completion_rx) = CompletionGuard::channel(logger.clone());
        let (context, inputs) = build_context(&request, &metadata.name, guard.clone(), logger.clone(), cancellation);

        // PreHooks: hooks may replace the callable and edit inputs; what
        // they leave behind is what gets invoked.
        let hook_data = SharedMap::new();
        let mut hook_ctx = HookContext::pre(
            hook_data.clone(),
            self.state.app_hook_data().clone(),
            context.clone(),
            inputs,
            function,
        );
        let pre_hook_error = self
            .state
            .hooks()
            .execute(HookPoint::PreInvocation, &mut hook_ctx, logger)
            .await
            .err();
        let Some(pre_ctx) = hook_ctx.as_pre_mut() else {
            // Construction pairs the context variant with the hook point.
            unreachable!("preInvocation context variant");
        };
        let function = Arc::clone(&pre_ctx.function);
        let inputs = std::mem::take(&mut pre_ctx.inputs);

        // Executing: skipped when pre-hooks failed or the host already
        // cancelled; the cancellation check is cooperative, at a phase
        // boundary only.
        let (mut result, mut error) = match pre_hook_error {
            Some(hook_error) => (None, Some(anyhow::Error::from(hook_error))),
            None => {
                if context.is_cancelled() {
                    return InvocationResponse {
                        invocation_id,
                        result: StatusResult {
                            status: Status::Cancelled,
                            exception: None,
                        },
                        output_data: Vec::new(),
                        return_value: None,
                    };
                }
                let completion = execute_function(function, context.clone(), inputs.clone(), guard.clone(), completion_rx).await;
                match completion.mode {
                    CompletionMode::Callback => debug!(invocation_id = %invocation_id, "completed via callback"),
                    CompletionMode::Future => debug!(invocation_id = %invocation_id, "completed via returned future"),
                }
                (completion.result, completion.error)
            }
        };

        // PostHooks: observe success or failure alike; hooks may replace
        // the result or clear the error, and the response is built from
        // whatever they leave behind. A failure inside this phase is
        // terminal for the invocation.
        guard.set_post_hooks_active(true);
        let mut hook_ctx = HookContext::post(
            hook_data,
            self.state.app_hook_data().clone(),
            context.clone(),
            inputs,
            result,
            error,
        );
        let post_hook_error = self
            .state
            .hooks()
            .execute(HookPoint::PostInvocation, &mut hook_ctx, logger)
            .await
            .err();
        guard.set_post_hooks_active(false);
        let Some(post_ctx) = hook_ctx.as_post_mut() else {
            unreachable!("postInvocation context variant");
        };
        result = post_ctx.result.take();
        error = match post_hook_error {
            Some(hook_error) => Some(anyhow::Error::from(hook_error)),
            None => post_ctx.error.take(),
        };

        // Responding.
        if let Some(error) = error {
            return failure_response(&invocation_id, &format!("{error}"), error_stack(&error, &metadata.name));
        }
        let resolved = convert::resolve_outputs(
            &metadata,
            result.as_ref(),
            &context.bindings_snapshot(),
            Some(&context.http_response().state()),
        );
        match resolved {
            Ok(resolved) => InvocationResponse {
                invocation_id,
                result: StatusResult::success(),
                output_data: resolved.outputs,
                return_value: resolved.return_value,
            },
            Err(e) => {
                logger.system(LogLevel::Error, format!("output conversion failed: {e}"));
                failure_response(&invocation_id, &e.to_string(), String::new())
            }
        }
    }
}

/// Build the invocation context and decoded inputs from the wire request.
///
/// The first HTTP-shaped input additionally populates the context's
/// request/response shortcuts; its engine-value projection is what enters
/// the inputs list.
fn build_context(
    request: &InvocationRequest,
    function_name: &str,
    guard: CompletionGuard,
    logger: WireLogger,
    cancellation: tokio_util::sync::CancellationToken,
) -> (InvocationContext, Vec<Value>) {
    let mut inputs = Vec::with_capacity(request.input_data.len());
    let mut bindings = IndexMap::new();
    let mut http_request = None;

    for named in &request.input_data {
        let value = match &named.data {
            TypedValue::Http(data) => {
                let parsed = convert::http_from_wire(data);
                let value = parsed.to_value();
                if http_request.is_none() {
                    http_request = Some(parsed);
                }
                value
            }
            other => convert::to_value(other, JsonCoercion::Enabled),
        };
        bindings.insert(named.name.clone(), value.clone());
        inputs.push(value);
    }

    let mut binding_data = convert::normalize_trigger_metadata(&request.trigger_metadata);
    if let Value::Object(entries) = &mut binding_data {
        entries.insert("invocationId".to_string(), Value::String(request.invocation_id.clone()));
    }

    let context = InvocationContext::new(
        request.invocation_id.clone(),
        function_name.to_string(),
        bindings,
        binding_data,
        http_request,
        guard,
        logger,
        cancellation,
    );
    (context, inputs)
}

/// Invoke the callable and await the first completion signal.
///
/// The callable runs on its own task whose resolution feeds the guard's
/// future-style producer; a callback-style `done()` from inside the
/// callable reaches the same slot directly. Whichever fires first is
/// authoritative. A panic in the callable is captured as its error rather
/// than taking the worker down.
async fn execute_function(
    function: crate::registry::AppFunction,
    context: InvocationContext,
    inputs: Vec<Value>,
    guard: CompletionGuard,
    completion_rx: tokio::sync::oneshot::Receiver<Completion>,
) -> Completion {
    tokio::spawn(async move {
        let outcome = match std::panic::AssertUnwindSafe(function(context, inputs)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(anyhow::anyhow!("function panicked: {}", panic_message(panic.as_ref()))),
        };
        guard.signal_future(outcome);
    });

    match completion_rx.await {
        Ok(completion) => completion,
        // The guard's sender is held until a signal is delivered, so this
        // arm is reachable only if the execution task itself was torn down.
        Err(_) => Completion {
            mode: CompletionMode::Future,
            result: None,
            error: Some(anyhow::anyhow!("invocation ended without a completion signal")),
        },
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Render an error chain as the wire stack trace, with a worker frame.
fn error_stack(error: &anyhow::Error, function_name: &str) -> String {
    let mut stack = format!("{error:#}");
    stack.push_str(&format!("\n    at {function_name} (gantry-worker)"));
    stack
}

fn failure_response(invocation_id: &str, message: &str, stack_trace: String) -> InvocationResponse {
    InvocationResponse {
        invocation_id: invocation_id.to_string(),
        result: StatusResult::failure(message, stack_trace),
        output_data: Vec::new(),
        return_value: None,
    }
}
