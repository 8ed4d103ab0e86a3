//! Per-invocation execution context handed to user functions.
//!
//! An [`InvocationContext`] is constructed fresh for each invocation, owned
//! by that invocation's orchestration task, and discarded on completion. It
//! carries the mutable `bindings` map outputs are written into, the
//! normalized `bindingData` derived from trigger metadata, the HTTP
//! request/response shortcuts for HTTP-triggered functions, and the
//! completion callback. The handle is cheap to clone; all clones share one
//! underlying invocation.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use crate::completion::CompletionGuard;
use crate::logging::WireLogger;
use crate::value::Value;
use crate::wire::Cookie;
use crate::wire::LogLevel;

/// A normalized HTTP request, flattened from the wire's `httpData`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: IndexMap<String, String>,
    pub query: IndexMap<String, String>,
    pub params: IndexMap<String, String>,
    /// Body decoded with JSON coercion enabled.
    pub body: Value,
    /// The literal byte/string payload, never JSON-coerced.
    pub raw_body: Value,
}

impl HttpRequest {
    /// Project the request as an engine value, the shape user functions and
    /// hooks observe in the inputs list.
    pub fn to_value(&self) -> Value {
        let map_value =
            |m: &IndexMap<String, String>| Value::Object(m.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect());
        Value::object([
            ("method", Value::String(self.method.clone())),
            ("url", Value::String(self.url.clone())),
            ("headers", map_value(&self.headers)),
            ("query", map_value(&self.query)),
            ("params", map_value(&self.params)),
            ("body", self.body.clone()),
            ("rawBody", self.raw_body.clone()),
        ])
    }
}

/// Mutable state accumulated by the response builder.
#[derive(Debug, Clone, Default)]
pub struct HttpResponseState {
    pub status_code: Option<String>,
    pub headers: IndexMap<String, String>,
    pub cookies: Vec<Cookie>,
    pub body: Value,
}

/// Builder-style HTTP response shortcut (`ctx.http_response()`).
///
/// State is shared with the invocation context: when no explicit value is
/// produced for a declared HTTP output binding, the response defaults to
/// whatever was accumulated here. `send` completes the invocation through
/// the completion guard, so a second `send` draws the guard's duplicate
/// completion warning rather than a second response.
#[derive(Clone)]
pub struct HttpResponseBuilder {
    state: Arc<Mutex<HttpResponseState>>,
    guard: CompletionGuard,
}

impl HttpResponseBuilder {
    pub(crate) fn new(guard: CompletionGuard) -> Self {
        Self {
            state: Arc::new(Mutex::new(HttpResponseState::default())),
            guard,
        }
    }

    pub fn status(&self, status: impl ToString) -> &Self {
        self.lock().status_code = Some(status.to_string());
        self
    }

    pub fn header(&self, name: impl Into<String>, value: impl Into<String>) -> &Self {
        self.lock().headers.insert(name.into(), value.into());
        self
    }

    pub fn cookie(&self, cookie: Cookie) -> &Self {
        self.lock().cookies.push(cookie);
        self
    }

    pub fn body(&self, body: Value) -> &Self {
        self.lock().body = body;
        self
    }

    /// Set a JSON body and the matching content type.
    pub fn json(&self, body: Value) -> &Self {
        {
            let mut state = self.lock();
            state.headers.insert("content-type".to_string(), "application/json".to_string());
            state.body = body;
        }
        self
    }

    /// Finish the response and complete the invocation (callback-style).
    pub fn send(&self) {
        self.guard.signal_callback(None, None);
    }

    /// Snapshot of the accumulated response state.
    pub fn state(&self) -> HttpResponseState {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, HttpResponseState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct ContextInner {
    invocation_id: String,
    function_name: String,
    bindings: Mutex<IndexMap<String, Value>>,
    binding_data: Value,
    http_request: Option<HttpRequest>,
    http_response: HttpResponseBuilder,
    guard: CompletionGuard,
    logger: WireLogger,
    cancellation: CancellationToken,
}

/// Handle to one invocation's execution context.
#[derive(Clone)]
pub struct InvocationContext {
    inner: Arc<ContextInner>,
}

impl InvocationContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        invocation_id: String,
        function_name: String,
        bindings: IndexMap<String, Value>,
        binding_data: Value,
        http_request: Option<HttpRequest>,
        guard: CompletionGuard,
        logger: WireLogger,
        cancellation: CancellationToken,
    ) -> Self {
        let http_response = HttpResponseBuilder::new(guard.clone());
        Self {
            inner: Arc::new(ContextInner {
                invocation_id,
                function_name,
                bindings: Mutex::new(bindings),
                binding_data,
                http_request,
                http_response,
                guard,
                logger,
                cancellation,
            }),
        }
    }

    pub fn invocation_id(&self) -> &str {
        &self.inner.invocation_id
    }

    pub fn function_name(&self) -> &str {
        &self.inner.function_name
    }

    /// Normalized trigger metadata. Always contains `invocationId`; every
    /// other key is recursively camel-cased from the wire metadata.
    pub fn binding_data(&self) -> &Value {
        &self.inner.binding_data
    }

    /// Write a named binding value. Declared output bindings resolved from
    /// this map populate the response unless the function's returned object
    /// satisfied the same name first.
    pub fn set_binding(&self, name: impl Into<String>, value: Value) {
        self.lock_bindings().insert(name.into(), value);
    }

    pub fn binding(&self, name: &str) -> Option<Value> {
        self.lock_bindings().get(name).cloned()
    }

    pub fn bindings_snapshot(&self) -> IndexMap<String, Value> {
        self.lock_bindings().clone()
    }

    /// The HTTP request, present when the resolved input binding is
    /// HTTP-shaped.
    pub fn http_request(&self) -> Option<&HttpRequest> {
        self.inner.http_request.as_ref()
    }

    pub fn http_response(&self) -> &HttpResponseBuilder {
        &self.inner.http_response
    }

    /// Classic callback-style completion.
    pub fn done(&self, error: Option<anyhow::Error>, result: Option<Value>) {
        self.inner.guard.signal_callback(error, result);
    }

    /// Emit a user log record. After completion this draws a diagnosable
    /// warning unless the post-invocation hook phase is active.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.inner.guard.note_user_log();
        self.inner.logger.user(level, message);
    }

    /// Best-effort cancellation signal from the host. Never preempts
    /// running logic; callables may poll this at their own await points.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    fn lock_bindings(&self) -> MutexGuard<'_, IndexMap<String, Value>> {
        self.inner.bindings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
