//! Worker-wide configuration and state.
//!
//! [`WorkerState`] is the single-owner context object holding everything
//! shared across invocations: the function registry, the hook registry, the
//! process-wide hook data maps, and the in-flight cancellation tokens. It
//! is created at process start, injected into the dispatcher and
//! orchestrator at construction, reset (hook data only) on the host's
//! reload message, and torn down at graceful shutdown. Nothing here is
//! ambient global state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::hooks::HookCallback;
use crate::hooks::HookPoint;
use crate::hooks::HookRegistry;
use crate::hooks::RegistrationHandle;
use crate::hooks::SharedMap;
use crate::registry::AppFunction;
use crate::registry::FunctionRegistry;

/// Static worker configuration, builder-style.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identifier the host assigned to this worker process.
    pub worker_id: String,
    /// Root directory of the function app.
    pub function_app_directory: String,
    /// Capabilities advertised in the init response.
    pub capabilities: IndexMap<String, String>,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            function_app_directory: String::new(),
            capabilities: IndexMap::new(),
        }
    }

    pub fn with_function_app_directory(mut self, directory: impl Into<String>) -> Self {
        self.function_app_directory = directory.into();
        self
    }

    pub fn with_capability(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.capabilities.insert(name.into(), value.into());
        self
    }

    /// Build a config from `GANTRY_WORKER_ID` and `GANTRY_FUNCTION_APP_DIR`.
    pub fn from_env() -> Self {
        let worker_id = std::env::var("GANTRY_WORKER_ID").unwrap_or_else(|_| "gantry-worker".to_string());
        let directory = std::env::var("GANTRY_FUNCTION_APP_DIR").unwrap_or_default();
        Self::new(worker_id).with_function_app_directory(directory)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new("gantry-worker")
    }
}

/// Process-wide worker state shared across concurrent invocations.
///
/// The only cross-invocation mutable state is the hook data maps and the
/// registries, all mutated inside already-serialized hook or registration
/// callbacks.
pub struct WorkerState {
    config: WorkerConfig,
    functions: Arc<FunctionRegistry>,
    hooks: Arc<HookRegistry>,
    app_hook_data: SharedMap,
    app_level_hook_data: SharedMap,
    host_version: Mutex<Option<String>>,
    in_flight: Mutex<HashMap<String, CancellationToken>>,
    pending_cancels: Mutex<IndexMap<String, CancellationToken>>,
}

/// Cap on parked cancel tokens for ids never seen running. Keeps a host
/// that cancels stale or unknown ids from growing the map without bound.
const MAX_PENDING_CANCELS: usize = 64;

impl WorkerState {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            functions: Arc::new(FunctionRegistry::new()),
            hooks: Arc::new(HookRegistry::new()),
            app_hook_data: SharedMap::new(),
            app_level_hook_data: SharedMap::new(),
            host_version: Mutex::new(None),
            in_flight: Mutex::new(HashMap::new()),
            pending_cancels: Mutex::new(IndexMap::new()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// Process-wide hook data, shared with every hook context.
    pub fn app_hook_data(&self) -> &SharedMap {
        &self.app_hook_data
    }

    /// App-level-only hook data, backing `appTerminate` contexts.
    pub fn app_level_hook_data(&self) -> &SharedMap {
        &self.app_level_hook_data
    }

    /// Register a hook callback; the handle reverses the registration.
    pub fn register_hook(&self, point: HookPoint, callback: HookCallback) -> RegistrationHandle {
        self.hooks.register(point, callback)
    }

    /// Register an in-process callable under a function name.
    pub fn register_function(&self, name: impl Into<String>, function: AppFunction) -> RegistrationHandle {
        self.functions.register_callable(name, function)
    }

    /// The reload reset point: both hook data maps are cleared in place, so
    /// handles held by hook contexts keep referencing the same maps.
    pub fn reset_app_hook_data(&self) {
        self.app_hook_data.clear();
        self.app_level_hook_data.clear();
        debug!("app hook data reset");
    }

    pub fn set_host_version(&self, version: impl Into<String>) {
        *self.lock_host_version() = Some(version.into());
    }

    pub fn host_version(&self) -> Option<String> {
        self.lock_host_version().clone()
    }

    /// Track an invocation, yielding its cancellation token. A cancel that
    /// raced ahead of the request left a pre-tripped token in the pending
    /// set; that token is claimed here so the invocation observes the
    /// cancel immediately.
    pub fn track_invocation(&self, invocation_id: &str) -> CancellationToken {
        let token = self
            .lock_pending_cancels()
            .shift_remove(invocation_id)
            .unwrap_or_default();
        self.lock_in_flight().insert(invocation_id.to_string(), token.clone());
        token
    }

    pub fn finish_invocation(&self, invocation_id: &str) {
        self.lock_in_flight().remove(invocation_id);
    }

    /// Best-effort cancellation; never preempts running logic. A cancel for
    /// an id that is not in flight is parked as a pre-tripped token in a
    /// bounded pending set, so only a cancel that genuinely precedes its
    /// request has any effect; the set evicts oldest-first and a cancel
    /// arriving after its invocation finished ages out rather than
    /// accumulating. Returns whether the invocation was in flight.
    pub fn cancel_invocation(&self, invocation_id: &str) -> bool {
        if let Some(token) = self.lock_in_flight().get(invocation_id) {
            token.cancel();
            return true;
        }
        let mut pending = self.lock_pending_cancels();
        if !pending.contains_key(invocation_id) {
            while pending.len() >= MAX_PENDING_CANCELS {
                pending.shift_remove_index(0);
            }
            let token = CancellationToken::new();
            token.cancel();
            pending.insert(invocation_id.to_string(), token);
        }
        false
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock_in_flight().len()
    }

    pub fn pending_cancel_count(&self) -> usize {
        self.lock_pending_cancels().len()
    }

    fn lock_host_version(&self) -> MutexGuard<'_, Option<String>> {
        self.host_version.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_pending_cancels(&self) -> MutexGuard<'_, IndexMap<String, CancellationToken>> {
        self.pending_cancels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
