//! Ordered extension hooks around the invocation and app lifecycle.
//!
//! Hooks register against one of four points — `preInvocation`,
//! `postInvocation`, `appStart`, `appTerminate` — and execute strictly in
//! registration order, each awaited before the next, so a later hook
//! observes every mutation an earlier one made. A hook error aborts the
//! remainder of its phase and propagates to the orchestrator.
//!
//! ## Data channels
//!
//! `hook_data` is scoped to one invocation (shared between its pre and post
//! phase, discarded after); `app_hook_data` is process-wide and survives
//! until the explicit reload reset. Both are [`SharedMap`]s: the context
//! exposes them through getters only, so replacing the map wholesale is
//! rejected by the type system while in-place mutation stays possible.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use futures::future::BoxFuture;
use indexmap::IndexMap;

use crate::context::InvocationContext;
use crate::logging::WireLogger;
use crate::registry::AppFunction;
use crate::value::Value;
use crate::wire::LogLevel;

/// Hook registration or execution failure.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("unknown hook point '{0}'; expected preInvocation, postInvocation, appStart, or appTerminate")]
    UnknownHookPoint(String),
    #[error("'{point}' hook failed: {source}")]
    Callback {
        point: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// The four hook points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    PreInvocation,
    PostInvocation,
    AppStart,
    AppTerminate,
}

impl HookPoint {
    pub fn as_str(self) -> &'static str {
        match self {
            HookPoint::PreInvocation => "preInvocation",
            HookPoint::PostInvocation => "postInvocation",
            HookPoint::AppStart => "appStart",
            HookPoint::AppTerminate => "appTerminate",
        }
    }
}

impl FromStr for HookPoint {
    type Err = HookError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "preInvocation" => Ok(HookPoint::PreInvocation),
            "postInvocation" => Ok(HookPoint::PostInvocation),
            "appStart" => Ok(HookPoint::AppStart),
            "appTerminate" => Ok(HookPoint::AppTerminate),
            other => Err(HookError::UnknownHookPoint(other.to_string())),
        }
    }
}

/// A mutable map shared by reference.
///
/// Consumers add and remove entries in place; no API hands out the inner
/// map by value, so rebinding the whole map is impossible.
#[derive(Clone, Default)]
pub struct SharedMap {
    entries: Arc<Mutex<IndexMap<String, Value>>>,
}

impl SharedMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.lock().insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.lock().shift_remove(key)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> IndexMap<String, Value> {
        self.lock().clone()
    }

    /// Whether two handles reference the same underlying map.
    pub fn same_map(&self, other: &SharedMap) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<String, Value>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Context for `preInvocation` hooks.
///
/// `inputs` and `function` are deliberately public: hooks may edit argument
/// values and wrap or replace the callable, and whatever they leave behind
/// is what actually gets invoked.
pub struct PreInvocationContext {
    hook_data: SharedMap,
    app_hook_data: SharedMap,
    invocation: InvocationContext,
    pub inputs: Vec<Value>,
    pub function: AppFunction,
}

impl PreInvocationContext {
    pub fn hook_data(&self) -> &SharedMap {
        &self.hook_data
    }

    pub fn app_hook_data(&self) -> &SharedMap {
        &self.app_hook_data
    }

    pub fn invocation(&self) -> &InvocationContext {
        &self.invocation
    }
}

/// Context for `postInvocation` hooks.
///
/// Hooks may replace `result` or clear/replace `error`; the response is
/// built from whatever they leave behind, not from what the callable
/// originally produced.
pub struct PostInvocationContext {
    hook_data: SharedMap,
    app_hook_data: SharedMap,
    invocation: InvocationContext,
    pub inputs: Vec<Value>,
    pub result: Option<Value>,
    pub error: Option<anyhow::Error>,
}

impl PostInvocationContext {
    pub fn hook_data(&self) -> &SharedMap {
        &self.hook_data
    }

    pub fn app_hook_data(&self) -> &SharedMap {
        &self.app_hook_data
    }

    pub fn invocation(&self) -> &InvocationContext {
        &self.invocation
    }
}

/// Context for `appStart` hooks. Its `hook_data` is backed by the
/// process-wide app hook data map.
pub struct AppStartContext {
    hook_data: SharedMap,
    app_hook_data: SharedMap,
    pub function_app_directory: String,
    pub host_version: String,
}

impl AppStartContext {
    pub fn hook_data(&self) -> &SharedMap {
        &self.hook_data
    }

    pub fn app_hook_data(&self) -> &SharedMap {
        &self.app_hook_data
    }
}

/// Context for `appTerminate` hooks. Its `hook_data` is backed by the
/// app-level-only map, distinct from `app_hook_data`.
pub struct AppTerminateContext {
    hook_data: SharedMap,
    app_hook_data: SharedMap,
}

impl AppTerminateContext {
    pub fn hook_data(&self) -> &SharedMap {
        &self.hook_data
    }

    pub fn app_hook_data(&self) -> &SharedMap {
        &self.app_hook_data
    }
}

/// Phase-specific context passed to hook callbacks.
pub enum HookContext {
    Pre(PreInvocationContext),
    Post(PostInvocationContext),
    AppStart(AppStartContext),
    AppTerminate(AppTerminateContext),
}

impl HookContext {
    pub(crate) fn pre(
        hook_data: SharedMap,
        app_hook_data: SharedMap,
        invocation: InvocationContext,
        inputs: Vec<Value>,
        function: AppFunction,
    ) -> Self {
        HookContext::Pre(PreInvocationContext {
            hook_data,
            app_hook_data,
            invocation,
            inputs,
            function,
        })
    }

    pub(crate) fn post(
        hook_data: SharedMap,
        app_hook_data: SharedMap,
        invocation: InvocationContext,
        inputs: Vec<Value>,
        result: Option<Value>,
        error: Option<anyhow::Error>,
    ) -> Self {
        HookContext::Post(PostInvocationContext {
            hook_data,
            app_hook_data,
            invocation,
            inputs,
            result,
            error,
        })
    }

    pub(crate) fn app_start(app_hook_data: SharedMap, function_app_directory: String, host_version: String) -> Self {
        HookContext::AppStart(AppStartContext {
            hook_data: app_hook_data.clone(),
            app_hook_data,
            function_app_directory,
            host_version,
        })
    }

    pub(crate) fn app_terminate(app_level_hook_data: SharedMap, app_hook_data: SharedMap) -> Self {
        HookContext::AppTerminate(AppTerminateContext {
            hook_data: app_level_hook_data,
            app_hook_data,
        })
    }

    pub fn as_pre_mut(&mut self) -> Option<&mut PreInvocationContext> {
        match self {
            HookContext::Pre(ctx) => Some(ctx),
            _ => None,
        }
    }

    pub fn as_post_mut(&mut self) -> Option<&mut PostInvocationContext> {
        match self {
            HookContext::Post(ctx) => Some(ctx),
            _ => None,
        }
    }

    pub fn as_app_start(&self) -> Option<&AppStartContext> {
        match self {
            HookContext::AppStart(ctx) => Some(ctx),
            _ => None,
        }
    }

    pub fn as_app_terminate(&self) -> Option<&AppTerminateContext> {
        match self {
            HookContext::AppTerminate(ctx) => Some(ctx),
            _ => None,
        }
    }
}

/// A registered hook callback.
pub type HookCallback = Arc<dyn for<'a> Fn(&'a mut HookContext) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync>;

/// Handle returned by every hook or function registration.
///
/// Calling [`RegistrationHandle::revoke`] reverses the registration;
/// calling it twice is a no-op. The handle has no `Drop` side effects and
/// is never assumed to run at process exit.
pub struct RegistrationHandle {
    reversal: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl RegistrationHandle {
    pub(crate) fn new(reversal: impl FnOnce() + Send + 'static) -> Self {
        Self {
            reversal: Mutex::new(Some(Box::new(reversal))),
        }
    }

    pub fn revoke(&self) {
        let reversal = self.reversal.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        if let Some(reversal) = reversal {
            reversal();
        }
    }
}

/// Ordered lists of callbacks keyed by hook point.
#[derive(Default)]
pub struct HookRegistry {
    lists: Mutex<HashMap<HookPoint, Vec<(u64, HookCallback)>>>,
    next_id: AtomicU64,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback to the list for `point`.
    pub fn register(self: &Arc<Self>, point: HookPoint, callback: HookCallback) -> RegistrationHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().entry(point).or_default().push((id, callback));

        let registry = Arc::downgrade(self);
        RegistrationHandle::new(move || {
            if let Some(registry) = registry.upgrade()
                && let Some(list) = registry.lock().get_mut(&point)
            {
                list.retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    pub fn count(&self, point: HookPoint) -> usize {
        self.lock().get(&point).map(Vec::len).unwrap_or(0)
    }

    /// Execute the hooks for `point` strictly in registration order.
    ///
    /// An empty list does nothing, without log noise. Otherwise the run is
    /// bracketed by System-level diagnostics, and a callback error aborts
    /// the remaining hooks in the phase.
    pub async fn execute(&self, point: HookPoint, context: &mut HookContext, logger: &WireLogger) -> Result<(), HookError> {
        let callbacks: Vec<HookCallback> = self
            .lock()
            .get(&point)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();
        if callbacks.is_empty() {
            return Ok(());
        }

        logger.system(
            LogLevel::Debug,
            format!("executing {} '{}' hooks", callbacks.len(), point.as_str()),
        );
        for callback in &callbacks {
            callback(context).await.map_err(|source| HookError::Callback {
                point: point.as_str(),
                source,
            })?;
        }
        logger.system(
            LogLevel::Debug,
            format!("executed {} '{}' hooks", callbacks.len(), point.as_str()),
        );
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<HookPoint, Vec<(u64, HookCallback)>>> {
        self.lists.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
