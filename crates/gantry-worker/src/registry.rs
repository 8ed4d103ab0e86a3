//! Function registry and the callable-resolution seam.
//!
//! The host loads [`FunctionMetadata`](crate::wire::FunctionMetadata)
//! records over the wire; user code registers async callables under
//! function names before the stream starts. [`FunctionResolver`] is the
//! collaborator interface hiding how a metadata record becomes a callable —
//! the orchestrator only ever sees the callable or a typed resolution
//! error. The default resolver looks up the in-process registration.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use futures::future::BoxFuture;
use indexmap::IndexMap;
use tracing::debug;

use crate::context::InvocationContext;
use crate::hooks::RegistrationHandle;
use crate::value::Value;
use crate::wire::FunctionMetadata;

/// The resolved unit of user logic: an async callable taking the invocation
/// context plus the decoded inputs, returning an optional result value.
pub type AppFunction =
    Arc<dyn Fn(InvocationContext, Vec<Value>) -> BoxFuture<'static, anyhow::Result<Option<Value>>> + Send + Sync>;

/// Callable resolution failure. Reported as a failed response for the one
/// invocation; never fatal to the worker.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no callable registered for function '{name}'; register it before the worker starts")]
    NotRegistered { name: String },
    #[error("failed to resolve function '{name}': {reason}")]
    Failed { name: String, reason: String },
}

/// Function metadata rejected at load time.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("function '{name}' declares multiple HTTP output bindings ('{first}' and '{second}'); at most one is allowed")]
    MultipleHttpOutputs {
        name: String,
        first: String,
        second: String,
    },
    #[error("function metadata is missing a non-empty id")]
    MissingFunctionId,
}

/// Resolves a metadata record into a callable.
///
/// Function-resolution-by-export-shape lives entirely behind this trait;
/// the engine never needs to know how resolution works.
#[async_trait::async_trait]
pub trait FunctionResolver: Send + Sync {
    async fn resolve(&self, metadata: &FunctionMetadata) -> Result<AppFunction, ResolveError>;
}

/// Registry of loaded function metadata and in-process callables.
///
/// Metadata is keyed by the host-assigned function id; callables are keyed
/// by function name since user code registers them before any id exists.
#[derive(Default)]
pub struct FunctionRegistry {
    loaded: Mutex<IndexMap<String, FunctionMetadata>>,
    callables: Mutex<HashMap<String, AppFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load (or replace) a function's metadata.
    ///
    /// Validates the at-most-one-HTTP-output invariant; a violation is a
    /// per-function load failure, never fatal.
    pub fn load(&self, metadata: FunctionMetadata) -> Result<(), RegistryError> {
        if metadata.id.is_empty() {
            return Err(RegistryError::MissingFunctionId);
        }
        let mut http_outputs = metadata
            .bindings
            .iter()
            .filter(|(_, info)| info.binding_type == "http" && info.direction.is_out_capable())
            .map(|(name, _)| name.as_str());
        if let (Some(first), Some(second)) = (http_outputs.next(), http_outputs.next()) {
            return Err(RegistryError::MultipleHttpOutputs {
                name: metadata.name.clone(),
                first: first.to_string(),
                second: second.to_string(),
            });
        }

        debug!(function_id = %metadata.id, function = %metadata.name, "function metadata loaded");
        self.lock_loaded().insert(metadata.id.clone(), metadata);
        Ok(())
    }

    pub fn get(&self, function_id: &str) -> Option<FunctionMetadata> {
        self.lock_loaded().get(function_id).cloned()
    }

    pub fn loaded_count(&self) -> usize {
        self.lock_loaded().len()
    }

    /// Register an in-process callable under a function name.
    ///
    /// Revoking the returned handle removes the registration; revoking
    /// twice is a no-op.
    pub fn register_callable(self: &Arc<Self>, name: impl Into<String>, function: AppFunction) -> RegistrationHandle {
        let name = name.into();
        self.lock_callables().insert(name.clone(), function);

        let registry = Arc::downgrade(self);
        RegistrationHandle::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.lock_callables().remove(&name);
            }
        })
    }

    pub fn callable(&self, name: &str) -> Option<AppFunction> {
        self.lock_callables().get(name).cloned()
    }

    fn lock_loaded(&self) -> MutexGuard<'_, IndexMap<String, FunctionMetadata>> {
        self.loaded.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_callables(&self) -> MutexGuard<'_, HashMap<String, AppFunction>> {
        self.callables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Resolver backed by the in-process registry: the callable registered
/// under the metadata's function name.
pub struct RegistryResolver {
    registry: Arc<FunctionRegistry>,
}

impl RegistryResolver {
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl FunctionResolver for RegistryResolver {
    async fn resolve(&self, metadata: &FunctionMetadata) -> Result<AppFunction, ResolveError> {
        self.registry.callable(&metadata.name).ok_or_else(|| ResolveError::NotRegistered {
            name: metadata.name.clone(),
        })
    }
}
