//! Exactly-once invocation completion arbitration.
//!
//! A callable can finish an invocation two ways: by calling the context's
//! `done` callback, or by its returned future resolving. Both may happen for
//! the same invocation, in either order. [`CompletionGuard`] is the pair of
//! producers writing one `tokio::sync::oneshot` slot: the first signal wins
//! and is what the orchestrator awaits; the loser is observed only for
//! diagnostics.
//!
//! ## Diagnostic boundaries
//!
//! - callback after a callback win: "completion already signaled"
//! - callback after a future win, or a future resolving with a value or
//!   error after a callback win: "both completion styles used"
//! - a future resolving *empty* after a callback win is the intended
//!   callback idiom and draws no warning
//! - user logs after completion warn, except while the post-invocation hook
//!   phase is active

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::sync::oneshot;

use crate::logging::WireLogger;
use crate::value::Value;
use crate::wire::LogLevel;

/// Which completion idiom delivered the winning signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    Callback,
    Future,
}

/// The winning completion signal for one invocation.
#[derive(Debug)]
pub struct Completion {
    pub mode: CompletionMode,
    pub result: Option<Value>,
    pub error: Option<anyhow::Error>,
}

struct GuardState {
    sender: Option<oneshot::Sender<Completion>>,
    completed_by: Option<CompletionMode>,
}

/// Per-invocation completion state. Cheap to clone; all clones share one
/// underlying slot.
#[derive(Clone)]
pub struct CompletionGuard {
    state: Arc<Mutex<GuardState>>,
    post_hooks_active: Arc<AtomicBool>,
    logger: WireLogger,
}

impl CompletionGuard {
    /// Create a guard and the receiver the orchestrator awaits.
    pub fn channel(logger: WireLogger) -> (Self, oneshot::Receiver<Completion>) {
        let (sender, receiver) = oneshot::channel();
        let guard = Self {
            state: Arc::new(Mutex::new(GuardState {
                sender: Some(sender),
                completed_by: None,
            })),
            post_hooks_active: Arc::new(AtomicBool::new(false)),
            logger,
        };
        (guard, receiver)
    }

    /// Callback-style completion (`ctx.done(error, result)`).
    pub fn signal_callback(&self, error: Option<anyhow::Error>, result: Option<Value>) {
        let mut state = self.lock();
        match state.completed_by {
            None => {
                state.completed_by = Some(CompletionMode::Callback);
                self.deliver(&mut state, Completion {
                    mode: CompletionMode::Callback,
                    result,
                    error,
                });
            }
            Some(CompletionMode::Callback) => {
                self.logger.system(
                    LogLevel::Warning,
                    "invocation completion already signaled; ignoring extra done() call",
                );
            }
            Some(CompletionMode::Future) => {
                self.logger.system(
                    LogLevel::Warning,
                    "both completion styles used: the returned future already completed this invocation, done() is ignored",
                );
            }
        }
    }

    /// Future-style completion, fed with the callable's resolved outcome.
    ///
    /// An `Ok(None)` arriving after a callback win is the classic callback
    /// idiom (the function body returned nothing) and stays silent.
    pub fn signal_future(&self, outcome: Result<Option<Value>, anyhow::Error>) {
        let mut state = self.lock();
        match state.completed_by {
            None => {
                state.completed_by = Some(CompletionMode::Future);
                let (result, error) = match outcome {
                    Ok(result) => (result, None),
                    Err(e) => (None, Some(e)),
                };
                self.deliver(&mut state, Completion {
                    mode: CompletionMode::Future,
                    result,
                    error,
                });
            }
            Some(_) => {
                if !matches!(outcome, Ok(None)) {
                    self.logger.system(
                        LogLevel::Warning,
                        "both completion styles used: done() already completed this invocation, the returned future's value is ignored",
                    );
                }
            }
        }
    }

    /// Whether the invocation has completed.
    pub fn is_completed(&self) -> bool {
        self.lock().completed_by.is_some()
    }

    /// Mark the post-invocation hook phase active or inactive. User logs
    /// during that phase are expected and must not warn.
    pub fn set_post_hooks_active(&self, active: bool) {
        self.post_hooks_active.store(active, Ordering::SeqCst);
    }

    /// Record that user logic emitted a log. Warns when the log arrives
    /// after completion outside the post-invocation hook phase.
    pub fn note_user_log(&self) {
        if self.is_completed() && !self.post_hooks_active.load(Ordering::SeqCst) {
            self.logger.system(
                LogLevel::Warning,
                "log emitted after invocation completion; check for async work that is not awaited",
            );
        }
    }

    fn deliver(&self, state: &mut GuardState, completion: Completion) {
        if let Some(sender) = state.sender.take() {
            // The orchestrator holds the receiver for the invocation's
            // whole lifetime; a send failure means it already gave up.
            let _ = sender.send(completion);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
