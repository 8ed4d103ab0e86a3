//! Duplex stream dispatcher.
//!
//! The dispatcher is the only reader of the inbound stream and never waits
//! on an invocation: invocation requests are handed to the orchestrator on
//! spawned tasks, so multiple invocations are logically in flight at once
//! and responses may be written in any order — correctness rests on
//! correlation identifiers, never on arrival order.
//!
//! Every outbound envelope funnels through one writer task that validates
//! it against the wire schema before transmission. A schema violation is an
//! internal logic defect and terminates the run loop; an unknown inbound
//! message kind is expected (forward compatibility) and only logged.

use std::sync::Arc;

use tokio::io::AsyncBufRead;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use crate::app::WorkerState;
use crate::codec;
use crate::codec::CodecError;
use crate::codec::RawEnvelope;
use crate::hooks::HookContext;
use crate::hooks::HookPoint;
use crate::invocation::InvocationOrchestrator;
use crate::logging::WireLogger;
use crate::registry::FunctionResolver;
use crate::registry::RegistryResolver;
use crate::wire;
use crate::wire::Envelope;
use crate::wire::FunctionLoadResponse;
use crate::wire::LogLevel;
use crate::wire::Payload;
use crate::wire::ReloadResponse;
use crate::wire::SchemaError;
use crate::wire::StatusResult;
use crate::wire::WorkerInitResponse;
use crate::wire::WorkerStatusResponse;

/// Fatal dispatcher failure. Anything that surfaces here ends the run
/// loop; per-invocation failures never do.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("outbound envelope failed schema validation: {0}")]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("dispatcher already running")]
    AlreadyRunning,
}

/// Message queued for the outbound writer task.
#[derive(Debug)]
pub enum OutboundMessage {
    Envelope(Envelope),
    /// Drain point: the writer returns cleanly once it sees this.
    Shutdown,
}

enum RouteOutcome {
    Continue,
    Terminate,
}

/// Routes inbound envelopes and owns the outbound writer.
pub struct StreamDispatcher {
    state: Arc<WorkerState>,
    orchestrator: Arc<InvocationOrchestrator>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<OutboundMessage>>>,
    logger: WireLogger,
}

impl StreamDispatcher {
    /// Dispatcher resolving callables from the in-process registry.
    pub fn new(state: Arc<WorkerState>) -> Self {
        let resolver = Arc::new(RegistryResolver::new(Arc::clone(state.functions())));
        Self::with_resolver(state, resolver)
    }

    pub fn with_resolver(state: Arc<WorkerState>, resolver: Arc<dyn FunctionResolver>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(InvocationOrchestrator::new(
            Arc::clone(&state),
            resolver,
            outbound_tx.clone(),
        ));
        let logger = WireLogger::new(outbound_tx.clone(), "gantry.dispatcher");
        Self {
            state,
            orchestrator,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            logger,
        }
    }

    /// Sender for components that emit envelopes outside the dispatcher.
    pub fn outbound_sender(&self) -> mpsc::UnboundedSender<OutboundMessage> {
        self.outbound_tx.clone()
    }

    /// Run the read loop until end of stream, a terminate message, or a
    /// fatal error. Consumes the outbound receiver; can run once.
    pub async fn run<R, W>(&self, mut reader: R, writer: W) -> Result<(), DispatchError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let outbound_rx = self.outbound_rx.lock().await.take().ok_or(DispatchError::AlreadyRunning)?;
        let write_fut = write_loop(outbound_rx, writer);
        tokio::pin!(write_fut);

        let result = loop {
            tokio::select! {
                // Before shutdown the writer only finishes on a fatal
                // outbound error.
                writer_result = &mut write_fut => return writer_result,
                inbound = codec::read_envelope(&mut reader) => match inbound {
                    Ok(Some(raw)) => match self.route(raw).await {
                        RouteOutcome::Continue => continue,
                        RouteOutcome::Terminate => break Ok(()),
                    },
                    Ok(None) => {
                        debug!("inbound stream closed");
                        break Ok(());
                    }
                    Err(e) => break Err(DispatchError::Codec(e)),
                }
            }
        };

        // Drain queued envelopes (responses, logs) before returning.
        let _ = self.outbound_tx.send(OutboundMessage::Shutdown);
        result.and(write_fut.await)
    }

    async fn route(&self, raw: RawEnvelope) -> RouteOutcome {
        let payload = match raw.decode() {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                self.logger.system(
                    LogLevel::Information,
                    format!("no handler registered for message kind '{}'", raw.kind),
                );
                return RouteOutcome::Continue;
            }
            Err(e) => {
                self.logger.system(
                    LogLevel::Error,
                    format!("dropping malformed '{}' payload: {e}", raw.kind),
                );
                return RouteOutcome::Continue;
            }
        };

        let correlation_id = raw.correlation_id;
        match payload {
            Payload::InvocationRequest(request) => {
                // Handed off asynchronously: the next inbound message is
                // accepted without waiting for this invocation.
                let orchestrator = Arc::clone(&self.orchestrator);
                tokio::spawn(async move {
                    orchestrator.invoke(request, correlation_id).await;
                });
            }
            Payload::InvocationCancel(cancel) => {
                let tripped = self.state.cancel_invocation(&cancel.invocation_id);
                debug!(invocation_id = %cancel.invocation_id, tripped, "cancellation requested");
            }
            Payload::WorkerInitRequest(init) => {
                self.state.set_host_version(&init.host_version);
                let result = self.run_app_start(init.host_version).await;
                self.send(Envelope::new(
                    correlation_id,
                    Payload::WorkerInitResponse(WorkerInitResponse {
                        worker_version: env!("CARGO_PKG_VERSION").to_string(),
                        capabilities: self.state.config().capabilities.clone(),
                        result,
                    }),
                ));
            }
            Payload::FunctionLoadRequest(load) => {
                let result = match self.state.functions().load(load.metadata) {
                    Ok(()) => StatusResult::success(),
                    Err(e) => {
                        warn!(function_id = %load.function_id, error = %e, "function load rejected");
                        StatusResult::failure(e.to_string(), String::new())
                    }
                };
                self.send(Envelope::new(
                    correlation_id,
                    Payload::FunctionLoadResponse(FunctionLoadResponse {
                        function_id: load.function_id,
                        result,
                    }),
                ));
            }
            Payload::ReloadRequest(_) => {
                self.state.reset_app_hook_data();
                self.send(Envelope::new(
                    correlation_id,
                    Payload::ReloadResponse(ReloadResponse {
                        result: StatusResult::success(),
                    }),
                ));
            }
            Payload::WorkerStatusRequest(_) => {
                self.send(Envelope::new(
                    correlation_id,
                    Payload::WorkerStatusResponse(WorkerStatusResponse::default()),
                ));
            }
            Payload::WorkerTerminate(terminate) => {
                debug!(grace_period_secs = terminate.grace_period_secs, "terminate requested");
                self.run_app_terminate().await;
                return RouteOutcome::Terminate;
            }
            other => {
                // Host-bound kinds arriving inbound; nothing routes them.
                self.logger.system(
                    LogLevel::Information,
                    format!("no handler registered for message kind '{}'", other.kind()),
                );
            }
        }
        RouteOutcome::Continue
    }

    async fn run_app_start(&self, host_version: String) -> StatusResult {
        let mut context = HookContext::app_start(
            self.state.app_hook_data().clone(),
            self.state.config().function_app_directory.clone(),
            host_version,
        );
        match self.state.hooks().execute(HookPoint::AppStart, &mut context, &self.logger).await {
            Ok(()) => StatusResult::success(),
            Err(e) => StatusResult::failure(e.to_string(), String::new()),
        }
    }

    async fn run_app_terminate(&self) {
        let mut context = HookContext::app_terminate(
            self.state.app_level_hook_data().clone(),
            self.state.app_hook_data().clone(),
        );
        if let Err(e) = self.state.hooks().execute(HookPoint::AppTerminate, &mut context, &self.logger).await {
            warn!(error = %e, "appTerminate hook failed during shutdown");
        }
    }

    fn send(&self, envelope: Envelope) {
        let _ = self.outbound_tx.send(OutboundMessage::Envelope(envelope));
    }
}

/// Writer task: validates and writes every outbound envelope in queue
/// order. A schema violation or write failure is fatal and surfaces as the
/// run loop's error.
async fn write_loop<W: AsyncWrite + Unpin>(
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundMessage>,
    mut writer: W,
) -> Result<(), DispatchError> {
    while let Some(message) = outbound_rx.recv().await {
        match message {
            OutboundMessage::Envelope(envelope) => {
                wire::validate_envelope(&envelope)?;
                codec::write_envelope(&mut writer, &envelope).await?;
            }
            OutboundMessage::Shutdown => break,
        }
    }
    Ok(())
}
