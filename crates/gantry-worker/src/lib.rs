//! Language-worker invocation engine speaking the host's NDJSON protocol.
//!
//! A worker process connects a function host to user-registered handler
//! functions: the host streams envelopes (invocation requests, lifecycle
//! messages, cancellations) over a duplex byte stream, and the worker
//! answers with correlated responses and unsolicited log records.
//!
//! ## Message Flow
//!
//! 1. `StreamDispatcher::run` reads envelopes off the inbound stream
//! 2. Lifecycle messages (init, load, reload, status, terminate) are
//!    answered inline
//! 3. Invocation requests are handed to the `InvocationOrchestrator` on
//!    spawned tasks, so slow invocations never block the read loop
//! 4. The orchestrator converts inputs, runs pre-invocation hooks, executes
//!    the user function, runs post-invocation hooks, and resolves outputs
//!    back into wire values
//! 5. Every outbound envelope passes schema validation in a single writer
//!    before transmission
//!
//! ## Completion
//!
//! A function may finish either by calling `context.done(..)` or by
//! resolving its future with a value. `CompletionGuard` races the two
//! signals: the first one wins, the loser is reported as a diagnostic,
//! never a second response.

pub mod app;
pub mod codec;
pub mod completion;
pub mod context;
pub mod convert;
pub mod dispatch;
pub mod hooks;
pub mod invocation;
pub mod logging;
pub mod registry;
pub mod value;
pub mod wire;

pub use app::WorkerConfig;
pub use app::WorkerState;
pub use context::HttpRequest;
pub use context::HttpResponseBuilder;
pub use context::InvocationContext;
pub use dispatch::DispatchError;
pub use dispatch::StreamDispatcher;
pub use hooks::HookCallback;
pub use hooks::HookContext;
pub use hooks::HookPoint;
pub use hooks::RegistrationHandle;
pub use registry::AppFunction;
pub use registry::FunctionRegistry;
pub use registry::FunctionResolver;
pub use value::Value;
pub use wire::Envelope;
pub use wire::FunctionMetadata;
pub use wire::Payload;
pub use wire::TypedValue;

/// Test utilities for driving a worker over an in-memory duplex stream.
///
/// `WorkerHarness` plays the host side of the protocol: it spawns the
/// dispatcher on one end of a `tokio::io::duplex` pair and exposes
/// send/receive helpers on the other, buffering log envelopes so tests can
/// assert on responses without interleaving noise.
#[cfg(any(test, feature = "testing"))]
pub mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::BufReader;
    use tokio::io::DuplexStream;
    use tokio::io::ReadHalf;
    use tokio::io::WriteHalf;
    use tokio::task::JoinHandle;

    use crate::app::WorkerState;
    use crate::codec;
    use crate::codec::RawEnvelope;
    use crate::dispatch::DispatchError;
    use crate::dispatch::StreamDispatcher;
    use crate::wire::Envelope;
    use crate::wire::FunctionLoadRequest;
    use crate::wire::FunctionMetadata;
    use crate::wire::Payload;
    use crate::wire::WorkerInitRequest;
    use crate::wire::WorkerTerminate;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    /// Host-side driver for a worker running on an in-memory stream.
    pub struct WorkerHarness {
        pub state: Arc<WorkerState>,
        writer: WriteHalf<DuplexStream>,
        reader: BufReader<ReadHalf<DuplexStream>>,
        worker: JoinHandle<Result<(), DispatchError>>,
        logs: Vec<RawEnvelope>,
    }

    impl WorkerHarness {
        /// Spawn the dispatcher for `state` and return the host handle.
        pub fn spawn(state: Arc<WorkerState>) -> Self {
            let (host_end, worker_end) = tokio::io::duplex(64 * 1024);
            let (host_read, host_write) = tokio::io::split(host_end);
            let (worker_read, worker_write) = tokio::io::split(worker_end);

            let dispatcher = StreamDispatcher::new(Arc::clone(&state));
            let worker = tokio::spawn(async move {
                dispatcher.run(BufReader::new(worker_read), worker_write).await
            });

            Self {
                state,
                writer: host_write,
                reader: BufReader::new(host_read),
                worker,
                logs: Vec::new(),
            }
        }

        pub async fn send(&mut self, envelope: Envelope) -> anyhow::Result<()> {
            codec::write_envelope(&mut self.writer, &envelope).await?;
            Ok(())
        }

        pub async fn send_payload(&mut self, correlation_id: &str, payload: Payload) -> anyhow::Result<()> {
            self.send(Envelope::new(Some(correlation_id.to_string()), payload)).await
        }

        /// Next outbound envelope of any kind, logs included.
        pub async fn recv_any(&mut self) -> anyhow::Result<RawEnvelope> {
            let raw = tokio::time::timeout(RECV_TIMEOUT, codec::read_envelope(&mut self.reader))
                .await
                .map_err(|_| anyhow::anyhow!("timed out waiting for an outbound envelope"))??
                .ok_or_else(|| anyhow::anyhow!("worker closed the stream"))?;
            Ok(raw)
        }

        /// Next non-log envelope. Log records are buffered for [`Self::logs`].
        pub async fn recv(&mut self) -> anyhow::Result<RawEnvelope> {
            loop {
                let raw = self.recv_any().await?;
                if raw.kind == "log" {
                    self.logs.push(raw);
                    continue;
                }
                return Ok(raw);
            }
        }

        /// Log envelopes buffered so far by [`Self::recv`].
        pub fn logs(&self) -> &[RawEnvelope] {
            &self.logs
        }

        pub fn log_messages(&self) -> Vec<String> {
            self.logs
                .iter()
                .map(|raw| raw.body["message"].as_str().unwrap_or_default().to_string())
                .collect()
        }

        /// Run the init handshake and assert success.
        pub async fn init(&mut self) -> anyhow::Result<()> {
            self.send_payload(
                "init",
                Payload::WorkerInitRequest(WorkerInitRequest {
                    host_version: "4.0-test".to_string(),
                }),
            )
            .await?;
            let response = self.recv().await?;
            anyhow::ensure!(response.kind == "workerInitResponse", "unexpected kind '{}'", response.kind);
            anyhow::ensure!(
                response.body["result"]["status"] == "Success",
                "init failed: {}",
                response.body
            );
            Ok(())
        }

        /// Load one function and assert a successful load response.
        pub async fn load_function(&mut self, metadata: FunctionMetadata) -> anyhow::Result<()> {
            let function_id = metadata.id.clone();
            self.send_payload(
                &format!("load-{function_id}"),
                Payload::FunctionLoadRequest(FunctionLoadRequest {
                    function_id: function_id.clone(),
                    metadata,
                }),
            )
            .await?;
            let response = self.recv().await?;
            anyhow::ensure!(response.kind == "functionLoadResponse", "unexpected kind '{}'", response.kind);
            anyhow::ensure!(
                response.body["result"]["status"] == "Success",
                "load of '{function_id}' failed: {}",
                response.body
            );
            Ok(())
        }

        /// Send a terminate message and wait for the run loop to finish.
        pub async fn terminate(mut self) -> anyhow::Result<()> {
            self.send(Envelope::unsolicited(Payload::WorkerTerminate(WorkerTerminate {
                grace_period_secs: 5,
            })))
            .await?;
            self.worker
                .await
                .map_err(|e| anyhow::anyhow!("worker task panicked: {e}"))?
                .map_err(|e| anyhow::anyhow!("dispatcher failed: {e}"))?;
            Ok(())
        }
    }
}
