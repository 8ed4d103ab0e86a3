//! Wire-facing log emission.
//!
//! The engine never formats or persists logs. Every diagnostic is mirrored
//! two ways: a structured `tracing` event for in-process subscribers, and a
//! `log` envelope queued on the outbound stream for the host. [`WireLogger`]
//! is the cheap-clone handle both paths go through.

use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::dispatch::OutboundMessage;
use crate::wire::Envelope;
use crate::wire::LogCategory;
use crate::wire::LogLevel;
use crate::wire::LogRecord;
use crate::wire::Payload;

/// Handle for emitting log records onto the outbound stream.
///
/// Cloning is cheap; [`WireLogger::for_invocation`] derives a handle whose
/// records carry the invocation id. Emission is fire-and-forget: once the
/// outbound channel is gone (shutdown) records still reach `tracing` but are
/// no longer forwarded to the host.
#[derive(Clone)]
pub struct WireLogger {
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    category: String,
    invocation_id: Option<String>,
}

impl WireLogger {
    pub fn new(outbound: mpsc::UnboundedSender<OutboundMessage>, category: impl Into<String>) -> Self {
        Self {
            outbound,
            category: category.into(),
            invocation_id: None,
        }
    }

    /// Derive a logger whose records are tagged with `invocation_id`.
    pub fn for_invocation(&self, invocation_id: &str) -> Self {
        Self {
            outbound: self.outbound.clone(),
            category: self.category.clone(),
            invocation_id: Some(invocation_id.to_string()),
        }
    }

    /// Emit an engine diagnostic.
    pub fn system(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(level, LogCategory::System, message.into());
    }

    /// Forward a record produced by user logic.
    pub fn user(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(level, LogCategory::User, message.into());
    }

    fn emit(&self, level: LogLevel, log_category: LogCategory, message: String) {
        let invocation_id = self.invocation_id.as_deref().unwrap_or("");
        match level {
            LogLevel::Trace => trace!(invocation_id, category = %self.category, "{message}"),
            LogLevel::Debug => debug!(invocation_id, category = %self.category, "{message}"),
            LogLevel::Information => info!(invocation_id, category = %self.category, "{message}"),
            LogLevel::Warning => warn!(invocation_id, category = %self.category, "{message}"),
            LogLevel::Error | LogLevel::Critical => error!(invocation_id, category = %self.category, "{message}"),
        }

        let record = LogRecord {
            invocation_id: self.invocation_id.clone(),
            category: self.category.clone(),
            message,
            level,
            log_category,
        };
        // The writer half may already be gone during shutdown.
        let _ = self
            .outbound
            .send(OutboundMessage::Envelope(Envelope::unsolicited(Payload::Log(record))));
    }
}
