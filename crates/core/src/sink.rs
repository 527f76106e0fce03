//! Logging sink injected into core components
//!
//! Components receive an `Arc<dyn LogSink>` at construction instead of
//! reaching for process-wide logging state. The default sink forwards to
//! `tracing`, so the binary's subscriber decides where the lines end up.

use std::sync::Arc;

/// Leveled log sink
pub trait LogSink: Send + Sync {
    /// Diagnostic detail
    fn debug(&self, message: &str);

    /// Recoverable failure
    fn warn(&self, message: &str);

    /// Unrecoverable failure
    fn error(&self, message: &str);
}

/// Sink that forwards to the `tracing` macros
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn debug(&self, message: &str) {
        tracing::debug!(target: "bfs", "{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "bfs", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "bfs", "{message}");
    }
}

/// Shared default sink
pub fn tracing_sink() -> Arc<dyn LogSink> {
    Arc::new(TracingSink)
}
