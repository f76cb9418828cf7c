// Core traits for pluggable backends
//
// The engine only emits events; persisting them (provenance, audit trail) is
// the job of whatever sits behind this trait:
// - In-memory implementations for tests
// - Channel-based implementations for streaming to another component
// - tracing-backed implementation for logs

use async_trait::async_trait;

use crate::error::SinkError;
use crate::events::OrchestrationEvent;

// ============================================================================
// EventSink - append-only observability output
// ============================================================================

/// Receiver of orchestration events
///
/// Failing to emit never affects control flow; callers log and continue.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emit a single event
    async fn emit(&self, event: OrchestrationEvent) -> Result<(), SinkError>;

    /// Emit multiple events in order
    async fn emit_batch(&self, events: Vec<OrchestrationEvent>) -> Result<(), SinkError> {
        for event in events {
            self.emit(event).await?;
        }
        Ok(())
    }
}

/// Emit an event and swallow sink failures with a warning
pub async fn emit_or_warn(sink: &dyn EventSink, event: OrchestrationEvent) {
    let name = event.name();
    if let Err(e) = sink.emit(event).await {
        tracing::warn!(event = name, error = %e, "failed to emit orchestration event");
    }
}
