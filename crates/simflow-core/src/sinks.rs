// EventSink implementations

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use crate::error::SinkError;
use crate::events::OrchestrationEvent;
use crate::traits::EventSink;

/// Discards every event
#[derive(Debug, Clone, Default)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn emit(&self, _event: OrchestrationEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Forwards events to `tracing` as structured log lines
#[derive(Debug, Clone, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: OrchestrationEvent) -> Result<(), SinkError> {
        let payload = serde_json::to_string(&event).map_err(|e| SinkError::Other(e.to_string()))?;
        match &event {
            OrchestrationEvent::BreakerOpened { .. } | OrchestrationEvent::WorkflowFailed { .. } => {
                tracing::warn!(target: "simflow::events", event = event.name(), %payload);
            }
            OrchestrationEvent::DecisionMade { .. } | OrchestrationEvent::NodeEntered { .. } => {
                tracing::debug!(target: "simflow::events", event = event.name(), %payload);
            }
            _ => {
                tracing::info!(target: "simflow::events", event = event.name(), %payload);
            }
        }
        Ok(())
    }
}

/// Collects events in memory (tests, diagnostics)
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventSink {
    events: Arc<RwLock<Vec<OrchestrationEvent>>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events emitted so far, in order
    pub async fn events(&self) -> Vec<OrchestrationEvent> {
        self.events.read().await.clone()
    }

    /// Names of all events emitted so far, in order
    pub async fn names(&self) -> Vec<&'static str> {
        self.events.read().await.iter().map(|e| e.name()).collect()
    }

    /// Number of events with the given name
    pub async fn count(&self, name: &str) -> usize {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn emit(&self, event: OrchestrationEvent) -> Result<(), SinkError> {
        self.events.write().await.push(event);
        Ok(())
    }
}

/// Streams events over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<OrchestrationEvent>,
}

impl ChannelEventSink {
    /// Create a sink and the receiver that drains it
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OrchestrationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: OrchestrationEvent) -> Result<(), SinkError> {
        self.tx.send(event).map_err(|_| SinkError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::emit_or_warn;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_in_memory_sink_preserves_order() {
        let sink = InMemoryEventSink::new();
        let workflow_id = Uuid::now_v7();

        sink.emit_batch(vec![
            OrchestrationEvent::workflow_started(workflow_id, "run cfd", 3),
            OrchestrationEvent::node_entered(workflow_id, "analyze", 1),
            OrchestrationEvent::workflow_completed(workflow_id, 1),
        ])
        .await
        .unwrap();

        assert_eq!(
            sink.names().await,
            vec!["workflow_started", "node_entered", "workflow_completed"]
        );
        assert_eq!(sink.count("node_entered").await, 1);
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_events() {
        let (sink, mut rx) = ChannelEventSink::new();
        let workflow_id = Uuid::now_v7();
        sink.emit(OrchestrationEvent::breaker_closed(workflow_id, "execute:md"))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "breaker_closed");
    }

    #[tokio::test]
    async fn test_channel_sink_reports_closed_receiver() {
        let (sink, rx) = ChannelEventSink::new();
        drop(rx);

        let result = sink
            .emit(OrchestrationEvent::task_submitted(Uuid::now_v7(), "lammps"))
            .await;
        assert!(matches!(result, Err(SinkError::Closed)));

        // emit_or_warn must not panic on a closed sink
        emit_or_warn(&sink, OrchestrationEvent::task_submitted(Uuid::now_v7(), "lammps")).await;
    }

    #[test_log::test(tokio::test)]
    async fn test_tracing_sink_accepts_all_events() {
        let sink = TracingEventSink;
        let workflow_id = Uuid::now_v7();
        sink.emit(OrchestrationEvent::workflow_failed(workflow_id, 2, 4))
            .await
            .unwrap();
        sink.emit(OrchestrationEvent::decision_made(
            workflow_id,
            "validate",
            vec!["aggregate".to_string()],
            "condition_matched",
        ))
        .await
        .unwrap();
    }
}
