// SimFlow core types
//
// This crate holds everything the orchestration engine and its external
// collaborators agree on, with no dependency on an executor or runtime:
// - Task model (TaskSpec, Task, TaskStatus) with monotonic status transitions
// - Error taxonomy (ErrorKind, Severity, NodeError) used for routing decisions
// - Orchestration events and the EventSink trait for provenance/audit consumers
// - Serde helpers for millisecond durations in configuration

pub mod error;
pub mod events;
pub mod serde_helpers;
pub mod sinks;
pub mod task;
pub mod traits;

pub use error::{ErrorKind, NodeError, Severity, SinkError};
pub use events::OrchestrationEvent;
pub use sinks::{ChannelEventSink, InMemoryEventSink, NoopEventSink, TracingEventSink};
pub use task::{Task, TaskId, TaskParams, TaskSpec, TaskStatus};
pub use traits::{emit_or_warn, EventSink};
