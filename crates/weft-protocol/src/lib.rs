//! weft-protocol: Wire and timeline event types
//!
//! Shared data model for the weft timeline engine: durable timeline events,
//! inbound push-stream events, and history page shapes. Everything here is
//! plain data with serde derives; behavior lives in weft-timeline.

pub mod event;
pub mod page;
pub mod stream;

pub use event::{
    ConversationId, EventId, EventPayload, PlanRunStatus, PlanState, PlanStep, PlanStepStatus,
    TimelineEvent,
};
pub use page::TimelinePage;
pub use stream::{StreamEnvelope, StreamEvent};
