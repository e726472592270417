//! weft-timeline: client-side timeline synchronization engine
//!
//! This crate keeps a per-conversation view of an agent conversation
//! consistent across two sources of truth that overlap and race: a live
//! push stream of typed events and a durable paginated history. The
//! [`TimelineStore`] is the single entry point; the transport and history
//! backends plug in behind the [`Transport`] and [`HistoryClient`] traits.

pub mod buffer;
pub mod conversation;
pub mod error;
pub mod history;
pub mod merge;
pub mod projector;
pub mod router;
pub mod store;
pub mod transport;

pub use buffer::{Channel, DeltaBuffer, DEFAULT_FLUSH_INTERVAL};
pub use conversation::{
    AgentPhase, ConversationState, PendingDecision, StreamPhase, ToolCallState, ToolCallStatus,
};
pub use error::{Error, Result};
pub use history::HistoryClient;
pub use merge::merge_events;
pub use projector::{DisplayTurn, Role, ToolCallView, ToolResultView};
pub use router::{Effect, Outcome};
pub use store::{StoreUpdate, TimelineStore, DEFAULT_PAGE_SIZE};
pub use transport::{StreamEventStream, Transport};
