//! Per-conversation state: the event log, streaming flags, tool activity,
//! and pagination cursors.

use std::collections::HashMap;

use weft_protocol::{ConversationId, EventId, EventPayload, PlanState, TimelineEvent};

use crate::projector::DisplayTurn;

/// What the agent is currently doing, as inferred from the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentPhase {
    #[default]
    Idle,
    Thinking,
    Acting,
    Observing,
    AwaitingInput,
}

/// Lifecycle of the push stream for one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPhase {
    #[default]
    Idle,
    Streaming,
    Error,
}

/// Terminal or running status of one tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallStatus {
    Running,
    Success,
    Failed,
}

/// Live record of a tool invocation, keyed by tool name in
/// [`ConversationState::active_tool_calls`].
#[derive(Debug, Clone)]
pub struct ToolCallState {
    pub status: ToolCallStatus,
    /// Unix millis when the invocation started
    pub started_at: i64,
    pub result: Option<String>,
    pub duration_ms: Option<u64>,
}

/// A decision the agent is waiting on, stored opaquely for external
/// approval handling.
#[derive(Debug, Clone)]
pub struct PendingDecision {
    pub request_id: String,
    pub payload: serde_json::Value,
}

/// All mutable state for one conversation.
///
/// Invariants: no two timeline events share an id; the timeline is sorted
/// ascending by `seq`; `pending_tools` never outgrows `active_tool_calls`;
/// `has_earlier` is true only while an unfetched gap may exist before
/// `earliest_seq`.
#[derive(Debug, Clone)]
pub struct ConversationState {
    pub id: ConversationId,
    /// Ordered, deduplicated event log
    pub timeline: Vec<TimelineEvent>,
    /// Display projection, recomputed from the timeline after each mutation
    pub messages: Vec<DisplayTurn>,

    // Streaming state
    pub is_streaming: bool,
    pub stream_phase: StreamPhase,
    pub agent_phase: AgentPhase,
    /// Flushed-but-not-finalized streamed assistant text
    pub stream_text: String,
    /// Flushed-but-not-finalized streamed reasoning
    pub stream_thought: String,

    // Tool activity
    pub active_tool_calls: HashMap<String, ToolCallState>,
    /// In-flight call nesting, last-in-first-out
    pub pending_tools: Vec<String>,

    // Pagination cursors
    pub earliest_seq: Option<u64>,
    pub latest_seq: Option<u64>,
    pub has_earlier: bool,

    // Side state
    pub title: Option<String>,
    pub plan: Option<PlanState>,
    pub pending_decision: Option<PendingDecision>,
    pub anomaly: Option<String>,
    pub last_error: Option<String>,
    /// Set by a deliberate abort; distinct from `last_error`
    pub aborted: bool,

    // Operation guards
    pub send_in_flight: bool,
    pub loading_earlier: bool,

    /// Next ordering key for locally originated events
    next_local_seq: u64,
}

impl ConversationState {
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            timeline: Vec::new(),
            messages: Vec::new(),
            is_streaming: false,
            stream_phase: StreamPhase::default(),
            agent_phase: AgentPhase::default(),
            stream_text: String::new(),
            stream_thought: String::new(),
            active_tool_calls: HashMap::new(),
            pending_tools: Vec::new(),
            earliest_seq: None,
            latest_seq: None,
            has_earlier: false,
            title: None,
            plan: None,
            pending_decision: None,
            anomaly: None,
            last_error: None,
            aborted: false,
            send_in_flight: false,
            loading_earlier: false,
            next_local_seq: 1,
        }
    }

    /// Allocate the next ordering key for a locally originated event.
    ///
    /// Always strictly greater than every key currently in the timeline, so
    /// local appends keep the ascending-order invariant.
    pub fn next_seq(&mut self) -> u64 {
        let seq = self
            .next_local_seq
            .max(self.latest_seq.map_or(1, |s| s + 1));
        self.next_local_seq = seq + 1;
        seq
    }

    /// Append a locally originated event to the end of the timeline.
    /// Returns the ordering key it was assigned.
    pub fn append(&mut self, payload: EventPayload) -> u64 {
        self.append_with_id(None, payload)
    }

    /// Append an event, keeping the delivery identity when the stream
    /// provided one so a redelivery of the same event can be recognized.
    /// A missing identity gets a generated one.
    pub fn append_with_id(&mut self, id: Option<&EventId>, payload: EventPayload) -> u64 {
        let seq = self.next_seq();
        let mut event = TimelineEvent::new(seq, payload);
        if let Some(id) = id {
            event.id = id.clone();
        }
        self.latest_seq = Some(seq);
        if self.earliest_seq.is_none() {
            self.earliest_seq = Some(seq);
        }
        self.timeline.push(event);
        seq
    }

    /// Whether an event with this identity is already in the timeline.
    pub fn contains_event(&self, id: &EventId) -> bool {
        self.timeline.iter().any(|e| e.id == *id)
    }

    /// Replace the timeline after a merge and recompute boundary cursors.
    ///
    /// `has_earlier` is left to the caller, which knows whether the fetch
    /// that triggered the merge reported more history.
    pub fn install_timeline(&mut self, timeline: Vec<TimelineEvent>) {
        self.timeline = timeline;
        self.earliest_seq = self.timeline.first().map(|e| e.seq);
        self.latest_seq = self.timeline.last().map(|e| e.seq);
        if let Some(latest) = self.latest_seq {
            self.next_local_seq = self.next_local_seq.max(latest + 1);
        }
    }

    /// Whether any locally streamed event may not yet be reflected in
    /// durable storage. While true, a history refresh must merge, never
    /// replace.
    pub fn has_live_activity(&self) -> bool {
        self.is_streaming || self.send_in_flight || !self.active_tool_calls.is_empty()
    }

    /// Reset all streaming-related state to idle without touching the
    /// accumulated timeline.
    pub fn reset_streaming(&mut self) {
        self.is_streaming = false;
        self.stream_phase = StreamPhase::Idle;
        self.agent_phase = AgentPhase::Idle;
        self.stream_text.clear();
        self.stream_thought.clear();
        self.active_tool_calls.clear();
        self.pending_tools.clear();
    }
}
