//! Inbound push-stream event types
//!
//! One live connection delivers a single ordered stream of these events;
//! events for different conversations may be interleaved, so every event is
//! wrapped in an envelope naming the conversation it belongs to.

use serde::{Deserialize, Serialize};

use crate::event::{ConversationId, EventId, PlanState};

/// A typed event pushed by the agent backend during a live turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A new turn began
    TurnStart,

    /// Streamed assistant text started
    TextStart,

    /// A partial piece of streamed assistant text
    TextDelta { text: String },

    /// Streamed assistant text finished; `text` is the authoritative whole
    TextEnd { text: String },

    /// A complete (non-streamed) reasoning note
    Thought { text: String },

    /// A partial piece of streamed reasoning
    ThoughtDelta { text: String },

    /// Tool invocation started
    ToolStart {
        tool: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },

    /// Tool invocation finished
    ToolEnd {
        #[serde(default)]
        tool: Option<String>,
        #[serde(default)]
        result: String,
        #[serde(default)]
        is_error: bool,
    },

    /// Full plan snapshot
    PlanSnapshot { plan: PlanState },

    /// A plan step became active
    PlanStepStart {
        plan_id: String,
        step_id: String,
    },

    /// Plan execution started
    PlanExecStart { plan_id: String },

    /// Plan execution finished
    PlanExecEnd {
        plan_id: String,
        #[serde(default)]
        success: bool,
    },

    /// Self-review of a finished action or plan
    Reflection {
        text: String,
        #[serde(default)]
        verdict: Option<String>,
    },

    /// The agent is waiting on an external approval
    DecisionRequest {
        request_id: String,
        #[serde(default)]
        payload: serde_json::Value,
    },

    /// Advisory notice, e.g. a repeated tool-call loop was detected
    Anomaly {
        message: String,
        #[serde(default)]
        tool: Option<String>,
        #[serde(default)]
        count: u32,
    },

    /// The conversation title changed
    TitleUpdate { title: String },

    /// The turn finished normally; `text` carries final content if any
    TurnComplete {
        #[serde(default)]
        text: Option<String>,
    },

    /// The turn finished with an error
    TurnError { message: String },

    /// The push connection closed
    ConnectionClosed,

    /// An event type this client does not know. Ignored by the router so
    /// newer backends remain compatible.
    #[serde(other)]
    Unknown,
}

/// A stream event together with the conversation it belongs to.
///
/// `event_id` is the backend's stable identity for this delivery. The push
/// channel is at-least-once, so the same event may arrive more than once;
/// carrying the identity through to the appended timeline event lets
/// redeliveries be recognized and dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    #[serde(flatten)]
    pub event: StreamEvent,
}

impl StreamEnvelope {
    pub fn new(conversation_id: ConversationId, event: StreamEvent) -> Self {
        Self {
            conversation_id,
            event_id: None,
            event,
        }
    }

    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = Some(event_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_flattens_event() {
        let json = serde_json::json!({
            "conversation_id": "c1",
            "type": "text_delta",
            "text": "Hel"
        });
        let env: StreamEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(env.conversation_id, ConversationId::from("c1"));
        assert_eq!(env.event, StreamEvent::TextDelta { text: "Hel".into() });
    }

    #[test]
    fn test_unknown_event_type_parses_as_unknown() {
        let json = serde_json::json!({
            "conversation_id": "c1",
            "type": "hologram_projection",
            "whatever": 42
        });
        let env: StreamEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(env.event, StreamEvent::Unknown);
    }

    #[test]
    fn test_envelope_carries_delivery_identity() {
        let json = serde_json::json!({
            "conversation_id": "c1",
            "event_id": "e42",
            "type": "thought",
            "text": "hm"
        });
        let env: StreamEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(env.event_id, Some(EventId::from("e42")));
        // The identity is optional on the wire.
        let bare: StreamEnvelope = serde_json::from_value(serde_json::json!({
            "conversation_id": "c1",
            "type": "turn_start"
        }))
        .unwrap();
        assert!(bare.event_id.is_none());
    }

    #[test]
    fn test_tool_end_without_name() {
        let json = serde_json::json!({
            "conversation_id": "c1",
            "type": "tool_end",
            "result": "ok"
        });
        let env: StreamEnvelope = serde_json::from_value(json).unwrap();
        match env.event {
            StreamEvent::ToolEnd { tool, result, is_error } => {
                assert!(tool.is_none());
                assert_eq!(result, "ok");
                assert!(!is_error);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
