//! Durable timeline event types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a conversation.
///
/// Generated client-side as a UUID before any server round-trip, and never
/// renamed afterwards, so server snapshots merge by identity rather than
/// needing a remapping step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Generate a fresh conversation identity.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Stable identity of a single timeline event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    /// Generate a fresh event identity.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One entry in a conversation's event log.
///
/// `seq` is the ordering key: timelines are kept sorted ascending by it, and
/// no two events in one timeline share an `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: EventId,
    pub seq: u64,
    /// Unix millis
    pub timestamp: i64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl TimelineEvent {
    /// Build a new locally originated event with a generated id and the
    /// current wall-clock timestamp.
    pub fn new(seq: u64, payload: EventPayload) -> Self {
        Self {
            id: EventId::generate(),
            seq,
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload,
        }
    }
}

/// Type-specific payload of a timeline event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A user contribution
    UserMessage { text: String },

    /// A finished assistant contribution
    AssistantMessage {
        text: String,
        #[serde(default)]
        reasoning: Option<String>,
    },

    /// A non-streamed reasoning note
    Thought { text: String },

    /// A partial piece of streamed reasoning
    ThoughtDelta { text: String },

    /// Tool invocation start
    Act {
        tool: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },

    /// Tool invocation result
    Observe {
        tool: String,
        result: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        duration_ms: Option<u64>,
    },

    /// Streamed assistant text started
    TextStart,

    /// A partial piece of streamed assistant text
    TextDelta { text: String },

    /// Streamed assistant text finished; carries the authoritative full text
    TextEnd { text: String },

    /// Full plan snapshot
    PlanSnapshot { plan: PlanState },

    /// A plan step became active
    PlanStepStart { plan_id: String, step_id: String },

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

    /// The turn finished normally
    TurnComplete {
        #[serde(default)]
        text: Option<String>,
    },

    /// The turn finished with an error
    TurnError { message: String },
}

/// Status of a whole plan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanRunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// Status of a single plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStepStatus {
    #[default]
    Pending,
    Active,
    Completed,
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: PlanStepStatus,
}

/// A plan as last reported by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanState {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub status: PlanRunStatus,
}

impl PlanState {
    /// A minimal shell for a plan that was referenced before any snapshot
    /// arrived. Step/exec events for unknown plan ids are tolerated this way.
    pub fn shell(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            steps: vec![],
            status: PlanRunStatus::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trips_with_tag() {
        let ev = TimelineEvent::new(
            7,
            EventPayload::Observe {
                tool: "search".into(),
                result: "3 hits".into(),
                is_error: false,
                duration_ms: Some(120),
            },
        );
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "observe");
        assert_eq!(json["seq"], 7);
        let back: TimelineEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let json = serde_json::json!({
            "id": "e1",
            "seq": 1,
            "timestamp": 0,
            "type": "observe",
            "tool": "search",
            "result": "ok"
        });
        let ev: TimelineEvent = serde_json::from_value(json).unwrap();
        match ev.payload {
            EventPayload::Observe {
                is_error,
                duration_ms,
                ..
            } => {
                assert!(!is_error);
                assert!(duration_ms.is_none());
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = TimelineEvent::new(1, EventPayload::TextStart);
        let b = TimelineEvent::new(1, EventPayload::TextStart);
        assert_ne!(a.id, b.id);
    }
}
