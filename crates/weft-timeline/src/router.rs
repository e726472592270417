//! Stream event router: one handler per inbound event type, each mutating
//! only the conversation the event belongs to.
//!
//! Handlers are plain functions over `(&mut ConversationState, payload)`:
//! they mutate the state and return buffer side effects for the store to
//! carry out. They are idempotent under at-least-once delivery and degrade
//! to neutral defaults on missing payload fields (serde fills those in
//! before events get here). An unrecognized event type is silently ignored.

use weft_protocol::{EventId, EventPayload, PlanRunStatus, PlanState, PlanStepStatus, StreamEvent};

use crate::buffer::Channel;
use crate::conversation::{
    AgentPhase, ConversationState, PendingDecision, StreamPhase, ToolCallState, ToolCallStatus,
};

/// A buffer operation the store must perform after a handler ran.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Append a fragment to the channel's delta buffer.
    Buffer { channel: Channel, fragment: String },
    /// Drop any buffered partial for the channel; authoritative content
    /// superseded it.
    Discard { channel: Channel },
    /// Cancel and drop every buffer for the conversation.
    ClearBuffers,
}

/// What a handler did.
pub struct Outcome {
    pub effects: Vec<Effect>,
    /// Whether conversation state visible to the UI changed. Delta
    /// fragments only touch the buffer, so they report false; the flush is
    /// the one mutation per interval.
    pub changed: bool,
}

impl Outcome {
    fn changed(effects: Vec<Effect>) -> Self {
        Self {
            effects,
            changed: true,
        }
    }

    fn buffered(channel: Channel, fragment: String) -> Self {
        Self {
            effects: vec![Effect::Buffer { channel, fragment }],
            changed: false,
        }
    }

    fn ignored() -> Self {
        Self {
            effects: vec![],
            changed: false,
        }
    }
}

/// Dispatch one inbound event to its handler.
///
/// `event_id` is the delivery identity from the envelope, when the backend
/// sent one. An identity already present in the timeline marks a
/// redelivered event and the whole dispatch becomes a no-op.
pub fn handle(
    state: &mut ConversationState,
    event: &StreamEvent,
    event_id: Option<&EventId>,
) -> Outcome {
    if let Some(id) = event_id {
        if state.contains_event(id) {
            tracing::debug!(conversation = %state.id, event = %id, "dropping redelivered event");
            return Outcome::ignored();
        }
    }

    match event {
        StreamEvent::TurnStart => on_turn_start(state),
        StreamEvent::TextStart => on_text_start(state),
        StreamEvent::TextDelta { text } => Outcome::buffered(Channel::Text, text.clone()),
        StreamEvent::TextEnd { text } => on_text_end(state, text, event_id),
        StreamEvent::Thought { text } => on_thought(state, text, event_id),
        StreamEvent::ThoughtDelta { text } => Outcome::buffered(Channel::Thought, text.clone()),
        StreamEvent::ToolStart { tool, arguments } => {
            on_tool_start(state, tool, arguments, event_id)
        }
        StreamEvent::ToolEnd {
            tool,
            result,
            is_error,
        } => on_tool_end(state, tool.as_deref(), result, *is_error, event_id),
        StreamEvent::PlanSnapshot { plan } => on_plan_snapshot(state, plan, event_id),
        StreamEvent::PlanStepStart { plan_id, step_id } => {
            on_plan_step_start(state, plan_id, step_id, event_id)
        }
        StreamEvent::PlanExecStart { plan_id } => on_plan_exec_start(state, plan_id, event_id),
        StreamEvent::PlanExecEnd { plan_id, success } => {
            on_plan_exec_end(state, plan_id, *success, event_id)
        }
        StreamEvent::Reflection { text, verdict } => {
            on_reflection(state, text, verdict.clone(), event_id)
        }
        StreamEvent::DecisionRequest {
            request_id,
            payload,
        } => on_decision_request(state, request_id, payload, event_id),
        StreamEvent::Anomaly {
            message,
            tool,
            count,
        } => on_anomaly(state, message, tool.clone(), *count, event_id),
        StreamEvent::TitleUpdate { title } => on_title_update(state, title, event_id),
        StreamEvent::TurnComplete { text } => on_turn_complete(state, text.clone(), event_id),
        StreamEvent::TurnError { message } => on_turn_error(state, message, event_id),
        StreamEvent::ConnectionClosed => on_connection_closed(state),
        StreamEvent::Unknown => {
            tracing::debug!(conversation = %state.id, "ignoring unknown stream event type");
            Outcome::ignored()
        }
    }
}

fn on_turn_start(state: &mut ConversationState) -> Outcome {
    state.is_streaming = true;
    state.stream_phase = StreamPhase::Streaming;
    state.agent_phase = AgentPhase::Thinking;
    state.stream_text.clear();
    state.stream_thought.clear();
    state.pending_decision = None;
    state.anomaly = None;
    state.last_error = None;
    state.aborted = false;
    Outcome::changed(vec![Effect::ClearBuffers])
}

fn on_text_start(state: &mut ConversationState) -> Outcome {
    state.is_streaming = true;
    state.stream_phase = StreamPhase::Streaming;
    state.stream_text.clear();
    Outcome::changed(vec![Effect::Discard {
        channel: Channel::Text,
    }])
}

fn on_text_end(state: &mut ConversationState, text: &str, event_id: Option<&EventId>) -> Outcome {
    // Authoritative full text wins over any divergent buffered partial.
    state.stream_text.clear();
    state.append_with_id(
        event_id,
        EventPayload::TextEnd {
            text: text.to_string(),
        },
    );
    Outcome::changed(vec![Effect::Discard {
        channel: Channel::Text,
    }])
}

fn on_thought(state: &mut ConversationState, text: &str, event_id: Option<&EventId>) -> Outcome {
    if text.trim().is_empty() {
        return Outcome::ignored();
    }
    state.agent_phase = AgentPhase::Thinking;
    state.append_with_id(
        event_id,
        EventPayload::Thought {
            text: text.to_string(),
        },
    );
    Outcome::changed(vec![])
}

fn on_tool_start(
    state: &mut ConversationState,
    tool: &str,
    arguments: &serde_json::Value,
    event_id: Option<&EventId>,
) -> Outcome {
    // A start for a tool already tracked as running is a redelivery; a
    // second stack push would let `pending_tools` outgrow the call map.
    if state
        .active_tool_calls
        .get(tool)
        .is_some_and(|call| call.status == ToolCallStatus::Running)
    {
        tracing::debug!(conversation = %state.id, tool = %tool, "dropping redelivered tool start");
        return Outcome::ignored();
    }

    state.pending_tools.push(tool.to_string());
    state.active_tool_calls.insert(
        tool.to_string(),
        ToolCallState {
            status: ToolCallStatus::Running,
            started_at: chrono::Utc::now().timestamp_millis(),
            result: None,
            duration_ms: None,
        },
    );
    state.append_with_id(
        event_id,
        EventPayload::Act {
            tool: tool.to_string(),
            arguments: arguments.clone(),
        },
    );
    state.agent_phase = AgentPhase::Acting;
    Outcome::changed(vec![])
}

fn on_tool_end(
    state: &mut ConversationState,
    tool: Option<&str>,
    result: &str,
    is_error: bool,
    event_id: Option<&EventId>,
) -> Outcome {
    let popped = state.pending_tools.pop();
    let name = tool
        .map(str::to_string)
        .or(popped)
        .unwrap_or_else(|| "unknown".to_string());

    let now = chrono::Utc::now().timestamp_millis();
    let duration_ms = match state.active_tool_calls.get_mut(&name) {
        Some(call) => {
            let elapsed = (now - call.started_at).max(0) as u64;
            call.status = if is_error {
                ToolCallStatus::Failed
            } else {
                ToolCallStatus::Success
            };
            call.result = Some(result.to_string());
            call.duration_ms = Some(elapsed);
            Some(elapsed)
        }
        None => {
            tracing::warn!(conversation = %state.id, tool = %name, "result for untracked tool call");
            None
        }
    };

    state.append_with_id(
        event_id,
        EventPayload::Observe {
            tool: name,
            result: result.to_string(),
            is_error,
            duration_ms,
        },
    );
    state.agent_phase = AgentPhase::Observing;
    Outcome::changed(vec![])
}

/// Fetch the plan, creating a minimal shell when the id is unknown.
fn plan_mut<'a>(state: &'a mut ConversationState, plan_id: &str) -> &'a mut PlanState {
    if state.plan.as_ref().is_none_or(|p| p.id != plan_id) {
        state.plan = Some(PlanState::shell(plan_id));
    }
    state.plan.get_or_insert_with(|| PlanState::shell(plan_id))
}

fn on_plan_snapshot(
    state: &mut ConversationState,
    plan: &PlanState,
    event_id: Option<&EventId>,
) -> Outcome {
    state.plan = Some(plan.clone());
    state.append_with_id(event_id, EventPayload::PlanSnapshot { plan: plan.clone() });
    Outcome::changed(vec![])
}

fn on_plan_step_start(
    state: &mut ConversationState,
    plan_id: &str,
    step_id: &str,
    event_id: Option<&EventId>,
) -> Outcome {
    let plan = plan_mut(state, plan_id);
    match plan.steps.iter_mut().find(|s| s.id == step_id) {
        Some(step) => step.status = PlanStepStatus::Active,
        None => plan.steps.push(weft_protocol::PlanStep {
            id: step_id.to_string(),
            title: String::new(),
            status: PlanStepStatus::Active,
        }),
    }
    state.append_with_id(
        event_id,
        EventPayload::PlanStepStart {
            plan_id: plan_id.to_string(),
            step_id: step_id.to_string(),
        },
    );
    Outcome::changed(vec![])
}

fn on_plan_exec_start(
    state: &mut ConversationState,
    plan_id: &str,
    event_id: Option<&EventId>,
) -> Outcome {
    plan_mut(state, plan_id).status = PlanRunStatus::Running;
    state.append_with_id(
        event_id,
        EventPayload::PlanExecStart {
            plan_id: plan_id.to_string(),
        },
    );
    Outcome::changed(vec![])
}

fn on_plan_exec_end(
    state: &mut ConversationState,
    plan_id: &str,
    success: bool,
    event_id: Option<&EventId>,
) -> Outcome {
    plan_mut(state, plan_id).status = if success {
        PlanRunStatus::Completed
    } else {
        PlanRunStatus::Failed
    };
    state.append_with_id(
        event_id,
        EventPayload::PlanExecEnd {
            plan_id: plan_id.to_string(),
            success,
        },
    );
    Outcome::changed(vec![])
}

fn on_reflection(
    state: &mut ConversationState,
    text: &str,
    verdict: Option<String>,
    event_id: Option<&EventId>,
) -> Outcome {
    state.append_with_id(
        event_id,
        EventPayload::Reflection {
            text: text.to_string(),
            verdict,
        },
    );
    Outcome::changed(vec![])
}

fn on_decision_request(
    state: &mut ConversationState,
    request_id: &str,
    payload: &serde_json::Value,
    event_id: Option<&EventId>,
) -> Outcome {
    state.pending_decision = Some(PendingDecision {
        request_id: request_id.to_string(),
        payload: payload.clone(),
    });
    state.agent_phase = AgentPhase::AwaitingInput;
    state.append_with_id(
        event_id,
        EventPayload::DecisionRequest {
            request_id: request_id.to_string(),
            payload: payload.clone(),
        },
    );
    Outcome::changed(vec![])
}

fn on_anomaly(
    state: &mut ConversationState,
    message: &str,
    tool: Option<String>,
    count: u32,
    event_id: Option<&EventId>,
) -> Outcome {
    // Advisory only: streaming flags stay untouched.
    state.anomaly = Some(message.to_string());
    state.append_with_id(
        event_id,
        EventPayload::Anomaly {
            message: message.to_string(),
            tool,
            count,
        },
    );
    Outcome::changed(vec![])
}

fn on_title_update(
    state: &mut ConversationState,
    title: &str,
    event_id: Option<&EventId>,
) -> Outcome {
    state.title = Some(title.to_string());
    state.append_with_id(
        event_id,
        EventPayload::TitleUpdate {
            title: title.to_string(),
        },
    );
    Outcome::changed(vec![])
}

fn on_turn_complete(
    state: &mut ConversationState,
    text: Option<String>,
    event_id: Option<&EventId>,
) -> Outcome {
    state.active_tool_calls.clear();
    state.pending_tools.clear();
    state.is_streaming = false;
    state.stream_phase = StreamPhase::Idle;
    state.agent_phase = AgentPhase::Idle;
    state.pending_decision = None;
    state.stream_text.clear();
    state.stream_thought.clear();
    // The delivery identity goes on the first appended event, which is
    // enough for the dispatch-level redelivery check to catch the whole
    // handler.
    if let Some(text) = text {
        state.append_with_id(
            event_id,
            EventPayload::AssistantMessage {
                text,
                reasoning: None,
            },
        );
        state.append(EventPayload::TurnComplete { text: None });
    } else {
        state.append_with_id(event_id, EventPayload::TurnComplete { text: None });
    }
    Outcome::changed(vec![Effect::ClearBuffers])
}

fn on_turn_error(
    state: &mut ConversationState,
    message: &str,
    event_id: Option<&EventId>,
) -> Outcome {
    state.last_error = Some(message.to_string());
    state.stream_phase = StreamPhase::Error;
    state.is_streaming = false;
    state.agent_phase = AgentPhase::Idle;
    state.append_with_id(
        event_id,
        EventPayload::TurnError {
            message: message.to_string(),
        },
    );
    Outcome::changed(vec![Effect::ClearBuffers])
}

fn on_connection_closed(state: &mut ConversationState) -> Outcome {
    // Accumulated content stays; only the live flag drops.
    state.is_streaming = false;
    Outcome::changed(vec![])
}
