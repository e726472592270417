//! Projection of a raw timeline into display turns.
//!
//! This is a pure scan: it holds no state of its own, is fully recomputable
//! from the timeline at any time, and is never an independent source of
//! truth.

use weft_protocol::{EventPayload, TimelineEvent};

/// Who a display turn belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

/// A tool invocation attached to an assistant turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallView {
    pub tool: String,
    pub arguments: serde_json::Value,
}

/// A tool result attached to an assistant turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResultView {
    pub tool: String,
    pub result: String,
    pub is_error: bool,
    pub duration_ms: Option<u64>,
}

/// One user or assistant contribution, with the reasoning and tool activity
/// that occurred during it.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayTurn {
    pub role: Role,
    pub text: String,
    pub reasoning: Vec<String>,
    pub tool_calls: Vec<ToolCallView>,
    pub tool_results: Vec<ToolResultView>,
    /// False for a turn still accumulating (stream in progress)
    pub finished: bool,
}

impl DisplayTurn {
    fn user(text: String) -> Self {
        Self {
            role: Role::User,
            text,
            reasoning: vec![],
            tool_calls: vec![],
            tool_results: vec![],
            finished: true,
        }
    }
}

/// An in-progress assistant accumulation.
#[derive(Default)]
struct Accumulation {
    text: String,
    /// Authoritative text arrived (text_end / assistant message); deltas no
    /// longer apply
    text_final: bool,
    text_fragments: String,
    reasoning: Vec<String>,
    thought_fragments: String,
    tool_calls: Vec<ToolCallView>,
    tool_results: Vec<ToolResultView>,
}

impl Accumulation {
    fn finish(mut self, finished: bool) -> DisplayTurn {
        if !self.thought_fragments.is_empty() {
            self.reasoning.push(std::mem::take(&mut self.thought_fragments));
        }
        let text = if self.text_final || self.text_fragments.is_empty() {
            self.text
        } else {
            self.text_fragments
        };
        DisplayTurn {
            role: Role::Assistant,
            text,
            reasoning: self.reasoning,
            tool_calls: self.tool_calls,
            tool_results: self.tool_results,
            finished,
        }
    }

    fn is_empty(&self) -> bool {
        self.text.is_empty()
            && self.text_fragments.is_empty()
            && self.reasoning.is_empty()
            && self.thought_fragments.is_empty()
            && self.tool_calls.is_empty()
            && self.tool_results.is_empty()
    }
}

/// Derive the flat display message list from a timeline.
///
/// `live_text`/`live_thought` are the conversation's flushed-but-unfinalized
/// stream buffers; they are folded into the provisional open turn, if any.
pub fn project(timeline: &[TimelineEvent], live_text: &str, live_thought: &str) -> Vec<DisplayTurn> {
    let mut turns: Vec<DisplayTurn> = Vec::new();
    let mut open: Option<Accumulation> = None;

    for event in timeline {
        match &event.payload {
            EventPayload::UserMessage { text } => {
                if let Some(acc) = open.take() {
                    turns.push(acc.finish(true));
                }
                turns.push(DisplayTurn::user(text.clone()));
            }
            EventPayload::Thought { text } => {
                open.get_or_insert_default().reasoning.push(text.clone());
            }
            EventPayload::ThoughtDelta { text } => {
                open.get_or_insert_default().thought_fragments.push_str(text);
            }
            EventPayload::Reflection { text, .. } => {
                open.get_or_insert_default().reasoning.push(text.clone());
            }
            EventPayload::Act { tool, arguments } => {
                open.get_or_insert_default().tool_calls.push(ToolCallView {
                    tool: tool.clone(),
                    arguments: arguments.clone(),
                });
            }
            EventPayload::Observe {
                tool,
                result,
                is_error,
                duration_ms,
            } => {
                open.get_or_insert_default()
                    .tool_results
                    .push(ToolResultView {
                        tool: tool.clone(),
                        result: result.clone(),
                        is_error: *is_error,
                        duration_ms: *duration_ms,
                    });
            }
            EventPayload::TextStart => {
                open.get_or_insert_default();
            }
            EventPayload::TextDelta { text } => {
                let acc = open.get_or_insert_default();
                if !acc.text_final {
                    acc.text_fragments.push_str(text);
                }
            }
            EventPayload::TextEnd { text } => {
                let acc = open.get_or_insert_default();
                acc.text = text.clone();
                acc.text_final = true;
            }
            EventPayload::AssistantMessage { text, reasoning } => {
                let mut acc = open.take().unwrap_or_default();
                acc.text = text.clone();
                acc.text_final = true;
                if let Some(r) = reasoning {
                    if !r.is_empty() {
                        acc.reasoning.push(r.clone());
                    }
                }
                turns.push(acc.finish(true));
            }
            EventPayload::TurnComplete { text } => {
                let mut acc = open.take().unwrap_or_default();
                if let Some(t) = text {
                    if !acc.text_final {
                        acc.text = t.clone();
                        acc.text_final = true;
                    }
                }
                if !acc.is_empty() {
                    turns.push(acc.finish(true));
                }
            }
            EventPayload::TurnError { .. } => {
                if let Some(acc) = open.take() {
                    if !acc.is_empty() {
                        turns.push(acc.finish(true));
                    }
                }
            }
            // Side state, not display turns.
            EventPayload::PlanSnapshot { .. }
            | EventPayload::PlanStepStart { .. }
            | EventPayload::PlanExecStart { .. }
            | EventPayload::PlanExecEnd { .. }
            | EventPayload::DecisionRequest { .. }
            | EventPayload::Anomaly { .. }
            | EventPayload::TitleUpdate { .. } => {}
        }
    }

    // A still-open accumulation is a provisional, not-yet-final turn.
    if let Some(mut acc) = open.take() {
        if !acc.text_final && !live_text.is_empty() {
            acc.text_fragments.push_str(live_text);
        }
        if !live_thought.is_empty() {
            acc.thought_fragments.push_str(live_thought);
        }
        if !acc.is_empty() {
            turns.push(acc.finish(false));
        }
    } else if !live_text.is_empty() || !live_thought.is_empty() {
        let mut acc = Accumulation::default();
        acc.text_fragments.push_str(live_text);
        acc.thought_fragments.push_str(live_thought);
        turns.push(acc.finish(false));
    }

    turns
}
