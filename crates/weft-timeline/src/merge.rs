//! Merge/reconciliation of fetched history with the in-memory timeline.
//!
//! A history refresh must behave as a non-destructive merge, never a
//! wholesale replace: a locally streamed event that has not yet appeared in
//! durable storage survives every refresh, and no event is ever duplicated.

use std::collections::HashMap;

use weft_protocol::{EventPayload, TimelineEvent};

/// Merge a fetched batch of durable events into the current timeline.
///
/// The union is keyed by event identity. For an identity present on both
/// sides exactly one copy is kept: the fetched copy is authoritative for
/// persisted fields, but fields it left empty are filled from the local
/// copy ("prefer the richer of the two"). The result is sorted ascending by
/// ordering key.
///
/// An empty incoming batch is a true no-op.
pub fn merge_events(current: &[TimelineEvent], incoming: &[TimelineEvent]) -> Vec<TimelineEvent> {
    if incoming.is_empty() {
        return current.to_vec();
    }

    let mut by_id: HashMap<&str, &TimelineEvent> = HashMap::with_capacity(current.len());
    for event in current {
        by_id.insert(event.id.0.as_str(), event);
    }

    let mut merged: Vec<TimelineEvent> = Vec::with_capacity(current.len() + incoming.len());
    for fetched in incoming {
        match by_id.remove(fetched.id.0.as_str()) {
            Some(local) => merged.push(merge_pair(local, fetched)),
            None => merged.push(fetched.clone()),
        }
    }
    // Whatever remains in the map is local-only and must not be dropped.
    merged.extend(by_id.into_values().cloned());

    merged.sort_by(|a, b| {
        a.seq
            .cmp(&b.seq)
            .then(a.timestamp.cmp(&b.timestamp))
            .then_with(|| a.id.0.cmp(&b.id.0))
    });
    merged
}

/// Combine the local and fetched copies of one logical event.
///
/// The fetched copy wins ordering key, timestamp, and any field it actually
/// populated; optional fields the snapshot lacks keep their local value, so
/// reasoning and tool metadata attached during live streaming survive a
/// refresh that returned a thinner snapshot.
fn merge_pair(local: &TimelineEvent, fetched: &TimelineEvent) -> TimelineEvent {
    let mut out = fetched.clone();

    out.payload = match (&local.payload, &fetched.payload) {
        (
            EventPayload::AssistantMessage {
                text: local_text,
                reasoning: local_reasoning,
            },
            EventPayload::AssistantMessage { text, reasoning },
        ) => EventPayload::AssistantMessage {
            text: if text.is_empty() && !local_text.is_empty() {
                local_text.clone()
            } else {
                text.clone()
            },
            reasoning: reasoning.clone().or_else(|| local_reasoning.clone()),
        },
        (
            EventPayload::Observe {
                result: local_result,
                duration_ms: local_duration,
                ..
            },
            EventPayload::Observe {
                tool,
                result,
                is_error,
                duration_ms,
            },
        ) => EventPayload::Observe {
            tool: tool.clone(),
            result: if result.is_empty() && !local_result.is_empty() {
                local_result.clone()
            } else {
                result.clone()
            },
            is_error: *is_error,
            duration_ms: duration_ms.or(*local_duration),
        },
        (
            EventPayload::Act {
                arguments: local_args,
                ..
            },
            EventPayload::Act { tool, arguments },
        ) => EventPayload::Act {
            tool: tool.clone(),
            arguments: if arguments.is_null() && !local_args.is_null() {
                local_args.clone()
            } else {
                arguments.clone()
            },
        },
        (
            EventPayload::Reflection {
                verdict: local_verdict,
                ..
            },
            EventPayload::Reflection { text, verdict },
        ) => EventPayload::Reflection {
            text: text.clone(),
            verdict: verdict.clone().or_else(|| local_verdict.clone()),
        },
        // Different variants or nothing to enrich: the fetched copy stands.
        (_, fetched_payload) => fetched_payload.clone(),
    };

    out
}

/// Check the ascending-order invariant. Used by tests and debug assertions.
pub fn is_sorted(timeline: &[TimelineEvent]) -> bool {
    timeline.windows(2).all(|w| w[0].seq <= w[1].seq)
}
