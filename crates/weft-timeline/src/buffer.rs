//! Delta buffer: bounds the update rate of high-frequency partial-content
//! channels (streamed text, streamed reasoning) to one state mutation per
//! flush interval, independent of inbound event rate.

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use weft_protocol::ConversationId;

/// Default flush interval: at most one mutation per channel per ~50ms.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(50);

/// The partial-content channels subject to rate bounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Text,
    Thought,
}

struct Slot {
    buf: String,
    /// Cancels the armed delayed flush for this slot
    timer: CancellationToken,
}

/// Per-(conversation, channel) fragment accumulation.
///
/// The buffer itself is passive: `accept` reports when a delayed flush needs
/// arming and hands back the token guarding it; the store owns the actual
/// timer task. Terminal events and conversation teardown cancel the token,
/// so a stale flush can never fire after the slot is gone.
#[derive(Default)]
pub struct DeltaBuffer {
    slots: HashMap<(ConversationId, Channel), Slot>,
}

impl DeltaBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment. Returns `Some(token)` when this was the first
    /// fragment after an empty buffer and a delayed flush must be armed;
    /// `None` while a flush is already pending.
    pub fn accept(
        &mut self,
        conversation: &ConversationId,
        channel: Channel,
        fragment: &str,
    ) -> Option<CancellationToken> {
        let key = (conversation.clone(), channel);
        match self.slots.get_mut(&key) {
            Some(slot) => {
                slot.buf.push_str(fragment);
                None
            }
            None => {
                let timer = CancellationToken::new();
                self.slots.insert(
                    key,
                    Slot {
                        buf: fragment.to_string(),
                        timer: timer.clone(),
                    },
                );
                Some(timer)
            }
        }
    }

    /// Take the accumulated string and disarm the timer. Called by the
    /// flush itself and by terminal events that force one.
    pub fn take(&mut self, conversation: &ConversationId, channel: Channel) -> Option<String> {
        let slot = self.slots.remove(&(conversation.clone(), channel))?;
        slot.timer.cancel();
        Some(slot.buf)
    }

    /// Drop buffered content for one channel without emitting it. Used when
    /// an authoritative value supersedes the partial.
    pub fn discard(&mut self, conversation: &ConversationId, channel: Channel) {
        if let Some(slot) = self.slots.remove(&(conversation.clone(), channel)) {
            slot.timer.cancel();
        }
    }

    /// Cancel and drop every buffer for a conversation. Must run on
    /// teardown or reset so no stale flush fires afterwards.
    pub fn clear_conversation(&mut self, conversation: &ConversationId) {
        self.slots.retain(|(conv, _), slot| {
            if conv == conversation {
                slot.timer.cancel();
                false
            } else {
                true
            }
        });
    }

    /// Whether a flush is currently armed for this slot.
    pub fn is_armed(&self, conversation: &ConversationId, channel: Channel) -> bool {
        self.slots
            .contains_key(&(conversation.clone(), channel))
    }
}
