//! History fetch response shape

use serde::{Deserialize, Serialize};

use crate::event::TimelineEvent;

/// One bounded window of durable timeline events.
///
/// `first_cursor`/`last_cursor` are the ordering keys at the window boundary
/// (ascending). `has_more` is true while older events exist before
/// `first_cursor`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimelinePage {
    pub events: Vec<TimelineEvent>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub first_cursor: Option<u64>,
    #[serde(default)]
    pub last_cursor: Option<u64>,
}

impl TimelinePage {
    /// A page with no events and no further history.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Derive boundary cursors from the events themselves when the backend
    /// did not set them explicitly.
    pub fn first_seq(&self) -> Option<u64> {
        self.first_cursor
            .or_else(|| self.events.iter().map(|e| e.seq).min())
    }

    /// See [`TimelinePage::first_seq`].
    pub fn last_seq(&self) -> Option<u64> {
        self.last_cursor
            .or_else(|| self.events.iter().map(|e| e.seq).max())
    }
}
