//! Error types for weft-timeline

use thiserror::Error;
use weft_protocol::ConversationId;

/// Result type alias using weft-timeline Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while synchronizing a timeline.
///
/// Transport and history errors are recoverable and conversation-scoped:
/// they are recorded into the affected conversation's error field and never
/// disturb other conversations or the existing timeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection lost or a send failed
    #[error("transport error: {0}")]
    Transport(String),

    /// A history fetch failed; retried on the next user-triggered load
    #[error("history fetch failed: {0}")]
    HistoryFetch(String),

    /// An inbound event was missing a required field and was dropped
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// A response raced a supersede, e.g. a decision answered after it was
    /// replaced. Surfaced to the caller, never auto-retried.
    #[error("conflict: {0}")]
    Conflict(String),

    /// This conversation already has a send in flight
    #[error("a send is already in flight for conversation {0}")]
    SendInFlight(ConversationId),

    /// Operation referenced a conversation the store does not know
    #[error("unknown conversation: {0}")]
    UnknownConversation(ConversationId),
}
