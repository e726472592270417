//! Transport collaborator contract

use std::pin::Pin;

use async_trait::async_trait;
use tokio_stream::Stream;
use weft_protocol::{ConversationId, StreamEnvelope};

use crate::error::Result;

/// A single ordered stream of typed events for one live connection. Events
/// for different conversations may be interleaved within it.
pub type StreamEventStream = Pin<Box<dyn Stream<Item = StreamEnvelope> + Send>>;

/// Outbound side of the push connection.
///
/// Handshake, reconnect, and backoff mechanics live behind this trait; the
/// engine only sends, aborts, and consumes the event stream.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit a user message for the given conversation. Returns the
    /// conversation identity the backend filed it under (the same identity:
    /// ids are client-generated and never renamed).
    async fn send(&self, conversation: &ConversationId, content: &str) -> Result<ConversationId>;

    /// Ask the backend to stop the conversation's active turn. Callers
    /// treat this as fire-and-forget.
    async fn abort(&self, conversation: &ConversationId) -> Result<()>;
}
