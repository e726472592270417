//! Durable-history collaborator contract

use async_trait::async_trait;
use weft_protocol::{ConversationId, TimelinePage};

use crate::error::Result;

/// Fetches bounded windows of past events from durable storage.
///
/// `before` of `None` asks for the most recent `page_size` events; otherwise
/// events strictly older than the cursor. Responses report their boundary
/// cursors and whether more history exists before the window.
#[async_trait]
pub trait HistoryClient: Send + Sync {
    async fn fetch_timeline(
        &self,
        conversation: &ConversationId,
        page_size: usize,
        before: Option<u64>,
    ) -> Result<TimelinePage>;
}
