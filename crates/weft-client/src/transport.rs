//! SSE transport for the live push connection

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::Deserialize;
use weft_protocol::{ConversationId, StreamEnvelope};
use weft_timeline::{Error, Result, StreamEventStream, Transport};

/// Talks to the agent backend over HTTP for outbound operations and
/// server-sent events for the inbound push stream.
pub struct SseTransport {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct SendResponse {
    conversation_id: ConversationId,
}

impl SseTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Open the push connection and return the typed event stream.
    ///
    /// Malformed frames are dropped with a warning; they never tear the
    /// stream down. The stream ends when the connection does; reconnecting
    /// is the caller's concern.
    pub fn events(&self) -> Result<StreamEventStream> {
        let url = format!("{}/events", self.base_url);
        let request_builder = self.client.get(&url);
        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Transport(format!("failed to open event stream: {e}")))?;
        Ok(Box::pin(envelope_stream(event_source)))
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&self, conversation: &ConversationId, content: &str) -> Result<ConversationId> {
        let url = format!("{}/conversations/{}/messages", self.base_url, conversation);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("send failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "send rejected with {}",
                response.status()
            )));
        }

        let body = response
            .json::<SendResponse>()
            .await
            .map_err(|e| Error::Transport(format!("malformed send response: {e}")))?;
        Ok(body.conversation_id)
    }

    async fn abort(&self, conversation: &ConversationId) -> Result<()> {
        let url = format!("{}/conversations/{}/abort", self.base_url, conversation);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("abort failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "abort rejected with {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Decode one SSE data frame into a typed envelope. `None` drops the frame.
fn parse_envelope(data: &str) -> Option<StreamEnvelope> {
    match serde_json::from_str::<StreamEnvelope>(data) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            let error = Error::MalformedEvent(e.to_string());
            tracing::warn!("dropping stream event: {}", error);
            None
        }
    }
}

fn envelope_stream(mut event_source: EventSource) -> impl futures::Stream<Item = StreamEnvelope> {
    stream! {
        while let Some(event_result) = event_source.next().await {
            match event_result {
                Ok(Event::Open) => {}
                Ok(Event::Message(message)) => {
                    if let Some(envelope) = parse_envelope(&message.data) {
                        yield envelope;
                    }
                }
                Err(e) => {
                    tracing::warn!("event stream closed: {}", e);
                    break;
                }
            }
        }
    }
}
