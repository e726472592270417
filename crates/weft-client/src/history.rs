//! HTTP client for the durable timeline API

use async_trait::async_trait;
use weft_protocol::{ConversationId, TimelinePage};
use weft_timeline::{Error, HistoryClient, Result};

/// Fetches timeline windows over HTTP.
///
/// `GET {base}/conversations/{id}/timeline?limit=N[&before=C]`, responding
/// with a [`TimelinePage`].
pub struct HttpHistoryClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHistoryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn timeline_url(&self, conversation: &ConversationId, page_size: usize, before: Option<u64>) -> String {
        let mut url = format!(
            "{}/conversations/{}/timeline?limit={}",
            self.base_url, conversation, page_size
        );
        if let Some(cursor) = before {
            url.push_str(&format!("&before={cursor}"));
        }
        url
    }
}

#[async_trait]
impl HistoryClient for HttpHistoryClient {
    async fn fetch_timeline(
        &self,
        conversation: &ConversationId,
        page_size: usize,
        before: Option<u64>,
    ) -> Result<TimelinePage> {
        let url = self.timeline_url(conversation, page_size, before);
        tracing::debug!(conversation = %conversation, ?before, "fetching timeline window");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::HistoryFetch(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::HistoryFetch(format!(
                "server returned {}",
                response.status()
            )));
        }

        response
            .json::<TimelinePage>()
            .await
            .map_err(|e| Error::HistoryFetch(format!("malformed page: {e}")))
    }
}
