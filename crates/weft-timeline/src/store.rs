//! Timeline store: the orchestrating container the UI layer talks to.
//!
//! All mutable per-conversation state lives here, keyed by conversation
//! identity, and every mutation flows through this store's single
//! serialized entry point (one mutex around the whole state map). Logical
//! concurrency between the push stream, history fetches, pagination, and
//! conversation switches interleaves freely; the merge algorithm keeps it
//! from ever reordering state incorrectly. Any operation resuming after an
//! await re-checks that its conversation still exists and discards the
//! resume otherwise.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use weft_protocol::{ConversationId, EventPayload, StreamEnvelope};

use crate::buffer::{Channel, DEFAULT_FLUSH_INTERVAL, DeltaBuffer};
use crate::conversation::{AgentPhase, ConversationState, StreamPhase};
use crate::error::{Error, Result};
use crate::history::HistoryClient;
use crate::merge::merge_events;
use crate::projector::{self, DisplayTurn};
use crate::router::{self, Effect};
use crate::transport::{StreamEventStream, Transport};

/// Default window size for initial and backward history loads.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Change notification delivered to store subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreUpdate {
    /// The named conversation's visible state changed
    Updated(ConversationId),
    /// The conversation was removed
    Removed(ConversationId),
}

struct StoreState {
    conversations: HashMap<ConversationId, ConversationState>,
    buffers: DeltaBuffer,
    /// The conversation currently displayed. A view pointer only: changing
    /// it never clears or pauses another conversation's streaming state.
    active: Option<ConversationId>,
}

impl StoreState {
    /// Get or lazily create the state for a conversation. Conversations
    /// come into being on first reference.
    fn conversation_mut(&mut self, id: &ConversationId) -> &mut ConversationState {
        self.conversations
            .entry(id.clone())
            .or_insert_with(|| ConversationState::new(id.clone()))
    }

    fn reproject(&mut self, id: &ConversationId) {
        if let Some(state) = self.conversations.get_mut(id) {
            state.messages =
                projector::project(&state.timeline, &state.stream_text, &state.stream_thought);
        }
    }
}

struct Inner {
    state: Mutex<StoreState>,
    transport: Arc<dyn Transport>,
    history: Arc<dyn HistoryClient>,
    update_tx: broadcast::Sender<StoreUpdate>,
    flush_interval: Duration,
    page_size: usize,
}

/// The timeline synchronization engine.
///
/// Cheap to clone; all clones share the same state. Constructed once by the
/// application root and handed to the transport pump and the UI layer.
#[derive(Clone)]
pub struct TimelineStore {
    inner: Arc<Inner>,
}

impl TimelineStore {
    pub fn new(transport: Arc<dyn Transport>, history: Arc<dyn HistoryClient>) -> Self {
        let (update_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(StoreState {
                    conversations: HashMap::new(),
                    buffers: DeltaBuffer::new(),
                    active: None,
                }),
                transport,
                history,
                update_tx,
                flush_interval: DEFAULT_FLUSH_INTERVAL,
                page_size: DEFAULT_PAGE_SIZE,
            }),
        }
    }

    /// Override the delta flush interval. Mostly for tests.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.flush_interval = interval;
        }
        self
    }

    /// Override the history window size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.page_size = page_size;
        }
        self
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.inner.update_tx.subscribe()
    }

    fn notify(&self, update: StoreUpdate) {
        let _ = self.inner.update_tx.send(update);
    }

    // ---- Conversation lifecycle ----

    /// Start a new conversation locally, before any server identity exists.
    /// The identity is generated client-side and never renamed.
    pub fn create_conversation(&self) -> ConversationId {
        let id = ConversationId::generate();
        {
            let mut state = self.inner.state.lock();
            state.conversation_mut(&id);
            if state.active.is_none() {
                state.active = Some(id.clone());
            }
        }
        self.notify(StoreUpdate::Updated(id.clone()));
        id
    }

    /// Known conversation identities.
    pub fn conversations(&self) -> Vec<ConversationId> {
        self.inner.state.lock().conversations.keys().cloned().collect()
    }

    /// Snapshot of one conversation's full state.
    pub fn conversation(&self, id: &ConversationId) -> Option<ConversationState> {
        self.inner.state.lock().conversations.get(id).cloned()
    }

    /// The display projection for one conversation.
    pub fn messages(&self, id: &ConversationId) -> Vec<DisplayTurn> {
        self.inner
            .state
            .lock()
            .conversations
            .get(id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    /// Change which conversation is displayed. A view-pointer move only.
    pub fn select(&self, id: &ConversationId) -> Result<()> {
        let mut state = self.inner.state.lock();
        if !state.conversations.contains_key(id) {
            return Err(Error::UnknownConversation(id.clone()));
        }
        state.active = Some(id.clone());
        Ok(())
    }

    /// The currently displayed conversation, if any.
    pub fn active(&self) -> Option<ConversationId> {
        self.inner.state.lock().active.clone()
    }

    /// Discard a conversation and everything it owns. Pending flush timers
    /// are cancelled so nothing fires after teardown.
    pub fn remove_conversation(&self, id: &ConversationId) {
        {
            let mut state = self.inner.state.lock();
            state.buffers.clear_conversation(id);
            state.conversations.remove(id);
            if state.active.as_ref() == Some(id) {
                state.active = None;
            }
        }
        self.notify(StoreUpdate::Removed(id.clone()));
    }

    // ---- Stream ingestion ----

    /// Consume a push stream until it ends, routing every event.
    pub async fn run(&self, mut stream: StreamEventStream) {
        while let Some(envelope) = stream.next().await {
            self.handle_event(envelope);
        }
    }

    /// Route one inbound event to its conversation. The single entry point
    /// for all stream-driven mutation.
    pub fn handle_event(&self, envelope: StreamEnvelope) {
        let conversation = envelope.conversation_id.clone();
        let changed = {
            let mut state = self.inner.state.lock();
            let conv = state.conversation_mut(&conversation);
            let outcome = router::handle(conv, &envelope.event, envelope.event_id.as_ref());

            for effect in outcome.effects {
                match effect {
                    Effect::Buffer { channel, fragment } => {
                        if let Some(token) =
                            state.buffers.accept(&conversation, channel, &fragment)
                        {
                            self.arm_flush(conversation.clone(), channel, token);
                        }
                    }
                    Effect::Discard { channel } => {
                        state.buffers.discard(&conversation, channel);
                    }
                    Effect::ClearBuffers => {
                        state.buffers.clear_conversation(&conversation);
                    }
                }
            }

            if outcome.changed {
                state.reproject(&conversation);
            }
            outcome.changed
        };

        if changed {
            self.notify(StoreUpdate::Updated(conversation));
        }
    }

    /// Arm the cancellable delayed flush for a freshly non-empty buffer.
    fn arm_flush(
        &self,
        conversation: ConversationId,
        channel: Channel,
        token: tokio_util::sync::CancellationToken,
    ) {
        let store = self.clone();
        let interval = self.inner.flush_interval;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(interval) => {
                    store.flush_channel(&conversation, channel);
                }
            }
        });
    }

    /// Emit the accumulated fragments for one channel as a single state
    /// mutation.
    fn flush_channel(&self, conversation: &ConversationId, channel: Channel) {
        let flushed = {
            let mut state = self.inner.state.lock();
            let Some(text) = state.buffers.take(conversation, channel) else {
                return;
            };
            // Conversation may have been torn down between arming and firing.
            let Some(conv) = state.conversations.get_mut(conversation) else {
                return;
            };
            match channel {
                Channel::Text => conv.stream_text.push_str(&text),
                Channel::Thought => conv.stream_thought.push_str(&text),
            }
            state.reproject(conversation);
            true
        };
        if flushed {
            self.notify(StoreUpdate::Updated(conversation.clone()));
        }
    }

    // ---- Outbound operations ----

    /// Submit a user message. Rejected with [`Error::SendInFlight`] only
    /// when this same conversation already has a send in flight; other
    /// conversations streaming never block it.
    pub async fn send(&self, id: &ConversationId, content: &str) -> Result<ConversationId> {
        {
            let mut state = self.inner.state.lock();
            let conv = state.conversation_mut(id);
            if conv.send_in_flight {
                return Err(Error::SendInFlight(id.clone()));
            }
            conv.send_in_flight = true;
            conv.aborted = false;
            conv.append(EventPayload::UserMessage {
                text: content.to_string(),
            });
            conv.agent_phase = AgentPhase::Thinking;
            state.reproject(id);
        }
        self.notify(StoreUpdate::Updated(id.clone()));

        let result = self.inner.transport.send(id, content).await;

        let mut state = self.inner.state.lock();
        let Some(conv) = state.conversations.get_mut(id) else {
            // Torn down while the send was in flight; nothing to apply.
            return result;
        };
        conv.send_in_flight = false;
        match result {
            Ok(confirmed) => {
                drop(state);
                self.notify(StoreUpdate::Updated(id.clone()));
                Ok(confirmed)
            }
            Err(e) => {
                conv.last_error = Some(e.to_string());
                conv.stream_phase = StreamPhase::Error;
                drop(state);
                self.notify(StoreUpdate::Updated(id.clone()));
                Err(e)
            }
        }
    }

    /// Abort the conversation's active turn. Local state flips to idle
    /// immediately; the transport signal is fire-and-forget. A deliberate
    /// abort is recorded distinctly and never populates the error field.
    pub fn abort(&self, id: &ConversationId) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if !state.conversations.contains_key(id) {
                return Err(Error::UnknownConversation(id.clone()));
            }
            state.buffers.clear_conversation(id);
            if let Some(conv) = state.conversations.get_mut(id) {
                conv.reset_streaming();
                conv.aborted = true;
            }
            state.reproject(id);
        }
        self.notify(StoreUpdate::Updated(id.clone()));

        let transport = Arc::clone(&self.inner.transport);
        let conversation = id.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.abort(&conversation).await {
                tracing::warn!(conversation = %conversation, "abort signal failed: {}", e);
            }
        });
        Ok(())
    }

    /// Resolve a pending decision request, returning its opaque payload for
    /// external approval handling. Answering a superseded or unknown
    /// request is a conflict, surfaced to the caller and never retried.
    pub fn respond_decision(
        &self,
        id: &ConversationId,
        request_id: &str,
    ) -> Result<serde_json::Value> {
        let payload = {
            let mut state = self.inner.state.lock();
            let conv = state
                .conversations
                .get_mut(id)
                .ok_or_else(|| Error::UnknownConversation(id.clone()))?;
            match conv.pending_decision.take() {
                Some(pending) if pending.request_id == request_id => {
                    conv.agent_phase = AgentPhase::Thinking;
                    pending.payload
                }
                Some(pending) => {
                    // Not ours: put it back.
                    let superseded = pending.request_id.clone();
                    conv.pending_decision = Some(pending);
                    return Err(Error::Conflict(format!(
                        "decision {request_id} superseded by {superseded}"
                    )));
                }
                None => {
                    return Err(Error::Conflict(format!(
                        "no pending decision for {request_id}"
                    )));
                }
            }
        };
        self.notify(StoreUpdate::Updated(id.clone()));
        Ok(payload)
    }

    // ---- History loading & pagination ----

    /// Load the most recent window of a conversation's history.
    ///
    /// With no live local activity this is a plain replace; otherwise the
    /// page is merged so locally streamed events survive.
    pub async fn load_initial(&self, id: &ConversationId) -> Result<()> {
        // Materialize the conversation up front so the UI can show it while
        // the fetch is outstanding.
        {
            let mut state = self.inner.state.lock();
            state.conversation_mut(id);
        }

        let page = match self
            .inner
            .history
            .fetch_timeline(id, self.inner.page_size, None)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                self.record_history_error(id, &e);
                return Err(e);
            }
        };

        let mut state = self.inner.state.lock();
        let Some(conv) = state.conversations.get_mut(id) else {
            // Removed while the fetch was outstanding.
            return Ok(());
        };

        let has_more = page.has_more;
        let mut events = page.events;
        if conv.has_live_activity() || !conv.timeline.is_empty() {
            events = merge_events(&conv.timeline, &events);
        } else {
            events.sort_by_key(|e| e.seq);
        }
        conv.install_timeline(events);
        conv.has_earlier = has_more;
        state.reproject(id);
        drop(state);

        self.notify(StoreUpdate::Updated(id.clone()));
        Ok(())
    }

    /// Fetch one window of events older than the earliest loaded one.
    ///
    /// Returns `Ok(false)` without issuing a request when there is no
    /// earliest cursor yet or a backward load is already in flight (the
    /// second caller is dropped, not queued).
    pub async fn load_earlier(&self, id: &ConversationId) -> Result<bool> {
        let before = {
            let mut state = self.inner.state.lock();
            let conv = state
                .conversations
                .get_mut(id)
                .ok_or_else(|| Error::UnknownConversation(id.clone()))?;
            let Some(earliest) = conv.earliest_seq else {
                return Ok(false);
            };
            if conv.loading_earlier {
                return Ok(false);
            }
            conv.loading_earlier = true;
            earliest
        };

        let fetched = self
            .inner
            .history
            .fetch_timeline(id, self.inner.page_size, Some(before))
            .await;

        let mut state = self.inner.state.lock();
        let Some(conv) = state.conversations.get_mut(id) else {
            // Removed while the fetch was outstanding; discard the resume.
            return Ok(false);
        };
        conv.loading_earlier = false;

        let page = match fetched {
            Ok(page) => page,
            Err(e) => {
                conv.last_error = Some(e.to_string());
                drop(state);
                self.notify(StoreUpdate::Updated(id.clone()));
                return Err(e);
            }
        };

        let has_more = page.has_more;
        let merged = merge_events(&conv.timeline, &page.events);
        conv.install_timeline(merged);
        conv.has_earlier = has_more;
        state.reproject(id);
        drop(state);

        self.notify(StoreUpdate::Updated(id.clone()));
        Ok(true)
    }

    /// Re-fetch the tail of history and merge it in. Never a replace:
    /// events streamed while disconnected may exist on either side.
    pub async fn refresh(&self, id: &ConversationId) -> Result<()> {
        let page = match self
            .inner
            .history
            .fetch_timeline(id, self.inner.page_size, None)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                self.record_history_error(id, &e);
                return Err(e);
            }
        };

        let mut state = self.inner.state.lock();
        let Some(conv) = state.conversations.get_mut(id) else {
            return Ok(());
        };
        let has_more = page.has_more;
        let had_earlier_window = conv.earliest_seq;
        let merged = merge_events(&conv.timeline, &page.events);
        conv.install_timeline(merged);
        // A tail fetch says nothing about history before an already-loaded
        // earlier window; only tighten has_earlier when this window reaches
        // further back than what we had.
        let reaches_back = match (page.first_seq(), had_earlier_window) {
            (_, None) => true,
            (Some(first), Some(earliest)) => first <= earliest,
            (None, Some(_)) => false,
        };
        if reaches_back {
            conv.has_earlier = has_more;
        }
        state.reproject(id);
        drop(state);

        self.notify(StoreUpdate::Updated(id.clone()));
        Ok(())
    }

    // ---- Connection lifecycle ----

    /// The push connection dropped: live flags fall, content stays.
    pub fn on_disconnected(&self) {
        let ids: Vec<ConversationId> = {
            let mut state = self.inner.state.lock();
            let mut touched = Vec::new();
            for (id, conv) in state.conversations.iter_mut() {
                if conv.is_streaming {
                    conv.is_streaming = false;
                    touched.push(id.clone());
                }
            }
            touched
        };
        for id in ids {
            self.notify(StoreUpdate::Updated(id));
        }
    }

    /// The push connection is back: events may have been missed, so the
    /// tail of every known conversation is re-fetched through the merge
    /// path rather than assuming continuity.
    pub async fn on_reconnected(&self) {
        let ids = self.conversations();
        for id in ids {
            if let Err(e) = self.refresh(&id).await {
                // Recorded on the conversation; unaffected ones continue.
                tracing::warn!(conversation = %id, "tail refresh after reconnect failed: {}", e);
            }
        }
    }

    fn record_history_error(&self, id: &ConversationId, error: &Error) {
        let mut state = self.inner.state.lock();
        if let Some(conv) = state.conversations.get_mut(id) {
            conv.last_error = Some(error.to_string());
            drop(state);
            self.notify(StoreUpdate::Updated(id.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use weft_protocol::{EventId, StreamEvent, TimelineEvent, TimelinePage};

    struct MockTransport {
        sends: Mutex<Vec<(ConversationId, String)>>,
        aborts: Mutex<Vec<ConversationId>>,
        gate: Option<Arc<tokio::sync::Notify>>,
        fail_sends: bool,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                sends: Mutex::new(vec![]),
                aborts: Mutex::new(vec![]),
                gate: None,
                fail_sends: false,
            }
        }

        fn gated(gate: Arc<tokio::sync::Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new()
            }
        }

        fn failing() -> Self {
            Self {
                fail_sends: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(
            &self,
            conversation: &ConversationId,
            content: &str,
        ) -> Result<ConversationId> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_sends {
                return Err(Error::Transport("connection lost".into()));
            }
            self.sends
                .lock()
                .push((conversation.clone(), content.to_string()));
            Ok(conversation.clone())
        }

        async fn abort(&self, conversation: &ConversationId) -> Result<()> {
            self.aborts.lock().push(conversation.clone());
            Ok(())
        }
    }

    struct MockHistory {
        /// Canned pages queued per (conversation, before-cursor); the last
        /// page registered for a key keeps serving repeat fetches.
        pages: Mutex<HashMap<(ConversationId, Option<u64>), Vec<TimelinePage>>>,
        calls: AtomicU32,
    }

    impl MockHistory {
        fn new() -> Self {
            Self {
                pages: Mutex::new(HashMap::new()),
                calls: AtomicU32::new(0),
            }
        }

        fn with_page(
            self,
            conversation: &ConversationId,
            before: Option<u64>,
            page: TimelinePage,
        ) -> Self {
            self.pages
                .lock()
                .entry((conversation.clone(), before))
                .or_default()
                .push(page);
            self
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl HistoryClient for MockHistory {
        async fn fetch_timeline(
            &self,
            conversation: &ConversationId,
            _page_size: usize,
            before: Option<u64>,
        ) -> Result<TimelinePage> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let mut pages = self.pages.lock();
            let page = match pages.get_mut(&(conversation.clone(), before)) {
                Some(queue) if queue.len() > 1 => queue.remove(0),
                Some(queue) => queue.first().cloned().unwrap_or_default(),
                None => TimelinePage::empty(),
            };
            Ok(page)
        }
    }

    fn persisted(id: &str, seq: u64, payload: EventPayload) -> TimelineEvent {
        TimelineEvent {
            id: EventId::from(id),
            seq,
            timestamp: seq as i64 * 1000,
            payload,
        }
    }

    fn user_event(id: &str, seq: u64, text: &str) -> TimelineEvent {
        persisted(id, seq, EventPayload::UserMessage { text: text.into() })
    }

    fn store_with(
        transport: MockTransport,
        history: MockHistory,
    ) -> (TimelineStore, Arc<MockTransport>, Arc<MockHistory>) {
        let transport = Arc::new(transport);
        let history = Arc::new(history);
        let store = TimelineStore::new(transport.clone(), history.clone())
            .with_flush_interval(Duration::from_millis(20));
        (store, transport, history)
    }

    fn envelope(id: &ConversationId, event: StreamEvent) -> StreamEnvelope {
        StreamEnvelope::new(id.clone(), event)
    }

    fn drain_updates(rx: &mut broadcast::Receiver<StoreUpdate>) -> Vec<StoreUpdate> {
        let mut updates = vec![];
        while let Ok(u) = rx.try_recv() {
            updates.push(u);
        }
        updates
    }

    #[tokio::test]
    async fn test_send_appends_local_user_event() {
        let (store, transport, _) = store_with(MockTransport::new(), MockHistory::new());
        let conv = store.create_conversation();

        let confirmed = store.send(&conv, "hello").await.unwrap();
        assert_eq!(confirmed, conv);
        assert_eq!(transport.sends.lock().len(), 1);

        let state = store.conversation(&conv).unwrap();
        assert!(!state.send_in_flight);
        assert_eq!(state.timeline.len(), 1);
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].text, "hello");
    }

    #[tokio::test]
    async fn test_send_rejected_while_same_conversation_in_flight() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let (store, _, _) = store_with(MockTransport::gated(gate.clone()), MockHistory::new());
        let conv = store.create_conversation();

        let first = tokio::spawn({
            let store = store.clone();
            let conv = conv.clone();
            async move { store.send(&conv, "first").await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let second = store.send(&conv, "second").await;
        assert!(matches!(second, Err(Error::SendInFlight(_))));

        gate.notify_one();
        first.await.unwrap().unwrap();

        // Guard released: a later send goes through.
        gate.notify_one();
        store.send(&conv, "third").await.unwrap();
    }

    #[tokio::test]
    async fn test_send_allowed_while_other_conversation_streams() {
        // Isolation: B mid-stream must not block or be disturbed by a send
        // on A.
        let (store, _, _) = store_with(MockTransport::new(), MockHistory::new());
        let a = store.create_conversation();
        let b = store.create_conversation();

        store.handle_event(envelope(&b, StreamEvent::TurnStart));
        store.handle_event(envelope(
            &b,
            StreamEvent::ToolStart {
                tool: "search".into(),
                arguments: serde_json::Value::Null,
            },
        ));
        let b_before = store.conversation(&b).unwrap();

        store.send(&a, "hi from a").await.unwrap();

        let b_after = store.conversation(&b).unwrap();
        assert!(b_after.is_streaming);
        assert_eq!(b_after.timeline.len(), b_before.timeline.len());
        assert_eq!(
            b_after.active_tool_calls.len(),
            b_before.active_tool_calls.len()
        );
    }

    #[tokio::test]
    async fn test_send_failure_is_conversation_scoped() {
        let (store, _, _) = store_with(MockTransport::failing(), MockHistory::new());
        let conv = store.create_conversation();
        let other = store.create_conversation();

        let result = store.send(&conv, "doomed").await;
        assert!(matches!(result, Err(Error::Transport(_))));

        let state = store.conversation(&conv).unwrap();
        assert!(state.last_error.is_some());
        assert_eq!(state.stream_phase, StreamPhase::Error);
        // Timeline keeps the local user event.
        assert_eq!(state.timeline.len(), 1);
        // The other conversation is untouched.
        assert!(store.conversation(&other).unwrap().last_error.is_none());
    }

    #[tokio::test]
    async fn test_buffer_bounds_mutations_to_one_per_interval() {
        let (store, _, _) = store_with(MockTransport::new(), MockHistory::new());
        let conv = store.create_conversation();
        let mut rx = store.subscribe();
        drain_updates(&mut rx);

        for i in 0..10 {
            store.handle_event(envelope(
                &conv,
                StreamEvent::TextDelta {
                    text: format!("f{i} "),
                },
            ));
        }
        // No state mutation yet: fragments only hit the buffer.
        assert!(drain_updates(&mut rx).is_empty());
        assert!(store.conversation(&conv).unwrap().stream_text.is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;

        let updates = drain_updates(&mut rx);
        assert_eq!(
            updates,
            vec![StoreUpdate::Updated(conv.clone())],
            "ten fragments inside one interval must flush as one mutation"
        );
        let state = store.conversation(&conv).unwrap();
        assert_eq!(
            state.stream_text,
            "f0 f1 f2 f3 f4 f5 f6 f7 f8 f9 "
        );
    }

    #[tokio::test]
    async fn test_terminal_override_discards_divergent_partial() {
        // Scenario 4: "Hel" + "lo" buffered, then an authoritative end with
        // "Hello world". The end-event content must win verbatim.
        let (store, _, _) = store_with(MockTransport::new(), MockHistory::new());
        let conv = store.create_conversation();

        store.handle_event(envelope(&conv, StreamEvent::TurnStart));
        store.handle_event(envelope(&conv, StreamEvent::TextDelta { text: "Hel".into() }));
        store.handle_event(envelope(&conv, StreamEvent::TextDelta { text: "lo".into() }));
        store.handle_event(envelope(
            &conv,
            StreamEvent::TextEnd {
                text: "Hello world".into(),
            },
        ));

        // Let any stale timer fire; it must find nothing to flush.
        tokio::time::sleep(Duration::from_millis(60)).await;

        let state = store.conversation(&conv).unwrap();
        assert!(state.stream_text.is_empty());
        let last = state.messages.last().unwrap();
        assert_eq!(last.text, "Hello world");
    }

    #[tokio::test]
    async fn test_load_initial_replaces_when_idle() {
        let conv = ConversationId::from("c1");
        let history = MockHistory::new().with_page(
            &conv,
            None,
            TimelinePage {
                events: vec![
                    user_event("u1", 1, "hi"),
                    persisted(
                        "a1",
                        2,
                        EventPayload::AssistantMessage {
                            text: "hello".into(),
                            reasoning: None,
                        },
                    ),
                ],
                has_more: false,
                first_cursor: Some(1),
                last_cursor: Some(2),
            },
        );
        let (store, _, _) = store_with(MockTransport::new(), history);

        store.load_initial(&conv).await.unwrap();
        let state = store.conversation(&conv).unwrap();
        assert_eq!(state.timeline.len(), 2);
        assert_eq!(state.earliest_seq, Some(1));
        assert_eq!(state.latest_seq, Some(2));
        assert!(!state.has_earlier);
        assert_eq!(state.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_merges_without_dropping_local_events() {
        // Scenario 1: persisted [seq1, seq2]; a local turn added three more
        // events not yet persisted; a background refresh returning only the
        // persisted pair must leave all five.
        let conv = ConversationId::from("c1");
        let page = TimelinePage {
            events: vec![
                user_event("u1", 1, "hi"),
                persisted(
                    "a1",
                    2,
                    EventPayload::AssistantMessage {
                        text: "hello".into(),
                        reasoning: None,
                    },
                ),
            ],
            has_more: false,
            first_cursor: Some(1),
            last_cursor: Some(2),
        };
        let history = MockHistory::new()
            .with_page(&conv, None, page.clone())
            .with_page(&conv, None, page);
        let (store, _, _) = store_with(MockTransport::new(), history);

        store.load_initial(&conv).await.unwrap();
        store.send(&conv, "how are you").await.unwrap();
        store.handle_event(envelope(
            &conv,
            StreamEvent::ToolStart {
                tool: "search".into(),
                arguments: serde_json::Value::Null,
            },
        ));
        store.handle_event(envelope(
            &conv,
            StreamEvent::ToolEnd {
                tool: Some("search".into()),
                result: "3 hits".into(),
                is_error: false,
            },
        ));
        assert_eq!(store.conversation(&conv).unwrap().timeline.len(), 5);

        store.refresh(&conv).await.unwrap();

        let state = store.conversation(&conv).unwrap();
        assert_eq!(state.timeline.len(), 5, "local-only events must survive");
        assert!(crate::merge::is_sorted(&state.timeline));
    }

    #[tokio::test]
    async fn test_load_earlier_prepends_older_window() {
        // Scenario 2: loaded window is seq 11..20; an older page brings
        // seq 1..3 with no more history behind it.
        let conv = ConversationId::from("c1");
        let history = MockHistory::new()
            .with_page(
                &conv,
                None,
                TimelinePage {
                    events: (11..=20).map(|s| user_event(&format!("u{s}"), s, "x")).collect(),
                    has_more: true,
                    first_cursor: Some(11),
                    last_cursor: Some(20),
                },
            )
            .with_page(
                &conv,
                Some(11),
                TimelinePage {
                    events: (1..=3).map(|s| user_event(&format!("u{s}"), s, "old")).collect(),
                    has_more: false,
                    first_cursor: Some(1),
                    last_cursor: Some(3),
                },
            );
        let (store, _, _) = store_with(MockTransport::new(), history);

        store.load_initial(&conv).await.unwrap();
        assert!(store.conversation(&conv).unwrap().has_earlier);

        let loaded = store.load_earlier(&conv).await.unwrap();
        assert!(loaded);

        let state = store.conversation(&conv).unwrap();
        assert_eq!(state.timeline.len(), 13);
        assert!(crate::merge::is_sorted(&state.timeline));
        assert_eq!(state.earliest_seq, Some(1));
        assert!(!state.has_earlier);
    }

    #[tokio::test]
    async fn test_load_earlier_noop_without_cursor() {
        let (store, _, history) = store_with(MockTransport::new(), MockHistory::new());
        let conv = store.create_conversation();
        let loaded = store.load_earlier(&conv).await.unwrap();
        assert!(!loaded);
        assert_eq!(history.call_count(), 0, "no request may be issued");
    }

    #[tokio::test]
    async fn test_abort_flips_idle_without_error() {
        let (store, transport, _) = store_with(MockTransport::new(), MockHistory::new());
        let conv = store.create_conversation();
        store.handle_event(envelope(&conv, StreamEvent::TurnStart));
        store.handle_event(envelope(
            &conv,
            StreamEvent::ToolStart {
                tool: "search".into(),
                arguments: serde_json::Value::Null,
            },
        ));

        store.abort(&conv).unwrap();

        let state = store.conversation(&conv).unwrap();
        assert!(!state.is_streaming);
        assert_eq!(state.stream_phase, StreamPhase::Idle);
        assert!(state.aborted);
        assert!(state.last_error.is_none(), "abort is not a failure");
        assert!(state.active_tool_calls.is_empty());

        // Fire-and-forget signal reaches the transport.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.aborts.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_conversation_cancels_pending_flush() {
        let (store, _, _) = store_with(MockTransport::new(), MockHistory::new());
        let conv = store.create_conversation();
        let mut rx = store.subscribe();
        drain_updates(&mut rx);

        store.handle_event(envelope(&conv, StreamEvent::TextDelta { text: "x".into() }));
        store.remove_conversation(&conv);

        tokio::time::sleep(Duration::from_millis(60)).await;

        let updates = drain_updates(&mut rx);
        assert_eq!(updates, vec![StoreUpdate::Removed(conv.clone())]);
        assert!(store.conversation(&conv).is_none());
    }

    #[tokio::test]
    async fn test_select_is_only_a_view_pointer_move() {
        let (store, _, _) = store_with(MockTransport::new(), MockHistory::new());
        let a = store.create_conversation();
        let b = store.create_conversation();
        store.handle_event(envelope(&b, StreamEvent::TurnStart));

        store.select(&a).unwrap();
        assert_eq!(store.active(), Some(a.clone()));
        assert!(store.conversation(&b).unwrap().is_streaming);

        store.select(&b).unwrap();
        assert_eq!(store.active(), Some(b));
    }

    #[tokio::test]
    async fn test_interleaved_streams_stay_isolated() {
        let (store, _, _) = store_with(MockTransport::new(), MockHistory::new());
        let a = store.create_conversation();
        let b = store.create_conversation();

        // One connection interleaves events for both conversations.
        store.handle_event(envelope(&a, StreamEvent::TurnStart));
        store.handle_event(envelope(&b, StreamEvent::TurnStart));
        store.handle_event(envelope(&a, StreamEvent::Thought { text: "for a".into() }));
        store.handle_event(envelope(&b, StreamEvent::Thought { text: "for b".into() }));
        store.handle_event(envelope(&a, StreamEvent::TurnComplete { text: Some("a done".into()) }));

        let a_state = store.conversation(&a).unwrap();
        let b_state = store.conversation(&b).unwrap();
        assert!(!a_state.is_streaming);
        assert!(b_state.is_streaming);
        assert_eq!(b_state.timeline.len(), 1);
        assert!(matches!(
            &b_state.timeline[0].payload,
            EventPayload::Thought { text } if text == "for b"
        ));
    }

    #[tokio::test]
    async fn test_reconnect_refreshes_tail_through_merge() {
        let conv = ConversationId::from("c1");
        let history = MockHistory::new().with_page(
            &conv,
            None,
            TimelinePage {
                events: vec![
                    user_event("u1", 1, "hi"),
                    persisted(
                        "a9",
                        9,
                        EventPayload::AssistantMessage {
                            text: "missed while offline".into(),
                            reasoning: None,
                        },
                    ),
                ],
                has_more: false,
                first_cursor: Some(1),
                last_cursor: Some(9),
            },
        );
        let (store, _, _) = store_with(MockTransport::new(), history);

        // Local state built while connected.
        store.handle_event(envelope(&conv, StreamEvent::TurnStart));
        store.handle_event(envelope(&conv, StreamEvent::Thought { text: "local".into() }));

        store.on_disconnected();
        assert!(!store.conversation(&conv).unwrap().is_streaming);

        store.on_reconnected().await;

        let state = store.conversation(&conv).unwrap();
        // Local thought plus both fetched events.
        assert_eq!(state.timeline.len(), 3);
        assert!(state.timeline.iter().any(|e| matches!(
            &e.payload,
            EventPayload::AssistantMessage { text, .. } if text == "missed while offline"
        )));
        assert!(state.timeline.iter().any(|e| matches!(
            &e.payload,
            EventPayload::Thought { text } if text == "local"
        )));
    }

    #[tokio::test]
    async fn test_redelivered_envelope_is_applied_once() {
        let (store, _, _) = store_with(MockTransport::new(), MockHistory::new());
        let conv = store.create_conversation();

        let delivery = envelope(
            &conv,
            StreamEvent::Thought {
                text: "checking".into(),
            },
        )
        .with_event_id(EventId::from("e1"));
        store.handle_event(delivery.clone());
        store.handle_event(delivery);

        let state = store.conversation(&conv).unwrap();
        assert_eq!(state.timeline.len(), 1);
        assert_eq!(state.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_without_explicit_cursors_still_settles_has_earlier() {
        // A backend may omit boundary cursors; the events themselves carry
        // the window boundary.
        let conv = ConversationId::from("c1");
        let history = MockHistory::new()
            .with_page(
                &conv,
                None,
                TimelinePage {
                    events: vec![user_event("u5", 5, "hi"), user_event("u6", 6, "again")],
                    has_more: true,
                    first_cursor: Some(5),
                    last_cursor: Some(6),
                },
            )
            .with_page(
                &conv,
                None,
                TimelinePage {
                    events: (1..=6).map(|s| user_event(&format!("u{s}"), s, "x")).collect(),
                    has_more: false,
                    first_cursor: None,
                    last_cursor: None,
                },
            );
        let (store, _, _) = store_with(MockTransport::new(), history);

        store.load_initial(&conv).await.unwrap();
        let state = store.conversation(&conv).unwrap();
        assert!(state.has_earlier);
        assert_eq!(state.earliest_seq, Some(5));

        store.refresh(&conv).await.unwrap();
        let state = store.conversation(&conv).unwrap();
        assert_eq!(state.timeline.len(), 6);
        assert!(!state.has_earlier, "a window reaching the loaded earliest event settles it");
    }

    #[tokio::test]
    async fn test_respond_decision_conflicts_on_mismatch() {
        let (store, _, _) = store_with(MockTransport::new(), MockHistory::new());
        let conv = store.create_conversation();
        store.handle_event(envelope(
            &conv,
            StreamEvent::DecisionRequest {
                request_id: "r2".into(),
                payload: serde_json::json!({"kind": "approve"}),
            },
        ));

        let stale = store.respond_decision(&conv, "r1");
        assert!(matches!(stale, Err(Error::Conflict(_))));
        // The pending decision survives a conflicting answer.
        assert!(store.conversation(&conv).unwrap().pending_decision.is_some());

        let payload = store.respond_decision(&conv, "r2").unwrap();
        assert_eq!(payload, serde_json::json!({"kind": "approve"}));
        assert!(store.conversation(&conv).unwrap().pending_decision.is_none());
    }

    #[tokio::test]
    async fn test_run_consumes_stream_to_completion() {
        let (store, _, _) = store_with(MockTransport::new(), MockHistory::new());
        let conv = ConversationId::from("c1");

        let events = vec![
            envelope(&conv, StreamEvent::TurnStart),
            envelope(&conv, StreamEvent::Thought { text: "hm".into() }),
            envelope(&conv, StreamEvent::TurnComplete { text: Some("done".into()) }),
        ];
        let stream: StreamEventStream = Box::pin(async_stream::stream! {
            for event in events {
                yield event;
            }
        });

        store.run(stream).await;

        let state = store.conversation(&conv).unwrap();
        assert!(!state.is_streaming);
        assert_eq!(state.messages.last().unwrap().text, "done");
    }
}
