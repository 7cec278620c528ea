//! Streaming Session Controller: at most one generation per conversation, with cancel
//! and commit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arbor_llm::{
    CompletionProvider, CompletionRequest, ProviderMessage, ProviderStreamHandle,
    StreamEventPayload,
};
use arc_swap::ArcSwap;
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{
    ConcurrentStreamSnafu, EngineError, EngineResult, InvalidStateSnafu, NotFoundSnafu,
    ProviderSnafu, ProviderStreamSnafu,
};
use crate::message::{
    ContentPart, Conversation, ConversationId, Message, MessageId, Role, StreamSessionId,
};
use crate::observer::{Observers, Subscription};
use crate::service::ConversationService;
use crate::stream_state::{
    StreamPhase, StreamState, StreamTarget, StreamTransition, StreamTransitionResult,
};
use crate::tree;

/// Provider selection and sampling knobs for new sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub provider_id: String,
    /// Empty means the provider's default model.
    pub model_id: String,
    /// `false` waits for the whole reply and emits no deltas.
    pub stream: bool,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            provider_id: String::new(),
            model_id: String::new(),
            stream: true,
            temperature: None,
            max_tokens: None,
        }
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum StreamOutcome {
    Committed(Message),
    Cancelled,
    Failed(EngineError),
}

impl StreamOutcome {
    pub fn message(&self) -> Option<&Message> {
        match self {
            Self::Committed(message) => Some(message),
            Self::Cancelled | Self::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&EngineError> {
        match self {
            Self::Failed(error) => Some(error),
            Self::Committed(_) | Self::Cancelled => None,
        }
    }
}

/// Session lifecycle notifications. Deltas carry the conversation snapshot with the
/// partially filled placeholder.
pub trait StreamListener: Send + Sync {
    fn on_stream_start(&self, _target: StreamTarget) {}
    fn on_stream_delta(&self, _target: StreamTarget, _conversation: &Conversation) {}
    fn on_stream_end(&self, _target: StreamTarget, _outcome: &StreamOutcome) {}
}

struct SessionSlot {
    state: StreamState,
    cancel: CancellationToken,
}

struct ControllerInner {
    service: Arc<ConversationService>,
    provider: Arc<dyn CompletionProvider>,
    options: ArcSwap<CompletionOptions>,
    sessions: Mutex<HashMap<ConversationId, SessionSlot>>,
    next_session: AtomicU64,
    listeners: Observers<dyn StreamListener>,
}

impl ControllerInner {
    fn transition(&self, transition: StreamTransition) -> StreamTransitionResult {
        let target = match transition {
            StreamTransition::Start(target)
            | StreamTransition::Complete(target)
            | StreamTransition::Cancel(target)
            | StreamTransition::Settle(target) => target,
        };
        let mut sessions = lock(&self.sessions);
        let current = sessions
            .get(&target.conversation_id)
            .map(|slot| slot.state)
            .unwrap_or_default();
        let next = current.apply(transition)?;
        if next == StreamState::Idle {
            sessions.remove(&target.conversation_id);
        } else if let Some(slot) = sessions.get_mut(&target.conversation_id) {
            slot.state = next;
        }
        Ok(next)
    }

    fn accepts(&self, target: StreamTarget) -> bool {
        lock(&self.sessions)
            .get(&target.conversation_id)
            .is_some_and(|slot| slot.state.accepts_stream_event(target))
    }

    /// Moves a live session to `Cancelling` and fires its token.
    fn cancel(&self, target: StreamTarget) -> bool {
        let mut sessions = lock(&self.sessions);
        let Some(slot) = sessions.get_mut(&target.conversation_id) else {
            return false;
        };
        match slot.state.apply(StreamTransition::Cancel(target)) {
            Ok(next) => {
                slot.state = next;
                slot.cancel.cancel();
                true
            }
            Err(rejection) => {
                tracing::debug!(
                    conversation_id = %target.conversation_id,
                    session_id = %target.session_id,
                    ?rejection,
                    "cancel ignored"
                );
                false
            }
        }
    }
}

#[derive(Clone)]
pub struct StreamingController {
    inner: Arc<ControllerInner>,
}

impl StreamingController {
    /// Sessions run on the ambient tokio runtime.
    pub fn new(
        service: Arc<ConversationService>,
        provider: Arc<dyn CompletionProvider>,
        options: CompletionOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                service,
                provider,
                options: ArcSwap::from_pointee(options),
                sessions: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                listeners: Observers::new(),
            }),
        }
    }

    /// Options used by the next session.
    pub fn options(&self) -> Arc<CompletionOptions> {
        self.inner.options.load_full()
    }

    /// Applies to sessions started afterwards.
    pub fn set_options(&self, options: CompletionOptions) {
        self.inner.options.store(Arc::new(options));
    }

    /// Listeners hear about every session in every conversation.
    pub fn subscribe(&self, listener: Arc<dyn StreamListener>) -> Subscription {
        self.inner.listeners.subscribe(listener)
    }

    /// `Idle` when the conversation has no session.
    pub fn phase(&self, conversation_id: ConversationId) -> StreamPhase {
        lock(&self.inner.sessions)
            .get(&conversation_id)
            .map_or(StreamPhase::Idle, |slot| slot.state.phase())
    }

    pub fn is_streaming(&self, conversation_id: ConversationId) -> bool {
        self.phase(conversation_id) != StreamPhase::Idle
    }

    /// Appends a user turn and streams the reply to it.
    pub async fn send(
        &self,
        conversation_id: ConversationId,
        content: Vec<ContentPart>,
    ) -> EngineResult<StreamHandle> {
        let reservation = self.reserve(conversation_id, "send")?;
        let (_, user_message) = self
            .inner
            .service
            .append_user_turn(conversation_id, content)
            .await?;
        self.launch(reservation, user_message.id).await
    }

    /// Streams a reply to the current leaf.
    pub async fn start(&self, conversation_id: ConversationId) -> EngineResult<StreamHandle> {
        let stage = "start";
        let reservation = self.reserve(conversation_id, stage)?;
        let conversation = self.inner.service.get_conversation(conversation_id).await?;
        let leaf_id = conversation.current_leaf().context(InvalidStateSnafu {
            stage,
            details: "conversation has no messages to reply to",
        })?;
        self.launch(reservation, leaf_id).await
    }

    /// Branches an edited user turn and streams the reply to it.
    pub async fn resend_edited(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        content: Vec<ContentPart>,
    ) -> EngineResult<StreamHandle> {
        let reservation = self.reserve(conversation_id, "resend-edited")?;
        let (_, edited) = self
            .inner
            .service
            .edit_user_turn(conversation_id, message_id, content)
            .await?;
        self.launch(reservation, edited.id).await
    }

    /// Streams an alternative to an assistant message, as its new sibling.
    pub async fn regenerate(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> EngineResult<StreamHandle> {
        let stage = "regenerate";
        let reservation = self.reserve(conversation_id, stage)?;
        let conversation = self.inner.service.get_conversation(conversation_id).await?;
        let target = conversation.message(message_id).context(NotFoundSnafu {
            stage,
            entity: "message",
            id: message_id.to_string(),
        })?;
        ensure!(
            target.role == Role::Assistant && !target.is_pending(),
            InvalidStateSnafu {
                stage,
                details: format!("message '{message_id}' is not a committed assistant reply"),
            }
        );
        let father_id = target.parent_id.context(InvalidStateSnafu {
            stage,
            details: format!("message '{message_id}' has no parent"),
        })?;
        self.launch(reservation, father_id).await
    }

    /// Cancels the conversation's live session. `false` when there is none or it is
    /// already committing.
    pub fn stop(&self, conversation_id: ConversationId) -> bool {
        let target = lock(&self.inner.sessions)
            .get(&conversation_id)
            .and_then(|slot| slot.state.active_target());
        target.is_some_and(|target| self.inner.cancel(target))
    }

    fn reserve(&self, conversation_id: ConversationId, stage: &'static str) -> EngineResult<Reservation> {
        let mut sessions = lock(&self.inner.sessions);
        ensure!(
            !sessions.contains_key(&conversation_id),
            ConcurrentStreamSnafu {
                stage,
                conversation_id,
            }
        );

        let session_id = StreamSessionId::new(self.inner.next_session.fetch_add(1, Ordering::SeqCst));
        let target = StreamTarget::new(conversation_id, session_id);
        let state = StreamState::Idle
            .apply(StreamTransition::Start(target))
            .map_err(|rejection| EngineError::InvalidState {
                stage,
                details: format!("{rejection:?}"),
            })?;
        let cancel = CancellationToken::new();
        sessions.insert(
            conversation_id,
            SessionSlot {
                state,
                cancel: cancel.clone(),
            },
        );

        Ok(Reservation {
            inner: Arc::clone(&self.inner),
            target,
            cancel,
            armed: true,
        })
    }

    async fn launch(&self, mut reservation: Reservation, father_id: MessageId) -> EngineResult<StreamHandle> {
        let target = reservation.target;
        let conversation_id = target.conversation_id;
        let inner = &self.inner;

        let (snapshot, placeholder) = inner
            .service
            .attach_pending(conversation_id, father_id, target.session_id)
            .await?;
        let options = inner.options.load_full();
        let request = build_request(&snapshot, father_id, target.session_id, &options, inner.provider.as_ref());

        let source = if options.stream {
            match inner.provider.stream_complete(request) {
                Ok(handle) => SessionSource::Stream(handle),
                Err(source) => {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        session_id = %target.session_id,
                        error = %source,
                        "provider refused to open a stream"
                    );
                    if let Err(cleanup) = inner.service.discard_pending(conversation_id).await {
                        tracing::warn!(
                            conversation_id = %conversation_id,
                            error = %cleanup,
                            "failed to drop streaming placeholder"
                        );
                    }
                    return Err(source).context(ProviderSnafu {
                        stage: "open-provider-stream",
                    });
                }
            }
        } else {
            SessionSource::Complete(request)
        };

        let session = Session {
            inner: Arc::clone(inner),
            target,
            father_id,
            placeholder_id: placeholder.id,
            cancel: reservation.cancel.clone(),
        };
        reservation.armed = false;

        tracing::debug!(
            conversation_id = %conversation_id,
            session_id = %target.session_id,
            father_id = %father_id,
            streaming = options.stream,
            "stream session started"
        );
        inner.listeners.notify(|listener| listener.on_stream_start(target));

        let (outcome_tx, outcome_rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = session.run(source).await;
            let _ = outcome_tx.send(outcome);
        });

        Ok(StreamHandle {
            inner: Arc::clone(inner),
            target,
            placeholder_id: placeholder.id,
            outcome: outcome_rx,
        })
    }
}

/// Caller-side view of one running session.
pub struct StreamHandle {
    inner: Arc<ControllerInner>,
    target: StreamTarget,
    placeholder_id: MessageId,
    outcome: oneshot::Receiver<StreamOutcome>,
}

impl StreamHandle {
    pub fn target(&self) -> StreamTarget {
        self.target
    }

    /// Id of the transient placeholder; the committed reply gets a fresh id.
    pub fn placeholder_id(&self) -> MessageId {
        self.placeholder_id
    }

    /// Same as [`StreamingController::stop`] but scoped to this session.
    pub fn cancel(&self) -> bool {
        self.inner.cancel(self.target)
    }

    /// Resolves once the session has settled and its slot is free again.
    pub async fn outcome(self) -> StreamOutcome {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => StreamOutcome::Failed(EngineError::InvalidState {
                stage: "await-outcome",
                details: "stream session ended without reporting".to_string(),
            }),
        }
    }
}

/// Claimed session slot; released on drop unless handed to a running session.
struct Reservation {
    inner: Arc<ControllerInner>,
    target: StreamTarget,
    cancel: CancellationToken,
    armed: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.inner.transition(StreamTransition::Settle(self.target));
        }
    }
}

enum SessionSource {
    Stream(ProviderStreamHandle),
    Complete(CompletionRequest),
}

enum Flow {
    Completed(String),
    Cancelled,
    Failed(EngineError),
}

struct Session {
    inner: Arc<ControllerInner>,
    target: StreamTarget,
    father_id: MessageId,
    placeholder_id: MessageId,
    cancel: CancellationToken,
}

impl Session {
    async fn run(self, source: SessionSource) -> StreamOutcome {
        let flow = match source {
            SessionSource::Stream(handle) => self.drive_stream(handle).await,
            SessionSource::Complete(request) => self.drive_completion(request).await,
        };
        let outcome = self.finish(flow).await;

        if let Err(rejection) = self.inner.transition(StreamTransition::Settle(self.target)) {
            tracing::warn!(
                conversation_id = %self.target.conversation_id,
                session_id = %self.target.session_id,
                ?rejection,
                "session slot was already released"
            );
        }
        match &outcome {
            StreamOutcome::Committed(message) => tracing::debug!(
                conversation_id = %self.target.conversation_id,
                session_id = %self.target.session_id,
                message_id = %message.id,
                "stream session committed"
            ),
            StreamOutcome::Cancelled => tracing::debug!(
                conversation_id = %self.target.conversation_id,
                session_id = %self.target.session_id,
                "stream session cancelled"
            ),
            StreamOutcome::Failed(error) => tracing::warn!(
                conversation_id = %self.target.conversation_id,
                session_id = %self.target.session_id,
                error = %error,
                "stream session failed"
            ),
        }
        self.inner
            .listeners
            .notify(|listener| listener.on_stream_end(self.target, &outcome));
        outcome
    }

    async fn drive_stream(&self, handle: ProviderStreamHandle) -> Flow {
        let ProviderStreamHandle { mut stream, worker } = handle;
        tokio::spawn(worker);
        let conversation_id = self.target.conversation_id;
        let mut text = String::new();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    stream.cancel();
                    return Flow::Cancelled;
                }
                event = stream.recv() => {
                    let Some(event) = event else {
                        return Flow::Failed(EngineError::ProviderStream {
                            stage: "stream-recv",
                            details: "provider stream closed before completing".to_string(),
                        });
                    };
                    if event.target != self.target.session_id || !self.inner.accepts(self.target) {
                        tracing::debug!(
                            conversation_id = %conversation_id,
                            session_id = %self.target.session_id,
                            event_session_id = %event.target,
                            "ignoring stale stream event"
                        );
                        continue;
                    }

                    match event.payload {
                        StreamEventPayload::Delta(delta) => {
                            if delta.is_empty() {
                                continue;
                            }
                            text.push_str(&delta);
                            match self
                                .inner
                                .service
                                .apply_pending_delta(conversation_id, self.placeholder_id, &delta)
                                .await
                            {
                                Ok(snapshot) => self
                                    .inner
                                    .listeners
                                    .notify(|listener| listener.on_stream_delta(self.target, &snapshot)),
                                Err(error) => {
                                    stream.cancel();
                                    return Flow::Failed(error);
                                }
                            }
                        }
                        StreamEventPayload::ReasoningDelta(reasoning) => {
                            tracing::trace!(
                                session_id = %self.target.session_id,
                                reasoning_len = reasoning.len(),
                                "reasoning delta"
                            );
                        }
                        StreamEventPayload::Done => return Flow::Completed(text),
                        StreamEventPayload::Error(details) => {
                            return Flow::Failed(EngineError::ProviderStream {
                                stage: "stream-event",
                                details,
                            });
                        }
                    }
                }
            }
        }
    }

    async fn drive_completion(&self, request: CompletionRequest) -> Flow {
        let provider = Arc::clone(&self.inner.provider);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Flow::Cancelled,
            result = provider.complete(request) => match result {
                Ok(text) => Flow::Completed(text),
                Err(source) => Flow::Failed(EngineError::Provider {
                    stage: "complete",
                    source,
                }),
            },
        }
    }

    async fn finish(&self, flow: Flow) -> StreamOutcome {
        let stage = "commit-session";
        let conversation_id = self.target.conversation_id;

        let text = match flow {
            Flow::Cancelled => {
                let _ = self.inner.transition(StreamTransition::Cancel(self.target));
                self.discard_placeholder().await;
                return StreamOutcome::Cancelled;
            }
            Flow::Failed(error) => {
                self.discard_placeholder().await;
                return StreamOutcome::Failed(error);
            }
            Flow::Completed(text) => text,
        };

        if self
            .inner
            .transition(StreamTransition::Complete(self.target))
            .is_err()
        {
            // stop() won the race against the final event.
            self.discard_placeholder().await;
            return StreamOutcome::Cancelled;
        }

        if text.trim().is_empty() {
            self.discard_placeholder().await;
            return StreamOutcome::Failed(
                ProviderStreamSnafu {
                    stage,
                    details: "provider returned an empty completion",
                }
                .build(),
            );
        }

        let message = Message::new(
            conversation_id,
            Role::Assistant,
            vec![ContentPart::text(text)],
            Some(self.father_id),
        );
        let message_id = message.id;
        match self
            .inner
            .service
            .commit_assistant_turn(conversation_id, self.father_id, message.clone())
            .await
        {
            Ok(conversation) => {
                StreamOutcome::Committed(conversation.message(message_id).cloned().unwrap_or(message))
            }
            Err(EngineError::Storage { source, .. }) => {
                self.discard_placeholder().await;
                StreamOutcome::Failed(EngineError::UnsavedResponse {
                    stage,
                    message: Box::new(message),
                    source,
                })
            }
            Err(error) => {
                self.discard_placeholder().await;
                StreamOutcome::Failed(error)
            }
        }
    }

    async fn discard_placeholder(&self) {
        if let Err(error) = self
            .inner
            .service
            .discard_pending(self.target.conversation_id)
            .await
        {
            tracing::warn!(
                conversation_id = %self.target.conversation_id,
                session_id = %self.target.session_id,
                error = %error,
                "failed to drop streaming placeholder"
            );
        }
    }
}

/// Provider prompt: the committed ancestry of `father_id`, root first.
fn build_request(
    conversation: &Conversation,
    father_id: MessageId,
    session_id: StreamSessionId,
    options: &CompletionOptions,
    provider: &dyn CompletionProvider,
) -> CompletionRequest {
    let messages = tree::lineage(conversation, father_id)
        .into_iter()
        .filter(|message| !message.is_pending())
        .map(|message| ProviderMessage::new(message.role.into(), message.rendered_content()))
        .collect::<Vec<_>>();

    let model_id = match options.model_id.trim() {
        "" => provider.default_model(),
        model_id => model_id,
    };
    let provider_id = match options.provider_id.trim() {
        "" => provider.id(),
        provider_id => provider_id,
    };

    let mut request =
        CompletionRequest::new(session_id, model_id, messages).with_provider_id(provider_id);
    if let Some(temperature) = options.temperature {
        request = request.with_temperature(temperature);
    }
    if let Some(max_tokens) = options.max_tokens {
        request = request.with_max_tokens(max_tokens);
    }
    request
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use arbor_llm::{ScriptStep, ScriptedProvider};
    use tokio::sync::mpsc;

    use super::*;
    use crate::error::ErrorKind;
    use crate::test_support::{FlakyStorage, ready_service};

    struct Recorder {
        deltas: mpsc::UnboundedSender<String>,
        ends: mpsc::UnboundedSender<StreamTarget>,
    }

    impl StreamListener for Recorder {
        fn on_stream_delta(&self, target: StreamTarget, conversation: &Conversation) {
            let partial = conversation
                .pending_message()
                .filter(|message| message.status == crate::message::MessageStatus::Pending(target.session_id))
                .map(Message::text)
                .unwrap_or_default();
            let _ = self.deltas.send(partial);
        }

        fn on_stream_end(&self, target: StreamTarget, _outcome: &StreamOutcome) {
            let _ = self.ends.send(target);
        }
    }

    struct Harness {
        controller: StreamingController,
        service: Arc<ConversationService>,
        storage: Arc<FlakyStorage>,
        provider: Arc<ScriptedProvider>,
        conversation: Conversation,
        deltas: mpsc::UnboundedReceiver<String>,
        ends: mpsc::UnboundedReceiver<StreamTarget>,
        _subscription: Subscription,
    }

    async fn harness(options: CompletionOptions) -> Harness {
        let (service, storage) = ready_service().await;
        let provider = Arc::new(ScriptedProvider::new());
        let controller = StreamingController::new(service.clone(), provider.clone(), options);
        let (delta_tx, deltas) = mpsc::unbounded_channel();
        let (end_tx, ends) = mpsc::unbounded_channel();
        let subscription = controller.subscribe(Arc::new(Recorder {
            deltas: delta_tx,
            ends: end_tx,
        }));
        let conversation = service.create_conversation("t", None).await.expect("created");

        Harness {
            controller,
            service,
            storage,
            provider,
            conversation,
            deltas,
            ends,
            _subscription: subscription,
        }
    }

    fn streaming() -> CompletionOptions {
        CompletionOptions {
            provider_id: "scripted".to_string(),
            ..CompletionOptions::default()
        }
    }

    fn text(value: &str) -> Vec<ContentPart> {
        vec![ContentPart::text(value)]
    }

    async fn settle(handle: StreamHandle) -> StreamOutcome {
        tokio::time::timeout(Duration::from_secs(5), handle.outcome())
            .await
            .expect("session settles")
    }

    fn path_texts(conversation: &Conversation) -> Vec<String> {
        tree::visible_path(conversation)
            .into_iter()
            .map(Message::text)
            .collect()
    }

    impl Harness {
        async fn current(&self) -> Conversation {
            self.service
                .get_conversation(self.conversation.id)
                .await
                .expect("conversation")
        }

        async fn exchange(&mut self, question: &str, answer: &str) -> Message {
            self.provider.push_deltas([answer]);
            let handle = self
                .controller
                .send(self.conversation.id, text(question))
                .await
                .expect("send starts");
            match settle(handle).await {
                StreamOutcome::Committed(message) => message,
                other => panic!("expected a committed reply, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn send_streams_deltas_and_commits_the_reply() {
        let mut harness = harness(streaming()).await;
        harness.provider.push_deltas(["H", "i"]);

        let handle = harness
            .controller
            .send(harness.conversation.id, text("Hello"))
            .await
            .expect("send starts");
        assert_eq!(harness.controller.phase(harness.conversation.id), StreamPhase::Streaming);
        let placeholder_id = handle.placeholder_id();

        let outcome = settle(handle).await;
        let StreamOutcome::Committed(reply) = outcome else {
            panic!("expected commit, got {outcome:?}");
        };
        assert_eq!(reply.text(), "Hi");
        assert_ne!(reply.id, placeholder_id);
        assert!(!reply.is_pending());

        assert_eq!(harness.deltas.recv().await.as_deref(), Some("H"));
        assert_eq!(harness.deltas.recv().await.as_deref(), Some("Hi"));
        assert!(harness.ends.recv().await.is_some());

        let conversation = harness.current().await;
        assert_eq!(path_texts(&conversation), vec!["Hello", "Hi"]);
        assert!(!conversation.has_pending());
        assert!(!harness.controller.is_streaming(harness.conversation.id));
        assert_eq!(harness.storage.inner().message_count().await, 3);

        let request = harness.provider.requests().pop().expect("request sent");
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[1].content, "Hello");
        assert_eq!(request.provider_id, "scripted");
        assert_eq!(request.model_id, "scripted-model");
    }

    #[tokio::test]
    async fn regenerate_adds_an_active_sibling() {
        let mut harness = harness(streaming()).await;
        let first = harness.exchange("Hello", "Hi").await;
        let user_id = first.parent_id.expect("user turn");

        harness.provider.push_deltas(["Hey"]);
        let handle = harness
            .controller
            .regenerate(harness.conversation.id, first.id)
            .await
            .expect("regenerate starts");
        let StreamOutcome::Committed(second) = settle(handle).await else {
            panic!("regeneration should commit");
        };

        let conversation = harness.current().await;
        let user = conversation.message(user_id).expect("user");
        assert_eq!(user.child_ids, vec![first.id, second.id]);
        assert_eq!(user.active_child, Some(1));
        assert_eq!(path_texts(&conversation), vec!["Hello", "Hey"]);

        let request = harness.provider.requests().pop().expect("request");
        assert_eq!(request.messages.last().map(|m| m.content.as_str()), Some("Hello"));
    }

    #[tokio::test]
    async fn regenerating_a_user_turn_is_rejected() {
        let mut harness = harness(streaming()).await;
        let reply = harness.exchange("Hello", "Hi").await;
        let user_id = reply.parent_id.expect("user");

        let error = harness
            .controller
            .regenerate(harness.conversation.id, user_id)
            .await
            .err()
            .expect("user turns cannot be regenerated");
        assert_eq!(error.kind(), ErrorKind::InvalidState);
        assert!(!harness.controller.is_streaming(harness.conversation.id));
    }

    #[tokio::test]
    async fn resend_edited_branches_the_user_turn() {
        let mut harness = harness(streaming()).await;
        let reply = harness.exchange("Hello", "Hi").await;
        let user_id = reply.parent_id.expect("user");

        harness.provider.push_deltas(["General Kenobi"]);
        let handle = harness
            .controller
            .resend_edited(harness.conversation.id, user_id, text("Hello there"))
            .await
            .expect("resend starts");
        assert!(settle(handle).await.message().is_some());

        let conversation = harness.current().await;
        let root = conversation.root().expect("root");
        assert_eq!(root.child_ids.len(), 2);
        assert_eq!(root.active_child, Some(1));
        assert_eq!(path_texts(&conversation), vec!["Hello there", "General Kenobi"]);
        assert!(conversation.message(user_id).is_some());
        assert!(conversation.message(reply.id).is_some());
    }

    #[tokio::test]
    async fn stop_restores_the_previous_path() {
        let mut harness = harness(streaming()).await;
        let reply = harness.exchange("Hello", "Hi").await;
        let before = harness.current().await;
        let stored_before = harness.storage.inner().message_count().await;

        harness.provider.push_script(vec![
            ScriptStep::Delta("Par".to_string()),
            ScriptStep::HangUntilCancelled,
        ]);
        let handle = harness
            .controller
            .regenerate(harness.conversation.id, reply.id)
            .await
            .expect("regenerate starts");
        assert_eq!(harness.deltas.recv().await.as_deref(), Some("Par"));

        assert!(harness.controller.stop(harness.conversation.id));
        assert!(!harness.controller.stop(harness.conversation.id));
        assert!(matches!(settle(handle).await, StreamOutcome::Cancelled));

        let after = harness.current().await;
        assert_eq!(after.messages, before.messages);
        assert_eq!(after.current_leaf(), before.current_leaf());
        assert_eq!(harness.storage.inner().message_count().await, stored_before);
        assert!(!harness.controller.is_streaming(harness.conversation.id));
    }

    #[tokio::test]
    async fn stopping_before_the_first_delta_leaves_the_tree_as_it_was() {
        let mut harness = harness(streaming()).await;
        harness
            .service
            .append_user_turn(harness.conversation.id, text("Hello"))
            .await
            .expect("appended");
        let before = harness.current().await;

        harness.provider.push_script(vec![ScriptStep::HangUntilCancelled]);
        let handle = harness
            .controller
            .start(harness.conversation.id)
            .await
            .expect("start");
        assert!(harness.controller.stop(harness.conversation.id));
        assert!(matches!(settle(handle).await, StreamOutcome::Cancelled));

        let after = harness.current().await;
        assert_eq!(after.messages.len(), before.messages.len());
        assert_eq!(
            tree::resolve_active_path(&after),
            tree::resolve_active_path(&before)
        );
        assert!(harness.deltas.try_recv().is_err());

        let reply = harness.exchange("Again", "Sure").await;
        let before = harness.current().await;
        harness.provider.push_script(vec![ScriptStep::HangUntilCancelled]);
        let handle = harness
            .controller
            .regenerate(harness.conversation.id, reply.id)
            .await
            .expect("regenerate");
        assert!(harness.controller.stop(harness.conversation.id));
        assert!(matches!(settle(handle).await, StreamOutcome::Cancelled));

        let after = harness.current().await;
        assert_eq!(after.messages.len(), before.messages.len());
        assert_eq!(
            tree::resolve_active_path(&after),
            tree::resolve_active_path(&before)
        );
    }

    #[tokio::test]
    async fn provider_ignoring_abort_cannot_touch_the_tree() {
        let mut harness = harness(streaming()).await;
        harness.provider.push_stubborn_script(vec![
            ScriptStep::Delta("a".to_string()),
            ScriptStep::Pause(Duration::from_millis(20)),
            ScriptStep::Delta("b".to_string()),
            ScriptStep::Pause(Duration::from_millis(20)),
            ScriptStep::Delta("c".to_string()),
        ]);
        let handle = harness
            .controller
            .send(harness.conversation.id, text("Hello"))
            .await
            .expect("send starts");
        assert_eq!(harness.deltas.recv().await.as_deref(), Some("a"));

        assert!(handle.cancel());
        assert!(matches!(settle(handle).await, StreamOutcome::Cancelled));
        let settled = harness.current().await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        let later = harness.current().await;
        assert_eq!(later, settled);
        assert!(!later.has_pending());
        assert_eq!(path_texts(&later), vec!["Hello"]);
    }

    #[tokio::test]
    async fn second_session_in_the_same_conversation_is_rejected() {
        let harness = harness(streaming()).await;
        harness.provider.push_script(vec![ScriptStep::HangUntilCancelled]);
        let handle = harness
            .controller
            .send(harness.conversation.id, text("first"))
            .await
            .expect("first starts");
        let before = harness.current().await;

        let error = harness
            .controller
            .send(harness.conversation.id, text("second"))
            .await
            .err()
            .expect("second is rejected");
        assert_eq!(error.kind(), ErrorKind::ConcurrentStream);
        assert_eq!(harness.current().await.messages.len(), before.messages.len());

        assert!(handle.cancel());
        assert!(matches!(settle(handle).await, StreamOutcome::Cancelled));

        harness.provider.push_deltas(["ok"]);
        let retry = harness
            .controller
            .start(harness.conversation.id)
            .await
            .expect("slot released after cancel");
        assert!(settle(retry).await.message().is_some());
    }

    #[tokio::test]
    async fn conversations_stream_independently() {
        let harness = harness(streaming()).await;
        let other = harness
            .service
            .create_conversation("other", None)
            .await
            .expect("created");
        harness.provider.push_script(vec![ScriptStep::HangUntilCancelled]);
        harness.provider.push_script(vec![ScriptStep::HangUntilCancelled]);

        let first = harness
            .controller
            .send(harness.conversation.id, text("a"))
            .await
            .expect("first");
        let second = harness
            .controller
            .send(other.id, text("b"))
            .await
            .expect("second");
        assert!(harness.controller.is_streaming(harness.conversation.id));
        assert!(harness.controller.is_streaming(other.id));

        assert!(harness.controller.stop(other.id));
        assert!(matches!(settle(second).await, StreamOutcome::Cancelled));
        assert!(harness.controller.is_streaming(harness.conversation.id));

        assert!(harness.controller.stop(harness.conversation.id));
        assert!(matches!(settle(first).await, StreamOutcome::Cancelled));
    }

    #[tokio::test]
    async fn provider_errors_drop_the_placeholder() {
        let mut harness = harness(streaming()).await;
        harness.provider.push_script(vec![
            ScriptStep::Delta("partial".to_string()),
            ScriptStep::Fail("rate limited".to_string()),
        ]);

        let handle = harness
            .controller
            .send(harness.conversation.id, text("Hello"))
            .await
            .expect("send starts");
        let outcome = settle(handle).await;
        let error = outcome.error().expect("failure");
        assert_eq!(error.kind(), ErrorKind::Provider);
        assert!(error.to_string().contains("rate limited"));
        assert!(harness.ends.recv().await.is_some());

        let conversation = harness.current().await;
        assert!(!conversation.has_pending());
        assert_eq!(path_texts(&conversation), vec!["Hello"]);
    }

    #[tokio::test]
    async fn open_failure_is_returned_and_releases_the_slot() {
        let harness = harness(streaming()).await;
        harness.provider.push_open_failure("no such model");

        let error = harness
            .controller
            .send(harness.conversation.id, text("Hello"))
            .await
            .err()
            .expect("open fails");
        assert_eq!(error.kind(), ErrorKind::Provider);
        assert!(!harness.controller.is_streaming(harness.conversation.id));
        assert!(!harness.current().await.has_pending());
    }

    #[tokio::test]
    async fn empty_and_truncated_streams_fail() {
        let harness = harness(streaming()).await;
        harness.provider.push_script(Vec::new());
        let handle = harness
            .controller
            .send(harness.conversation.id, text("Hello"))
            .await
            .expect("send starts");
        let outcome = settle(handle).await;
        assert_eq!(outcome.error().map(EngineError::kind), Some(ErrorKind::Provider));

        harness.provider.push_script(vec![
            ScriptStep::Delta("half".to_string()),
            ScriptStep::Close,
        ]);
        let handle = harness
            .controller
            .start(harness.conversation.id)
            .await
            .expect("start");
        let outcome = settle(handle).await;
        assert_eq!(outcome.error().map(EngineError::kind), Some(ErrorKind::Provider));
        assert!(!harness.current().await.has_pending());
    }

    #[tokio::test]
    async fn stale_events_are_ignored() {
        let harness = harness(streaming()).await;
        harness.provider.push_script(vec![
            ScriptStep::StaleDelta("stale".to_string()),
            ScriptStep::Delta("fresh".to_string()),
        ]);

        let handle = harness
            .controller
            .send(harness.conversation.id, text("Hello"))
            .await
            .expect("send starts");
        let outcome = settle(handle).await;
        assert_eq!(outcome.message().map(Message::text).as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn unsaved_reply_can_be_committed_later() {
        let harness = harness(streaming()).await;
        let (_, question) = harness
            .service
            .append_user_turn(harness.conversation.id, text("Hello"))
            .await
            .expect("appended");
        harness.provider.push_deltas(["Hi"]);
        harness.storage.fail_commits(true);

        let handle = harness
            .controller
            .start(harness.conversation.id)
            .await
            .expect("start");
        let StreamOutcome::Failed(error) = settle(handle).await else {
            panic!("commit should fail");
        };
        assert_eq!(error.kind(), ErrorKind::UnsavedResponse);
        let unsaved = error.unsaved_message().cloned().expect("carries the reply");
        assert_eq!(unsaved.text(), "Hi");
        assert!(!harness.current().await.has_pending());

        harness.storage.fail_commits(false);
        let conversation = harness
            .service
            .commit_assistant_turn(harness.conversation.id, question.id, unsaved)
            .await
            .expect("retry commits");
        assert_eq!(path_texts(&conversation), vec!["Hello", "Hi"]);
        assert_eq!(harness.provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn non_streaming_mode_commits_without_deltas() {
        let mut harness = harness(CompletionOptions {
            stream: false,
            model_id: "custom-model".to_string(),
            temperature: Some(0.2),
            ..streaming()
        })
        .await;
        harness.provider.push_deltas(["A", "B"]);

        let handle = harness
            .controller
            .send(harness.conversation.id, text("Hello"))
            .await
            .expect("send starts");
        assert_eq!(settle(handle).await.message().map(Message::text).as_deref(), Some("AB"));
        assert!(harness.ends.recv().await.is_some());
        assert!(harness.deltas.try_recv().is_err());

        let request = harness.provider.requests().pop().expect("request");
        assert_eq!(request.model_id, "custom-model");
        assert_eq!(request.temperature, Some(0.2));
    }

    #[tokio::test]
    async fn send_on_a_missing_conversation_releases_the_slot() {
        let harness = harness(streaming()).await;
        let missing = ConversationId::new_v7();

        let error = harness
            .controller
            .send(missing, text("Hello"))
            .await
            .err()
            .expect("missing conversation");
        assert_eq!(error.kind(), ErrorKind::NotFound);
        assert!(!harness.controller.is_streaming(missing));
    }
}
