use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::provider::{
    CompletionProvider, CompletionRequest, ProviderResult, ProviderStreamHandle, ProviderWorker,
    Role, StreamEvent, StreamEventPayload, StreamFailedSnafu, StreamSessionId, make_event_stream,
};

pub const SCRIPTED_PROVIDER_ID: &str = "scripted";

/// One step a scripted stream replays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Delta(String),
    Reasoning(String),
    /// A delta tagged with some other session id.
    StaleDelta(String),
    Pause(Duration),
    /// Emits an error event and ends the stream.
    Fail(String),
    /// Blocks until the consumer aborts.
    HangUntilCancelled,
    /// Ends the stream without a terminal event.
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Script {
    Steps { steps: Vec<ScriptStep>, honor_abort: bool },
    RejectOpen(String),
}

/// Deterministic provider that replays queued scripts; with an empty queue it echoes the
/// last user turn.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, steps: Vec<ScriptStep>) -> Self {
        self.push_script(steps);
        self
    }

    pub fn push_script(&self, steps: Vec<ScriptStep>) {
        self.push(Script::Steps {
            steps,
            honor_abort: true,
        });
    }

    /// Queues a script whose worker keeps going after the abort signal fires.
    pub fn push_stubborn_script(&self, steps: Vec<ScriptStep>) {
        self.push(Script::Steps {
            steps,
            honor_abort: false,
        });
    }

    pub fn push_deltas<I, S>(&self, deltas: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push_script(
            deltas
                .into_iter()
                .map(|delta| ScriptStep::Delta(delta.into()))
                .collect(),
        );
    }

    pub fn push_open_failure(&self, message: impl Into<String>) {
        self.push(Script::RejectOpen(message.into()));
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        match self.requests.lock() {
            Ok(requests) => requests.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn push(&self, script: Script) {
        match self.scripts.lock() {
            Ok(mut scripts) => scripts.push_back(script),
            Err(poisoned) => poisoned.into_inner().push_back(script),
        }
    }

    fn next_script(&self, request: &CompletionRequest) -> Script {
        let queued = match self.scripts.lock() {
            Ok(mut scripts) => scripts.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };

        queued.unwrap_or_else(|| {
            let last_user = request
                .messages
                .iter()
                .rev()
                .find(|message| message.role == Role::User)
                .map(|message| message.content.clone())
                .unwrap_or_default();
            Script::Steps {
                steps: vec![ScriptStep::Delta(format!("echo: {last_user}"))],
                honor_abort: true,
            }
        })
    }

    fn record(&self, request: &CompletionRequest) {
        match self.requests.lock() {
            Ok(mut requests) => requests.push(request.clone()),
            Err(poisoned) => poisoned.into_inner().push(request.clone()),
        }
    }

    async fn run_script(
        target: StreamSessionId,
        steps: Vec<ScriptStep>,
        honor_abort: bool,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        for step in steps {
            if honor_abort && cancel_rx.try_recv().is_ok() {
                tracing::debug!(session_id = %target, "scripted stream aborted");
                return;
            }

            let payload = match step {
                ScriptStep::Delta(text) => StreamEventPayload::Delta(text),
                ScriptStep::Reasoning(text) => StreamEventPayload::ReasoningDelta(text),
                ScriptStep::StaleDelta(text) => {
                    let stale = StreamSessionId::new(u64::MAX - target.0);
                    if event_tx
                        .send(StreamEvent::new(stale, StreamEventPayload::Delta(text)))
                        .is_err()
                    {
                        return;
                    }
                    continue;
                }
                ScriptStep::Pause(duration) => {
                    if honor_abort {
                        tokio::select! {
                            _ = &mut cancel_rx => return,
                            _ = tokio::time::sleep(duration) => {}
                        }
                    } else {
                        tokio::time::sleep(duration).await;
                    }
                    continue;
                }
                ScriptStep::Fail(message) => {
                    let _ = event_tx.send(StreamEvent::new(
                        target,
                        StreamEventPayload::Error(message),
                    ));
                    return;
                }
                ScriptStep::HangUntilCancelled => {
                    let _ = (&mut cancel_rx).await;
                    return;
                }
                ScriptStep::Close => return,
            };

            // A stubborn worker only notices the abort once nobody is listening.
            if event_tx.send(StreamEvent::new(target, payload)).is_err() {
                return;
            }
        }

        let _ = event_tx.send(StreamEvent::new(target, StreamEventPayload::Done));
    }
}

impl CompletionProvider for ScriptedProvider {
    fn id(&self) -> &str {
        SCRIPTED_PROVIDER_ID
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    fn stream_complete(&self, request: CompletionRequest) -> ProviderResult<ProviderStreamHandle> {
        self.record(&request);
        let target = request.target;

        let (steps, honor_abort) = match self.next_script(&request) {
            Script::Steps { steps, honor_abort } => (steps, honor_abort),
            Script::RejectOpen(message) => {
                return StreamFailedSnafu {
                    stage: "scripted-open",
                    message,
                }
                .fail();
            }
        };

        let (event_tx, stream, cancel_rx) = make_event_stream(target);
        let worker: ProviderWorker = Box::pin(Self::run_script(
            target,
            steps,
            honor_abort,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}
