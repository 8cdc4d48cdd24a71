//! Single-owner session actor.
//!
//! All mutation happens on one task. Commands arrive over a channel and are
//! always drained before the next stream event, so a cancel that was
//! acknowledged is never followed by an increment on the transcript.

use std::sync::Arc;

use futures::StreamExt;
use parlor_llm::{LlmProvider, StreamEventMapped, StreamTarget};
use tokio::sync::{mpsc, oneshot, watch};

use crate::controller::{SessionController, SessionOptions, SessionSnapshot, StreamOutcome};
use crate::error::{RuntimeStoppedSnafu, SessionError, SessionResult};
use crate::persistence::{
    NoticeReceiver, NoticeSender, PersistenceSync, PersistenceTarget, SessionNotice,
    load_history_or_empty,
};
use crate::stream::TokenStream;
use crate::turn::Turn;

const COMMAND_QUEUE_DEPTH: usize = 32;

type Reply<T> = oneshot::Sender<SessionResult<T>>;

enum Command {
    Submit { text: String, reply: Reply<()> },
    Cancel { reply: Reply<()> },
    SelectModel { model_id: String, reply: Reply<()> },
    Clear { reply: Reply<()> },
}

/// Cloneable front door to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Arc<SessionSnapshot>>,
}

impl SessionHandle {
    /// Accepts `text` and starts streaming the reply.
    ///
    /// Returns once the turn is on the transcript. Transport failures after
    /// acceptance arrive as [`SessionNotice::TransportFailed`].
    pub async fn submit(&self, text: impl Into<String>) -> SessionResult<()> {
        let text = text.into();
        self.request("session-submit", |reply| Command::Submit { text, reply })
            .await
    }

    /// Stops the active stream. Once this returns no further increment lands.
    pub async fn cancel(&self) -> SessionResult<()> {
        self.request("session-cancel", |reply| Command::Cancel { reply })
            .await
    }

    pub async fn select_model(&self, model_id: impl Into<String>) -> SessionResult<()> {
        let model_id = model_id.into();
        self.request("session-select-model", |reply| Command::SelectModel {
            model_id,
            reply,
        })
        .await
    }

    pub async fn clear(&self) -> SessionResult<()> {
        self.request("session-clear", |reply| Command::Clear { reply })
            .await
    }

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<SessionSnapshot>> {
        self.snapshots.clone()
    }

    async fn request<T>(
        &self,
        stage: &'static str,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> SessionResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| RuntimeStoppedSnafu { stage }.build())?;
        response
            .await
            .map_err(|_| RuntimeStoppedSnafu { stage }.build())?
    }
}

pub struct SessionRuntime {
    controller: SessionController,
    provider: Option<Arc<dyn LlmProvider>>,
    persistence: PersistenceSync,
    history_source: Option<PersistenceTarget>,
    active: Option<TokenStream>,
    commands: mpsc::Receiver<Command>,
    snapshots: watch::Sender<Arc<SessionSnapshot>>,
    notices: NoticeSender,
}

enum Step {
    Command(Option<Command>),
    Event(Option<StreamEventMapped>),
}

impl SessionRuntime {
    /// Starts a session on the current tokio runtime.
    ///
    /// Without a provider every submit fails with a transport notice; without
    /// a persistence target the session is ephemeral. Stored history for the
    /// target is loaded before the first command is served.
    pub fn spawn(
        options: SessionOptions,
        provider: Option<Arc<dyn LlmProvider>>,
        persistence: Option<PersistenceTarget>,
    ) -> (SessionHandle, NoticeReceiver) {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        let session_id = persistence.as_ref().map(|target| target.session_id);
        let controller = SessionController::new(options, session_id);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(controller.snapshot()));

        let sync = match persistence.clone() {
            Some(target) => PersistenceSync::spawn(target, notice_tx.clone()),
            None => PersistenceSync::ephemeral(),
        };

        let runtime = Self {
            controller,
            provider,
            persistence: sync,
            history_source: persistence,
            active: None,
            commands: command_rx,
            snapshots: snapshot_tx,
            notices: notice_tx,
        };
        tokio::spawn(runtime.run());

        (
            SessionHandle {
                commands: command_tx,
                snapshots: snapshot_rx,
            },
            notice_rx,
        )
    }

    async fn run(mut self) {
        if let Some(target) = self.history_source.take() {
            let history = load_history_or_empty(&target, &self.notices).await;
            if let Err(error) = self.controller.restore(history) {
                tracing::warn!(error = %error, "stored history rejected; starting empty");
                self.notify(SessionNotice::HistoryUnavailable {
                    message: error.to_string(),
                });
            }
            self.publish();
        }

        loop {
            let step = tokio::select! {
                biased;
                command = self.commands.recv() => Step::Command(command),
                event = next_event(&mut self.active) => Step::Event(event),
            };

            match step {
                Step::Command(Some(command)) => self.handle_command(command),
                Step::Command(None) => break,
                Step::Event(Some(event)) => self.handle_stream_event(event),
                Step::Event(None) => self.handle_stream_closed(),
            }
        }

        if let Err(error) = self.cancel_active() {
            tracing::warn!(error = %error, "failed to settle active stream on shutdown");
        }
        tracing::debug!(session_id = ?self.persistence.session_id(), "session runtime stopped");
    }

    /// Publishes before replying so a caller that awaited the reply sees its effect.
    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { text, reply } => {
                let outcome = self.submit(&text);
                self.reply(reply, outcome);
            }
            Command::Cancel { reply } => {
                let outcome = self.cancel_active();
                self.reply(reply, outcome);
            }
            Command::SelectModel { model_id, reply } => {
                let outcome = self.controller.select_model(&model_id);
                if outcome.is_ok() {
                    tracing::info!(model_id = %self.controller.selected_model(), "model selected");
                }
                self.reply(reply, outcome);
            }
            Command::Clear { reply } => {
                let outcome = self.controller.clear();
                self.reply(reply, outcome);
            }
        }
    }

    fn reply<T>(&self, reply: Reply<T>, outcome: SessionResult<T>) {
        self.publish();
        if reply.send(outcome).is_err() {
            tracing::debug!("command caller went away before the reply");
        }
    }

    fn submit(&mut self, text: &str) -> SessionResult<()> {
        let request = self.controller.begin_submit(text)?;
        let target = request.target;
        tracing::info!(
            target = ?target,
            model_id = %request.model_id,
            context_len = request.messages.len(),
            "submitting prompt"
        );

        let opened = match &self.provider {
            Some(provider) => TokenStream::open(provider.as_ref(), request),
            None => Err(SessionError::Transport {
                stage: "session-submit",
                message: "no inference provider is configured".to_string(),
            }),
        };

        match opened {
            Ok(stream) => {
                self.controller.stream_opened(target)?;
                self.active = Some(stream);
            }
            Err(error) => self.fail_stream(target, error.to_string())?,
        }
        Ok(())
    }

    fn cancel_active(&mut self) -> SessionResult<()> {
        if let Some(mut stream) = self.active.take() {
            stream.cancel();
        }
        if let Some(turns) = self.controller.cancel()? {
            self.persist(&turns);
        }
        Ok(())
    }

    fn handle_stream_event(&mut self, event: StreamEventMapped) {
        let target = event.target;
        let outcome = match self.controller.apply_event(event) {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(target = ?target, error = %error, "stream event rejected");
                return;
            }
        };

        match outcome {
            StreamOutcome::Applied => {}
            StreamOutcome::Ignored => return,
            StreamOutcome::Completed { persist } => {
                self.active = None;
                self.persist(&persist);
            }
            StreamOutcome::Failed { persist, message } => {
                self.active = None;
                self.persist(&persist);
                self.notify(SessionNotice::TransportFailed { message });
            }
        }
        self.publish();
    }

    /// The stream ended without a terminal event, which only a cancel handle can cause.
    fn handle_stream_closed(&mut self) {
        if let Err(error) = self.cancel_active() {
            tracing::error!(error = %error, "failed to settle cancelled stream");
        }
        self.publish();
    }

    fn fail_stream(&mut self, target: StreamTarget, message: String) -> SessionResult<()> {
        let turns = self.controller.fail(target, &message)?;
        self.persist(&turns);
        self.notify(SessionNotice::TransportFailed { message });
        Ok(())
    }

    fn persist(&self, turns: &[Turn]) {
        for turn in turns {
            self.persistence.persist(turn);
        }
    }

    fn notify(&self, notice: SessionNotice) {
        if self.notices.send(notice).is_err() {
            tracing::debug!("notice receiver dropped");
        }
    }

    fn publish(&self) {
        self.snapshots
            .send_replace(Arc::new(self.controller.snapshot()));
    }
}

async fn next_event(active: &mut Option<TokenStream>) -> Option<StreamEventMapped> {
    match active {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use parlor_llm::{
        ProviderError, ProviderResult, ProviderStreamHandle, StreamRequest, make_event_stream,
    };
    use parlor_storage::{MessageId, MessageRecord, MessageRole, MessageStatus, SessionId};

    use super::*;
    use crate::persistence::testing::RecordingStore;
    use crate::turn::{Role, TurnStatus};

    /// Provider whose streams are driven by the test through their senders.
    #[derive(Default)]
    struct ScriptedProvider {
        refuse: bool,
        requests: Mutex<Vec<StreamRequest>>,
        senders: Mutex<Vec<mpsc::UnboundedSender<StreamEventMapped>>>,
    }

    impl ScriptedProvider {
        fn send(&self, index: usize, event: StreamEventMapped) {
            let senders = self.senders.lock().unwrap();
            let _ = senders[index].send(event);
        }

        fn requests(&self) -> Vec<StreamRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl LlmProvider for ScriptedProvider {
        fn id(&self) -> &str {
            "scripted"
        }

        fn name(&self) -> &str {
            "Scripted"
        }

        fn default_model(&self) -> &str {
            "scripted-model"
        }

        fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
            if self.refuse {
                return Err(ProviderError::MissingApiKey {
                    stage: "scripted-open",
                    provider_id: "scripted".to_string(),
                });
            }
            let (event_tx, stream, _cancel_rx) = make_event_stream(request.target);
            self.requests.lock().unwrap().push(request);
            self.senders.lock().unwrap().push(event_tx);
            Ok(ProviderStreamHandle {
                stream,
                worker: Box::pin(async {}),
            })
        }
    }

    fn options() -> SessionOptions {
        SessionOptions::new("test-model")
    }

    async fn wait_for(
        handle: &SessionHandle,
        condition: impl FnMut(&Arc<SessionSnapshot>) -> bool,
    ) -> Arc<SessionSnapshot> {
        let mut snapshots = handle.subscribe();
        let snapshot = tokio::time::timeout(Duration::from_secs(2), snapshots.wait_for(condition))
            .await
            .expect("snapshot condition timed out")
            .expect("runtime stopped")
            .clone();
        snapshot
    }

    async fn wait_for_appends(store: &RecordingStore, count: usize) {
        for _ in 0..200 {
            if store.appended().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} appends, saw {}", store.appended().len());
    }

    #[tokio::test]
    async fn streamed_reply_is_shown_and_persisted() {
        let provider = Arc::new(ScriptedProvider::default());
        let store = Arc::new(RecordingStore::default());
        let target = PersistenceTarget {
            store: store.clone(),
            session_id: SessionId::new_v7(),
        };
        let (handle, _notices) =
            SessionRuntime::spawn(options(), Some(provider.clone()), Some(target));

        handle.submit("hi").await.unwrap();
        assert!(handle.snapshot().busy);
        let stream_target = provider.requests()[0].target;
        provider.send(0, StreamEventMapped::delta(stream_target, "He"));
        provider.send(0, StreamEventMapped::delta(stream_target, "llo"));
        provider.send(0, StreamEventMapped::done(stream_target));

        let snapshot = wait_for(&handle, |snapshot| !snapshot.busy).await;
        assert_eq!(snapshot.turns.len(), 2);
        assert_eq!(snapshot.turns[1].content, "Hello");
        assert_eq!(snapshot.turns[1].status, TurnStatus::Complete);

        wait_for_appends(&store, 2).await;
        let appended = store.appended();
        assert_eq!(appended[0].role, MessageRole::User);
        assert_eq!(appended[0].content, "hi");
        assert_eq!(appended[1].content, "Hello");
        assert_eq!(appended[1].status, MessageStatus::Complete);
    }

    #[tokio::test]
    async fn ephemeral_session_completes_without_storage() {
        let provider = Arc::new(ScriptedProvider::default());
        let (handle, mut notices) = SessionRuntime::spawn(options(), Some(provider.clone()), None);

        handle.submit("hi").await.unwrap();
        let stream_target = provider.requests()[0].target;
        provider.send(0, StreamEventMapped::delta(stream_target, "He"));
        provider.send(0, StreamEventMapped::delta(stream_target, "llo"));
        provider.send(0, StreamEventMapped::done(stream_target));

        let snapshot = wait_for(&handle, |snapshot| !snapshot.busy).await;
        assert_eq!(snapshot.session_id, None);
        assert_eq!(
            snapshot
                .turns
                .iter()
                .map(|turn| (turn.role, turn.content.as_str(), turn.status))
                .collect::<Vec<_>>(),
            vec![
                (Role::User, "hi", TurnStatus::Complete),
                (Role::Assistant, "Hello", TurnStatus::Complete),
            ]
        );
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_writes_leave_the_exchange_intact() {
        let provider = Arc::new(ScriptedProvider::default());
        let store = Arc::new(RecordingStore {
            fail_appends: true,
            ..RecordingStore::default()
        });
        let target = PersistenceTarget {
            store,
            session_id: SessionId::new_v7(),
        };
        let (handle, mut notices) =
            SessionRuntime::spawn(options(), Some(provider.clone()), Some(target));

        handle.submit("hi").await.unwrap();
        let stream_target = provider.requests()[0].target;
        provider.send(0, StreamEventMapped::delta(stream_target, "Hello"));
        provider.send(0, StreamEventMapped::done(stream_target));

        let snapshot = wait_for(&handle, |snapshot| !snapshot.busy).await;
        let notice = tokio::time::timeout(Duration::from_secs(2), notices.recv())
            .await
            .unwrap();
        assert!(matches!(notice, Some(SessionNotice::PersistenceFailed { .. })));

        assert_eq!(handle.snapshot(), snapshot);
        assert_eq!(snapshot.turns.len(), 2);
        assert_eq!(snapshot.turns[1].content, "Hello");
        assert_eq!(snapshot.turns[1].status, TurnStatus::Complete);

        handle.submit("still here").await.unwrap();
        assert_eq!(provider.requests().len(), 2);
    }

    #[tokio::test]
    async fn cancel_freezes_partial_content() {
        let provider = Arc::new(ScriptedProvider::default());
        let store = Arc::new(RecordingStore::default());
        let target = PersistenceTarget {
            store: store.clone(),
            session_id: SessionId::new_v7(),
        };
        let (handle, _notices) =
            SessionRuntime::spawn(options(), Some(provider.clone()), Some(target));

        handle.submit("long task").await.unwrap();
        let stream_target = provider.requests()[0].target;
        provider.send(0, StreamEventMapped::delta(stream_target, "Wo"));
        wait_for(&handle, |snapshot| {
            snapshot.turns.last().is_some_and(|turn| turn.content == "Wo")
        })
        .await;

        handle.cancel().await.unwrap();
        provider.send(0, StreamEventMapped::delta(stream_target, "rld"));
        handle.cancel().await.unwrap();

        let snapshot = handle.snapshot();
        assert!(!snapshot.busy);
        assert_eq!(snapshot.turns[1].content, "Wo");
        assert_eq!(snapshot.turns[1].status, TurnStatus::Aborted);

        wait_for_appends(&store, 2).await;
        assert_eq!(store.appended()[1].status, MessageStatus::Aborted);
    }

    #[tokio::test]
    async fn second_submit_is_rejected_while_streaming() {
        let provider = Arc::new(ScriptedProvider::default());
        let (handle, _notices) = SessionRuntime::spawn(options(), Some(provider.clone()), None);

        handle.submit("first").await.unwrap();
        let error = handle.submit("second").await.unwrap_err();

        assert!(matches!(error, SessionError::ConcurrentStream { .. }));
        assert_eq!(provider.requests().len(), 1);
        assert_eq!(handle.snapshot().turns.len(), 2);
    }

    #[tokio::test]
    async fn refused_open_leaves_user_turn_and_raises_notice() {
        let provider = Arc::new(ScriptedProvider {
            refuse: true,
            ..ScriptedProvider::default()
        });
        let (handle, mut notices) = SessionRuntime::spawn(options(), Some(provider), None);

        handle.submit("hi").await.unwrap();

        let snapshot = handle.snapshot();
        assert!(!snapshot.busy);
        assert_eq!(snapshot.turns.len(), 1);
        assert_eq!(snapshot.turns[0].role, Role::User);
        assert!(matches!(
            notices.recv().await,
            Some(SessionNotice::TransportFailed { .. })
        ));
    }

    #[tokio::test]
    async fn mid_stream_error_discards_partial_reply() {
        let provider = Arc::new(ScriptedProvider::default());
        let (handle, mut notices) = SessionRuntime::spawn(options(), Some(provider.clone()), None);

        handle.submit("hi").await.unwrap();
        let stream_target = provider.requests()[0].target;
        provider.send(0, StreamEventMapped::delta(stream_target, "Hal"));
        provider.send(0, StreamEventMapped::error(stream_target, "connection reset"));

        let snapshot = wait_for(&handle, |snapshot| !snapshot.busy).await;
        assert_eq!(snapshot.turns.len(), 1);
        assert_eq!(
            notices.recv().await,
            Some(SessionNotice::TransportFailed {
                message: "connection reset".to_string()
            })
        );

        handle.submit("retry").await.unwrap();
        assert_eq!(provider.requests().len(), 2);
    }

    #[tokio::test]
    async fn missing_provider_is_a_transport_failure() {
        let (handle, mut notices) = SessionRuntime::spawn(options(), None, None);

        handle.submit("hi").await.unwrap();

        assert_eq!(handle.snapshot().turns.len(), 1);
        assert!(matches!(
            notices.recv().await,
            Some(SessionNotice::TransportFailed { .. })
        ));
    }

    #[tokio::test]
    async fn model_selection_applies_to_next_request() {
        let provider = Arc::new(ScriptedProvider::default());
        let (handle, _notices) = SessionRuntime::spawn(options(), Some(provider.clone()), None);

        handle.select_model("other-model").await.unwrap();
        assert_eq!(handle.snapshot().selected_model, "other-model");
        handle.submit("hi").await.unwrap();

        assert_eq!(provider.requests()[0].model_id, "other-model");
        assert!(handle.select_model("  ").await.is_err());
    }

    #[tokio::test]
    async fn stored_history_seeds_the_transcript_and_context() {
        let session_id = SessionId::new_v7();
        let record = |seq: u64, role: MessageRole, content: &str| MessageRecord {
            id: MessageId::new_v7(),
            session_id,
            seq,
            role,
            status: MessageStatus::Complete,
            content: content.to_string(),
            created_at_unix_millis: seq,
        };
        let store = Arc::new(RecordingStore {
            history: vec![
                record(1, MessageRole::User, "earlier"),
                record(2, MessageRole::Assistant, "reply"),
            ],
            ..RecordingStore::default()
        });
        let provider = Arc::new(ScriptedProvider::default());
        let (handle, _notices) = SessionRuntime::spawn(
            options(),
            Some(provider.clone()),
            Some(PersistenceTarget { store, session_id }),
        );

        handle.submit("next").await.unwrap();

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.session_id, Some(session_id));
        assert_eq!(snapshot.turns[0].content, "earlier");
        assert_eq!(provider.requests()[0].messages.len(), 3);
    }

    #[tokio::test]
    async fn clear_is_rejected_while_streaming() {
        let provider = Arc::new(ScriptedProvider::default());
        let (handle, _notices) = SessionRuntime::spawn(options(), Some(provider.clone()), None);

        handle.submit("hi").await.unwrap();
        assert!(matches!(
            handle.clear().await,
            Err(SessionError::InvalidState { .. })
        ));

        handle.cancel().await.unwrap();
        handle.clear().await.unwrap();
        assert!(handle.snapshot().turns.is_empty());
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_the_runtime() {
        let (handle, _notices) = SessionRuntime::spawn(options(), None, None);
        let mut snapshots = handle.subscribe();
        drop(handle);

        let closed = tokio::time::timeout(Duration::from_secs(2), snapshots.changed()).await;
        assert!(matches!(closed, Ok(Err(_))));
    }
}
