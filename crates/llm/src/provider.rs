use std::pin::Pin;
use std::task::{Context, Poll};

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::model::SamplingParams;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
        }
    }
}

/// Speaker role as understood by the inference boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Identifies one generation so stale events can be told apart from live ones.
///
/// A fresh target is minted for every submit; events carrying any other target
/// are dropped by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamTarget(pub u64);

impl StreamTarget {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub target: StreamTarget,
    pub model_id: String,
    pub messages: Vec<ProviderMessage>,
    pub sampling: SamplingParams,
}

impl StreamRequest {
    pub fn new(
        target: StreamTarget,
        model_id: impl Into<String>,
        messages: Vec<ProviderMessage>,
    ) -> Self {
        Self {
            target,
            model_id: model_id.into(),
            messages,
            sampling: SamplingParams::default(),
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }
}

/// Provider stream payload normalized away from any vendor wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventMapped {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

impl StreamEventMapped {
    pub fn delta(target: StreamTarget, text: impl Into<String>) -> Self {
        Self {
            target,
            payload: StreamEventPayload::Delta(text.into()),
        }
    }

    pub fn done(target: StreamTarget) -> Self {
        Self {
            target,
            payload: StreamEventPayload::Done,
        }
    }

    pub fn error(target: StreamTarget, message: impl Into<String>) -> Self {
        Self {
            target,
            payload: StreamEventPayload::Error(message.into()),
        }
    }
}

pub type ProviderWorker = Pin<Box<dyn std::future::Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request for {target:?} has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

/// Receiving half of one provider generation.
///
/// Cancelling is one-shot: the first call signals the worker, later calls and
/// calls after the worker finished are no-ops. Once cancelled the stream
/// yields nothing further, even if the worker had already queued events.
pub struct ProviderEventStream {
    target: StreamTarget,
    events: mpsc::UnboundedReceiver<StreamEventMapped>,
    cancel_tx: Option<oneshot::Sender<()>>,
    cancelled: bool,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    pub(crate) fn new(
        target: StreamTarget,
        events: mpsc::UnboundedReceiver<StreamEventMapped>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            target,
            events,
            cancel_tx: Some(cancel_tx),
            cancelled: false,
        }
    }

    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub async fn recv(&mut self) -> Option<StreamEventMapped> {
        if self.cancelled {
            return None;
        }
        self.events.recv().await
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<StreamEventMapped>> {
        if self.cancelled {
            return Poll::Ready(None);
        }
        self.events.poll_recv(cx)
    }

    /// Returns true only for the call that actually delivered the signal.
    pub fn cancel(&mut self) -> bool {
        self.cancelled = true;
        self.events.close();
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;
}

/// Builds the channel pair shared by every provider implementation.
///
/// Providers outside this crate (scripted test providers included) use this to
/// get the same cancel and drop semantics as the rig adapter.
pub fn make_event_stream(
    target: StreamTarget,
) -> (
    mpsc::UnboundedSender<StreamEventMapped>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(target, event_rx, cancel_tx),
        cancel_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_send_order() {
        let target = StreamTarget::new(7);
        let (event_tx, mut stream, _cancel_rx) = make_event_stream(target);

        event_tx.send(StreamEventMapped::delta(target, "He")).unwrap();
        event_tx.send(StreamEventMapped::delta(target, "llo")).unwrap();
        event_tx.send(StreamEventMapped::done(target)).unwrap();
        drop(event_tx);

        let mut payloads = Vec::new();
        while let Some(event) = stream.recv().await {
            assert_eq!(event.target, target);
            payloads.push(event.payload);
        }

        assert_eq!(
            payloads,
            vec![
                StreamEventPayload::Delta("He".to_string()),
                StreamEventPayload::Delta("llo".to_string()),
                StreamEventPayload::Done,
            ]
        );
    }

    #[tokio::test]
    async fn cancel_is_one_shot_and_hides_buffered_events() {
        let target = StreamTarget::new(1);
        let (event_tx, mut stream, mut cancel_rx) = make_event_stream(target);
        event_tx.send(StreamEventMapped::delta(target, "buffered")).unwrap();

        assert!(stream.cancel());
        assert!(!stream.cancel());
        assert!(stream.is_cancelled());
        assert!(cancel_rx.try_recv().is_ok());
        assert_eq!(stream.recv().await, None);
    }

    #[test]
    fn cancel_after_worker_exit_is_a_no_op() {
        let target = StreamTarget::new(2);
        let (event_tx, mut stream, cancel_rx) = make_event_stream(target);
        drop(cancel_rx);
        drop(event_tx);

        assert!(!stream.cancel());
        assert!(!stream.cancel());
    }

    #[test]
    fn dropping_the_stream_signals_the_worker() {
        let (_event_tx, stream, mut cancel_rx) = make_event_stream(StreamTarget::new(3));
        drop(stream);
        assert!(cancel_rx.try_recv().is_ok());
    }

    #[test]
    fn stream_targets_advance_monotonically() {
        let first = StreamTarget::new(1);
        assert!(first.next() > first);
        assert_eq!(StreamTarget::new(u64::MAX).next(), StreamTarget::new(u64::MAX));
    }
}
