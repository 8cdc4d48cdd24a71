use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use parlor_llm::{
    LlmProvider, ProviderEventStream, StreamEventMapped, StreamEventPayload, StreamRequest,
    StreamTarget,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::error::{SessionError, SessionResult};

/// Ordered, cancellable sequence of events for one assistant turn.
///
/// Yields deltas in transport order and ends with exactly one terminal event
/// (`Done` or `Error`), unless cancelled, in which case it simply ends. A
/// transport that goes away without a terminal event is reported as an error.
pub struct TokenStream {
    target: StreamTarget,
    events: ProviderEventStream,
    cancel: CancellationToken,
    /// Registers the consumer's waker so an external cancel ends a pending poll.
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    finished: bool,
}

impl TokenStream {
    /// Opens a generation and spawns its provider worker on the current runtime.
    pub fn open(provider: &dyn LlmProvider, request: StreamRequest) -> SessionResult<Self> {
        let target = request.target;
        let model_id = request.model_id.clone();
        let handle = provider
            .stream_chat(request)
            .map_err(|error| SessionError::Transport {
                stage: "token-stream-open",
                message: error.to_string(),
            })?;

        tokio::spawn(handle.worker);
        tracing::debug!(
            target = ?target,
            provider_id = %provider.id(),
            model_id = %model_id,
            "token stream opened"
        );

        Ok(Self::from_events(handle.stream))
    }

    pub fn from_events(events: ProviderEventStream) -> Self {
        let cancel = CancellationToken::new();
        Self {
            target: events.target(),
            events,
            cancelled: Box::pin(cancel.clone().cancelled_owned()),
            cancel,
            finished: false,
        }
    }

    pub fn target(&self) -> StreamTarget {
        self.target
    }

    /// Handle that can cancel this stream from elsewhere, e.g. a timeout.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Idempotent; cancelling after completion is a no-op.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.stop_upstream();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn stop_upstream(&mut self) {
        if !self.finished {
            self.finished = true;
            if self.events.cancel() {
                tracing::debug!(target = ?self.target, "token stream cancelled");
            }
        }
    }
}

impl Stream for TokenStream {
    type Item = StreamEventMapped;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() || this.cancelled.as_mut().poll(cx).is_ready() {
            this.stop_upstream();
            return Poll::Ready(None);
        }
        if this.finished {
            return Poll::Ready(None);
        }

        match this.events.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(event)) => {
                if matches!(
                    event.payload,
                    StreamEventPayload::Done | StreamEventPayload::Error(_)
                ) {
                    this.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(Some(StreamEventMapped::error(
                    this.target,
                    "provider stream ended before a terminal event",
                )))
            }
        }
    }
}
