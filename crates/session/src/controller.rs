//! Session state machine.
//!
//! The controller owns the transcript and decides every transition; it never
//! performs IO. Callers feed it commands and stream events and carry out the
//! effects it returns (open a stream, persist turns, raise a notice).

use std::sync::Arc;

use parlor_llm::{
    ProviderMessage, Role as ProviderRole, SamplingParams, StreamEventMapped, StreamEventPayload,
    StreamRequest, StreamTarget,
};
use parlor_storage::SessionId;
use snafu::ensure;

use crate::error::{ConcurrentStreamSnafu, EmptyInputSnafu, InvalidStateSnafu, SessionResult};
use crate::transcript::Transcript;
use crate::turn::{Turn, TurnStatus};

/// Immutable view handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub turns: Arc<[Turn]>,
    pub busy: bool,
    pub selected_model: String,
    pub session_id: Option<SessionId>,
    /// Bumped on every clear, so a viewer that missed the empty snapshot can
    /// still tell the transcript was replaced.
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub selected_model: String,
    /// Synthetic leading context for every request; never shown or stored.
    pub system_prompt: Option<String>,
    pub sampling: SamplingParams,
}

impl SessionOptions {
    pub fn new(selected_model: impl Into<String>) -> Self {
        Self {
            selected_model: selected_model.into(),
            system_prompt: None,
            sampling: SamplingParams::default(),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        let system_prompt = system_prompt.into();
        self.system_prompt = if system_prompt.trim().is_empty() {
            None
        } else {
            Some(system_prompt)
        };
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingResponse(StreamTarget),
}

/// What the caller must do after a stream event was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The increment was folded into the tail.
    Applied,
    /// Event belonged to a stream that is no longer active.
    Ignored,
    /// Stream ended normally; persist these turns in order.
    Completed { persist: Vec<Turn> },
    /// Transport failed; the placeholder is gone. Persist these and surface `message`.
    Failed { persist: Vec<Turn>, message: String },
}

pub struct SessionController {
    transcript: Transcript,
    session_id: Option<SessionId>,
    options: SessionOptions,
    phase: Phase,
    /// User turn that opened the active stream, held until the stream settles.
    pending_user_turn: Option<Turn>,
    next_target: StreamTarget,
    generation: u64,
}

impl SessionController {
    pub fn new(options: SessionOptions, session_id: Option<SessionId>) -> Self {
        Self {
            transcript: Transcript::new(),
            session_id,
            options,
            phase: Phase::Idle,
            pending_user_turn: None,
            next_target: StreamTarget::new(1),
            generation: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.phase, Phase::AwaitingResponse(_))
    }

    pub fn selected_model(&self) -> &str {
        &self.options.selected_model
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            turns: self.transcript.snapshot(),
            busy: self.is_busy(),
            selected_model: self.options.selected_model.clone(),
            session_id: self.session_id,
            generation: self.generation,
        }
    }

    /// Seeds the transcript with stored history. Only valid on a fresh session.
    pub fn restore(&mut self, history: Vec<Turn>) -> SessionResult<()> {
        ensure!(
            self.transcript.is_empty() && !self.is_busy(),
            InvalidStateSnafu {
                stage: "controller-restore",
                details: "history can only seed an empty idle session",
            }
        );
        for turn in history {
            self.transcript.append(turn)?;
        }
        Ok(())
    }

    /// Accepts user input and returns the request the caller must open.
    ///
    /// Appends the user turn and a pending assistant placeholder. Rejected
    /// with `ConcurrentStream` while a response is still streaming, in which
    /// case nothing changes.
    pub fn begin_submit(&mut self, text: &str) -> SessionResult<StreamRequest> {
        if let Phase::AwaitingResponse(active) = self.phase {
            tracing::warn!(active = ?active, "submit rejected while a response is streaming");
            return ConcurrentStreamSnafu {
                stage: "controller-submit",
                active,
            }
            .fail();
        }
        let text = text.trim();
        ensure!(
            !text.is_empty(),
            EmptyInputSnafu {
                stage: "controller-submit",
                field: "message",
            }
        );

        let mut messages = Vec::with_capacity(self.transcript.len() + 2);
        if let Some(system_prompt) = &self.options.system_prompt {
            messages.push(ProviderMessage::new(ProviderRole::System, system_prompt.clone()));
        }
        messages.extend(self.transcript.finalized().map(Turn::to_provider_message));
        messages.push(ProviderMessage::new(ProviderRole::User, text));

        let user_turn = Turn::user(text);
        self.transcript.append(user_turn.clone())?;
        self.transcript.append(Turn::assistant_pending())?;

        let target = self.next_target;
        self.next_target = target.next();
        self.phase = Phase::AwaitingResponse(target);
        self.pending_user_turn = Some(user_turn);

        Ok(
            StreamRequest::new(target, self.options.selected_model.clone(), messages)
                .with_sampling(self.options.sampling),
        )
    }

    /// Marks the placeholder as streaming once the transport accepted the request.
    pub fn stream_opened(&mut self, target: StreamTarget) -> SessionResult<()> {
        self.ensure_active(target, "controller-stream-opened")?;
        self.transcript.start_streaming(target)
    }

    pub fn apply_event(&mut self, event: StreamEventMapped) -> SessionResult<StreamOutcome> {
        if self.phase != Phase::AwaitingResponse(event.target) {
            tracing::debug!(target = ?event.target, "ignoring event from inactive stream");
            return Ok(StreamOutcome::Ignored);
        }

        match event.payload {
            StreamEventPayload::Delta(increment) => {
                self.transcript.extend_tail(&increment)?;
                Ok(StreamOutcome::Applied)
            }
            StreamEventPayload::Done => {
                let persist = self.complete(event.target)?;
                Ok(StreamOutcome::Completed { persist })
            }
            StreamEventPayload::Error(message) => {
                let persist = self.fail(event.target, &message)?;
                Ok(StreamOutcome::Failed { persist, message })
            }
        }
    }

    /// Finalizes the tail as `Complete`; returns the user and assistant turns to persist.
    pub fn complete(&mut self, target: StreamTarget) -> SessionResult<Vec<Turn>> {
        self.ensure_active(target, "controller-complete")?;
        let assistant = self.transcript.finalize(TurnStatus::Complete)?.clone();
        tracing::debug!(
            target = ?target,
            content_len = assistant.content.len(),
            "assistant turn complete"
        );
        Ok(self.settle(Some(assistant)))
    }

    /// Aborts the active stream, keeping what already arrived.
    ///
    /// Idle sessions return `None`; cancelling twice or after completion is a no-op.
    pub fn cancel(&mut self) -> SessionResult<Option<Vec<Turn>>> {
        let Phase::AwaitingResponse(target) = self.phase else {
            return Ok(None);
        };

        let assistant = self.transcript.finalize(TurnStatus::Aborted)?.clone();
        tracing::info!(
            target = ?target,
            content_len = assistant.content.len(),
            "assistant turn aborted"
        );
        Ok(Some(self.settle(Some(assistant))))
    }

    /// Drops the placeholder and any partial content. The user turn stays.
    pub fn fail(&mut self, target: StreamTarget, message: &str) -> SessionResult<Vec<Turn>> {
        self.ensure_active(target, "controller-fail")?;
        let discarded = self.transcript.discard_tail()?;
        tracing::warn!(
            target = ?target,
            discarded_len = discarded.content.len(),
            error = %message,
            "assistant turn discarded after transport failure"
        );
        Ok(self.settle(None))
    }

    /// Affects only the next submit; permitted in any phase.
    pub fn select_model(&mut self, model_id: &str) -> SessionResult<()> {
        let model_id = model_id.trim();
        ensure!(
            !model_id.is_empty(),
            EmptyInputSnafu {
                stage: "controller-select-model",
                field: "model id",
            }
        );
        self.options.selected_model = model_id.to_string();
        Ok(())
    }

    /// Truncates the in-memory transcript. Stored turns are left alone.
    pub fn clear(&mut self) -> SessionResult<()> {
        if let Phase::AwaitingResponse(active) = self.phase {
            return InvalidStateSnafu {
                stage: "controller-clear",
                details: format!("cannot clear while stream {active:?} is open"),
            }
            .fail();
        }
        self.transcript.clear();
        self.generation += 1;
        Ok(())
    }

    fn ensure_active(&self, target: StreamTarget, stage: &'static str) -> SessionResult<()> {
        ensure!(
            self.phase == Phase::AwaitingResponse(target),
            InvalidStateSnafu {
                stage,
                details: format!("{target:?} is not the active stream ({:?})", self.phase),
            }
        );
        Ok(())
    }

    fn settle(&mut self, assistant: Option<Turn>) -> Vec<Turn> {
        self.phase = Phase::Idle;
        self.pending_user_turn
            .take()
            .into_iter()
            .chain(assistant)
            .collect()
    }
}
