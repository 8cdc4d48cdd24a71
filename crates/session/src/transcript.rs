use std::sync::Arc;

use parlor_llm::StreamTarget;
use snafu::ensure;

use crate::error::{InvalidStateSnafu, SessionResult};
use crate::turn::{Role, Turn, TurnStatus};

/// In-memory ordered log of conversation turns.
///
/// Only the tail may change, and only while it is pending or streaming.
/// Timestamps are clamped on append so the sequence never goes backwards.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn tail(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Target of the streaming tail, if there is one.
    pub fn streaming_target(&self) -> Option<StreamTarget> {
        match self.tail()?.status {
            TurnStatus::Streaming(target) => Some(target),
            _ => None,
        }
    }

    pub fn append(&mut self, mut turn: Turn) -> SessionResult<()> {
        ensure!(
            turn.role != Role::System,
            InvalidStateSnafu {
                stage: "transcript-append",
                details: "system turns are context only and never enter the transcript",
            }
        );
        if let Some(tail) = self.tail() {
            ensure!(
                tail.status.is_terminal(),
                InvalidStateSnafu {
                    stage: "transcript-append",
                    details: format!("tail turn is still {:?}", tail.status),
                }
            );
            turn.timestamp_ms = turn.timestamp_ms.max(tail.timestamp_ms);
        }

        self.turns.push(turn);
        Ok(())
    }

    /// Moves a pending tail into `Streaming(target)`.
    pub fn start_streaming(&mut self, target: StreamTarget) -> SessionResult<()> {
        let tail = self.turns.last_mut().filter(|tail| tail.status == TurnStatus::Pending);
        let Some(tail) = tail else {
            return InvalidStateSnafu {
                stage: "transcript-start-streaming",
                details: "tail turn is not pending",
            }
            .fail();
        };

        tail.status = TurnStatus::Streaming(target);
        Ok(())
    }

    /// Replaces the content of the streaming tail.
    pub fn mutate_tail(&mut self, content: impl Into<String>) -> SessionResult<()> {
        let tail = self.streaming_tail_mut("transcript-mutate-tail")?;
        tail.content = content.into();
        Ok(())
    }

    /// Appends an increment to the streaming tail without copying what is already there.
    pub fn extend_tail(&mut self, increment: &str) -> SessionResult<()> {
        let tail = self.streaming_tail_mut("transcript-extend-tail")?;
        tail.content.push_str(increment);
        Ok(())
    }

    /// Transitions the tail to a terminal status and returns the frozen turn.
    pub fn finalize(&mut self, status: TurnStatus) -> SessionResult<&Turn> {
        ensure!(
            status.is_terminal(),
            InvalidStateSnafu {
                stage: "transcript-finalize",
                details: format!("{status:?} is not a terminal status"),
            }
        );
        let tail = self.open_tail_mut("transcript-finalize")?;
        tail.status = status;
        Ok(tail)
    }

    /// Removes a tail that never finished, marking the returned turn `Errored`.
    pub fn discard_tail(&mut self) -> SessionResult<Turn> {
        self.open_tail_mut("transcript-discard-tail")?;
        let mut turn = self.turns.pop().ok_or_else(|| {
            InvalidStateSnafu {
                stage: "transcript-discard-tail",
                details: "transcript is empty",
            }
            .build()
        })?;
        turn.status = TurnStatus::Errored;
        Ok(turn)
    }

    /// Finalized turns in order, suitable as inference context.
    pub fn finalized(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter().filter(|turn| turn.status.is_terminal())
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Point-in-time copy of every turn. Later mutation never shows through.
    pub fn snapshot(&self) -> Arc<[Turn]> {
        Arc::from(self.turns.as_slice())
    }

    fn streaming_tail_mut(&mut self, stage: &'static str) -> SessionResult<&mut Turn> {
        match self.turns.last_mut() {
            Some(tail) if tail.status.is_streaming() => Ok(tail),
            Some(tail) => InvalidStateSnafu {
                stage,
                details: format!("tail turn is {:?}, not streaming", tail.status),
            }
            .fail(),
            None => InvalidStateSnafu {
                stage,
                details: "transcript is empty",
            }
            .fail(),
        }
    }

    fn open_tail_mut(&mut self, stage: &'static str) -> SessionResult<&mut Turn> {
        match self.turns.last_mut() {
            Some(tail) if !tail.status.is_terminal() => Ok(tail),
            Some(tail) => InvalidStateSnafu {
                stage,
                details: format!("tail turn is already {:?}", tail.status),
            }
            .fail(),
            None => InvalidStateSnafu {
                stage,
                details: "transcript is empty",
            }
            .fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;

    fn streaming_transcript() -> (Transcript, StreamTarget) {
        let target = StreamTarget::new(1);
        let mut transcript = Transcript::new();
        transcript.append(Turn::user("hi")).unwrap();
        transcript.append(Turn::assistant_pending()).unwrap();
        transcript.start_streaming(target).unwrap();
        (transcript, target)
    }

    #[test]
    fn mutating_an_empty_transcript_is_invalid() {
        let mut transcript = Transcript::new();
        assert!(matches!(
            transcript.mutate_tail("x"),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[test]
    fn mutating_a_finalized_tail_is_invalid() {
        let (mut transcript, _) = streaming_transcript();
        transcript.extend_tail("Hello").unwrap();
        transcript.finalize(TurnStatus::Complete).unwrap();

        assert!(matches!(
            transcript.extend_tail("!"),
            Err(SessionError::InvalidState { .. })
        ));
        assert!(matches!(
            transcript.finalize(TurnStatus::Aborted),
            Err(SessionError::InvalidState { .. })
        ));
        assert_eq!(transcript.tail().unwrap().content, "Hello");
        assert_eq!(transcript.tail().unwrap().status, TurnStatus::Complete);
    }

    #[test]
    fn pending_tail_cannot_be_mutated_until_streaming() {
        let mut transcript = Transcript::new();
        transcript.append(Turn::assistant_pending()).unwrap();
        assert!(transcript.extend_tail("x").is_err());

        transcript.start_streaming(StreamTarget::new(9)).unwrap();
        transcript.mutate_tail("replaced").unwrap();
        assert_eq!(transcript.tail().unwrap().content, "replaced");
        assert_eq!(transcript.streaming_target(), Some(StreamTarget::new(9)));
    }

    #[test]
    fn snapshot_is_isolated_from_later_increments() {
        let (mut transcript, _) = streaming_transcript();
        transcript.extend_tail("He").unwrap();
        let before = transcript.snapshot();
        transcript.extend_tail("llo").unwrap();

        assert_eq!(before[1].content, "He");
        assert_eq!(transcript.snapshot()[1].content, "Hello");
    }

    #[test]
    fn append_is_rejected_while_tail_is_open() {
        let (mut transcript, _) = streaming_transcript();
        assert!(transcript.append(Turn::user("again")).is_err());
        assert_eq!(transcript.len(), 2);
    }

    #[test]
    fn system_turns_never_enter_the_transcript() {
        let mut transcript = Transcript::new();
        let system = Turn::new(Role::System, "be brief", TurnStatus::Complete);
        assert!(transcript.append(system).is_err());
        assert!(transcript.is_empty());
    }

    #[test]
    fn timestamps_never_go_backwards() {
        let mut transcript = Transcript::new();
        transcript.append(Turn::user("late").with_timestamp(500)).unwrap();
        transcript.append(Turn::user("early").with_timestamp(100)).unwrap();

        let snapshot = transcript.snapshot();
        assert_eq!(snapshot[0].timestamp_ms, 500);
        assert_eq!(snapshot[1].timestamp_ms, 500);
    }

    #[test]
    fn discarded_tail_is_removed_and_reported_errored() {
        let (mut transcript, _) = streaming_transcript();
        transcript.extend_tail("partial").unwrap();

        let discarded = transcript.discard_tail().unwrap();
        assert_eq!(discarded.status, TurnStatus::Errored);
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript.tail().unwrap().role, Role::User);
        assert!(transcript.discard_tail().is_err());
    }

    #[test]
    fn finalize_requires_a_terminal_status() {
        let (mut transcript, target) = streaming_transcript();
        assert!(transcript.finalize(TurnStatus::Streaming(target)).is_err());
        assert!(transcript.finalize(TurnStatus::Pending).is_err());
        assert_eq!(transcript.streaming_target(), Some(target));
    }
}
