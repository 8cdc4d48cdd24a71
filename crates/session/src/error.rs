use parlor_llm::StreamTarget;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    /// Network or vendor failure. The user may resubmit.
    #[snafu(display("transport failed on `{stage}`: {message}"))]
    Transport {
        stage: &'static str,
        message: String,
    },
    /// A caller bypassed the busy gate.
    #[snafu(display("stream {active:?} is still open; `{stage}` rejected"))]
    ConcurrentStream {
        stage: &'static str,
        active: StreamTarget,
    },
    /// Best-effort persistence failed. In-memory state is unaffected.
    #[snafu(display("persistence failed on `{stage}`: {source}"))]
    Persistence {
        stage: &'static str,
        source: parlor_storage::StorageError,
    },
    #[snafu(display("invalid session state on `{stage}`: {details}"))]
    InvalidState {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("{field} must not be empty"))]
    EmptyInput {
        stage: &'static str,
        field: &'static str,
    },
    #[snafu(display("blocking task failed on `{stage}`: {source}"))]
    BlockingTask {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
    #[snafu(display("session runtime has stopped; `{stage}` was not delivered"))]
    RuntimeStopped { stage: &'static str },
}

pub type SessionResult<T> = Result<T, SessionError>;
