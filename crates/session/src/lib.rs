mod controller;
mod error;
mod persistence;
mod runtime;
mod stream;
mod transcript;
mod turn;

pub use controller::{Phase, SessionController, SessionOptions, SessionSnapshot, StreamOutcome};
pub use error::{SessionError, SessionResult};
pub use persistence::{
    NoticeReceiver, NoticeSender, PersistenceSync, PersistenceTarget, SessionNotice,
    load_history, load_history_or_empty,
};
pub use runtime::{SessionHandle, SessionRuntime};
pub use stream::TokenStream;
pub use transcript::Transcript;
pub use turn::{Role, Turn, TurnStatus};

/// Identity transform from raw model text to display text.
///
/// Markdown or syntax highlighting belongs to the presentation layer.
pub fn render(text: &str) -> &str {
    text
}
