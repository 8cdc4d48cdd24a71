pub mod error;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{MessageId, SessionId};
pub use sqlite::SqliteStorage;
pub use types::{
    DEFAULT_SESSION_TITLE, MessageRecord, MessageRole, MessageStatus, NewMessage, NewSession,
    SessionRecord,
};

pub trait SessionStore: Send + Sync {
    fn create_session(&self, input: NewSession) -> StorageResult<SessionRecord>;
    fn get_session(&self, session_id: SessionId) -> StorageResult<Option<SessionRecord>>;
}

/// Key-ordered append/query log of finalized messages.
pub trait MessageStore: Send + Sync {
    /// Appends after every message already stored for the session.
    fn append_message(
        &self,
        session_id: SessionId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord>;
    /// Returns messages in ascending append order.
    fn list_messages(&self, session_id: SessionId) -> StorageResult<Vec<MessageRecord>>;
}

pub trait Storage: SessionStore + MessageStore {}

impl<T> Storage for T where T: SessionStore + MessageStore {}
