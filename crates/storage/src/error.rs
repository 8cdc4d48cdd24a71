use snafu::Snafu;

use super::ids::SessionId;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("session {session_id} does not exist (`{stage}`)"))]
    SessionNotFound {
        stage: &'static str,
        session_id: SessionId,
    },
    #[snafu(display("'{raw}' is not a valid {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    /// A stored row cannot be mapped back into a record.
    #[snafu(display("corrupt record on `{stage}`: {details}"))]
    CorruptRecord {
        stage: &'static str,
        details: String,
    },
    /// Each call opens its own connection, so an in-memory database would not
    /// outlive the migration that created its tables.
    #[snafu(display("in-memory database '{database_location}' is not supported"))]
    InMemoryDatabase {
        stage: &'static str,
        database_location: String,
    },
    #[snafu(display("cannot create database directory {path}"))]
    CreateDatabaseDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("invalid database url '{database_url}'"))]
    DatabaseUrl {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("cannot connect to '{database_url}' on `{stage}`"))]
    Connect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("pragma '{pragma}' rejected"))]
    Pragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("schema migration failed"))]
    Migrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("query failed on `{stage}`: {source}"))]
    Query {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("cannot spawn database worker for `{stage}`"))]
    WorkerSpawn {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("cannot build database worker runtime"))]
    WorkerRuntime {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("database worker for `{stage}` panicked"))]
    WorkerPanicked { stage: &'static str },
}

pub type StorageResult<T> = Result<T, StorageError>;
