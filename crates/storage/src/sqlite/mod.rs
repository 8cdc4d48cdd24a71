use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection};

use super::error::{
    ConnectSnafu, CorruptRecordSnafu, CreateDatabaseDirectorySnafu, DatabaseUrlSnafu,
    InMemoryDatabaseSnafu, MigrateSnafu, PragmaSnafu, QuerySnafu, SessionNotFoundSnafu, StorageError, StorageResult,
    WorkerPanickedSnafu, WorkerRuntimeSnafu, WorkerSpawnSnafu,
};
use super::ids::{MessageId, SessionId};
use super::types::{
    DEFAULT_SESSION_TITLE, MessageRecord, MessageRole, MessageStatus, NewMessage, NewSession,
    SessionRecord,
};
use super::{MessageStore, SessionStore};

/// SQLite-backed session and message log.
///
/// The store traits are synchronous so callers can use them from any context;
/// every call opens its own connection on a short-lived worker runtime.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure!(
            !is_in_memory(database_location),
            InMemoryDatabaseSnafu {
                stage: "sqlite-open-check-location",
                database_location,
            }
        );
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(DatabaseUrlSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(ConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(MigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;
        pool.close().await;

        tracing::debug!(database_url = %database_url, "sqlite storage ready");
        Ok(Self { database_url })
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // A dedicated thread with its own current-thread runtime keeps these sync calls
        // safe to issue from inside another tokio runtime.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-store-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(WorkerRuntimeSnafu {
                        stage: "sqlite-store-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(WorkerSpawnSnafu {
                stage: "sqlite-store-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => WorkerPanickedSnafu { stage }.fail(),
        }
    }
}

impl SessionStore for SqliteStorage {
    fn create_session(&self, input: NewSession) -> StorageResult<SessionRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("session-create", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-create-connect").await?;
            let title = if input.title.trim().is_empty() {
                DEFAULT_SESSION_TITLE.to_string()
            } else {
                input.title.trim().to_string()
            };
            let session_id = SessionId::new_v7();
            let now = unix_timestamp_seconds();

            sqlx::query(
                "INSERT INTO sessions (id, title, created_at, updated_at) VALUES (?, ?, ?, ?)",
            )
            .bind(session_id.to_string())
            .bind(title.clone())
            .bind(now)
            .bind(now)
            .execute(&mut connection)
            .await
            .context(QuerySnafu {
                stage: "session-create-insert",
            })?;

            Ok(SessionRecord {
                id: session_id,
                title,
                updated_at_unix_seconds: i64_to_u64(now, "session-create-updated-at")?,
            })
        })
    }

    fn get_session(&self, session_id: SessionId) -> StorageResult<Option<SessionRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("session-get", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-get-connect").await?;
            let row = sqlx::query_as::<_, SessionRow>(
                "SELECT id, title, updated_at FROM sessions WHERE id = ?",
            )
            .bind(session_id.to_string())
            .fetch_optional(&mut connection)
            .await
            .context(QuerySnafu {
                stage: "session-get-query",
            })?;

            row.map(session_row_to_record).transpose()
        })
    }
}

impl MessageStore for SqliteStorage {
    fn append_message(
        &self,
        session_id: SessionId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-append", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-append-connect").await?;
            let mut tx = connection.begin().await.context(QuerySnafu {
                stage: "message-append-begin",
            })?;

            let session_exists =
                sqlx::query_scalar::<_, i64>("SELECT 1 FROM sessions WHERE id = ? LIMIT 1")
                    .bind(session_id.to_string())
                    .fetch_optional(&mut *tx)
                    .await
                    .context(QuerySnafu {
                        stage: "message-append-session-exists",
                    })?
                    .is_some();
            if !session_exists {
                return SessionNotFoundSnafu {
                    stage: "message-append-missing-session",
                    session_id,
                }
                .fail();
            }

            let next_seq = sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE session_id = ?",
            )
            .bind(session_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .context(QuerySnafu {
                stage: "message-append-next-seq",
            })?;

            let message_id = MessageId::new_v7();
            let created_at = u64_to_i64(input.created_at_unix_millis, "message-append-created-at")?;

            sqlx::query(
                "INSERT INTO messages (id, session_id, seq, role, status, content, created_at_ms) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(message_id.to_string())
            .bind(session_id.to_string())
            .bind(next_seq)
            .bind(role_to_sql(input.role))
            .bind(status_to_sql(input.status))
            .bind(input.content.clone())
            .bind(created_at)
            .execute(&mut *tx)
            .await
            .context(QuerySnafu {
                stage: "message-append-insert",
            })?;

            sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
                .bind(unix_timestamp_seconds())
                .bind(session_id.to_string())
                .execute(&mut *tx)
                .await
                .context(QuerySnafu {
                    stage: "message-append-touch-session",
                })?;

            tx.commit().await.context(QuerySnafu {
                stage: "message-append-commit",
            })?;

            Ok(MessageRecord {
                id: message_id,
                session_id,
                seq: i64_to_u64(next_seq, "message-append-seq")?,
                role: input.role,
                status: input.status,
                content: input.content,
                created_at_unix_millis: input.created_at_unix_millis,
            })
        })
    }

    fn list_messages(&self, session_id: SessionId) -> StorageResult<Vec<MessageRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-list-connect").await?;
            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, session_id, seq, role, status, content, created_at_ms FROM messages WHERE session_id = ? ORDER BY seq ASC, id ASC",
            )
            .bind(session_id.to_string())
            .fetch_all(&mut connection)
            .await
            .context(QuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    title: String,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    session_id: String,
    seq: i64,
    role: String,
    status: String,
    content: String,
    created_at_ms: i64,
}

fn session_row_to_record(row: SessionRow) -> StorageResult<SessionRecord> {
    Ok(SessionRecord {
        id: SessionId::parse(&row.id)?,
        title: row.title,
        updated_at_unix_seconds: i64_to_u64(row.updated_at, "session-row-updated-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        session_id: SessionId::parse(&row.session_id)?,
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        role: role_from_sql(&row.role)?,
        status: status_from_sql(&row.status)?,
        content: row.content,
        created_at_unix_millis: i64_to_u64(row.created_at_ms, "message-row-created-at")?,
    })
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(ConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&mut connection)
        .await
        .context(PragmaSnafu {
            stage: "sqlite-store-pragma-foreign-keys",
            pragma: "foreign_keys",
        })?;
    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(PragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

fn role_to_sql(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => CorruptRecordSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn status_to_sql(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Complete => "complete",
        MessageStatus::Aborted => "aborted",
    }
}

fn status_from_sql(raw: &str) -> StorageResult<MessageStatus> {
    match raw {
        "complete" => Ok(MessageStatus::Complete),
        "aborted" => Ok(MessageStatus::Aborted),
        _ => CorruptRecordSnafu {
            stage: "message-status-from-sql",
            details: format!("unknown message status '{raw}'"),
        }
        .fail(),
    }
}

fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_secs() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::CorruptRecord {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::CorruptRecord {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateDatabaseDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn is_in_memory(database_location: &str) -> bool {
    database_location.contains(":memory:") || database_location.contains("mode=memory")
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    format!("sqlite://{database_location}")
}
