//! parlor: terminal chat against an OpenAI-compatible inference endpoint.
//!
//! Settings come from `<config dir>/parlor/settings.json` and `PARLOR_*`
//! environment variables. Logs go to stderr; set `RUST_LOG` to adjust.

mod repl;
mod settings;

use std::sync::Arc;

use parlor_llm::{LlmProvider, create_provider};
use parlor_session::{
    NoticeReceiver, PersistenceTarget, SessionError, SessionHandle, SessionNotice, SessionRuntime,
};
use parlor_storage::{
    DEFAULT_SESSION_TITLE, NewSession, SessionId, SessionStore, SqliteStorage, StorageError,
};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use crate::repl::{HELP, ReplCommand, TranscriptPrinter};
use crate::settings::{AppSettings, SettingsStore};

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("database path {path:?} is not valid UTF-8"))]
    DatabasePath {
        stage: &'static str,
        path: std::path::PathBuf,
    },
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("session {session_id} does not exist"))]
    UnknownSession {
        stage: &'static str,
        session_id: SessionId,
    },
    #[snafu(display("blocking task failed on `{stage}`: {source}"))]
    BlockingTask {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

type AppResult<T> = Result<T, AppError>;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    if let Err(error) = run().await {
        tracing::error!(error = %error, "parlor exited with an error");
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> AppResult<()> {
    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();
    tracing::info!(
        path = ?settings_store.config_path(),
        provider_id = %settings.provider_id,
        model_id = %settings.model,
        "settings loaded"
    );

    let provider = build_provider(&settings);
    let persistence = open_persistence(&settings).await?;
    if let Some(target) = &persistence {
        println!("session {}", target.session_id);
    }

    let (handle, notices) = SessionRuntime::spawn(settings.session_options(), provider, persistence);
    let printer = tokio::spawn(print_transcript(handle.clone()));
    let notice_printer = tokio::spawn(print_notices(notices));

    println!("model {}; {HELP}", handle.snapshot().selected_model);
    let outcome = read_commands(&handle, &settings_store).await;

    drop(handle);
    let _ = printer.await;
    let _ = notice_printer.await;
    outcome
}

fn build_provider(settings: &AppSettings) -> Option<Arc<dyn LlmProvider>> {
    let Some(config) = settings.to_provider_config() else {
        tracing::warn!("no API key configured; set PARLOR_API_KEY or api_key in settings.json");
        return None;
    };

    match create_provider(config) {
        Ok(provider) => {
            tracing::info!(provider_id = %provider.id(), name = %provider.name(), "provider ready");
            Some(provider)
        }
        Err(error) => {
            tracing::error!(error = %error, "failed to initialize provider");
            None
        }
    }
}

/// Opens the database and resolves the session to attach, if storage is configured.
async fn open_persistence(settings: &AppSettings) -> AppResult<Option<PersistenceTarget>> {
    let Some(path) = settings.database_path.clone() else {
        tracing::info!("no database configured; session is ephemeral");
        return Ok(None);
    };
    let location = path.to_str().context(DatabasePathSnafu {
        stage: "open-persistence",
        path: path.clone(),
    })?;

    let storage = SqliteStorage::open(location).await.context(StorageSnafu {
        stage: "open-persistence",
    })?;

    let requested = match settings.session_id.as_deref() {
        Some(raw) => Some(SessionId::parse(raw).context(StorageSnafu {
            stage: "parse-session-id",
        })?),
        None => None,
    };

    let session_storage = storage.clone();
    let session_id = tokio::task::spawn_blocking(move || resolve_session(&session_storage, requested))
        .await
        .context(BlockingTaskSnafu {
            stage: "resolve-session",
        })??;

    Ok(Some(PersistenceTarget {
        store: Arc::new(storage),
        session_id,
    }))
}

fn resolve_session(storage: &SqliteStorage, requested: Option<SessionId>) -> AppResult<SessionId> {
    if let Some(session_id) = requested {
        let session = storage.get_session(session_id).context(StorageSnafu {
            stage: "resume-session",
        })?;
        let session = session.context(UnknownSessionSnafu {
            stage: "resume-session",
            session_id,
        })?;
        tracing::info!(session_id = %session.id, title = %session.title, "resuming session");
        return Ok(session.id);
    }

    let session = storage
        .create_session(NewSession {
            title: DEFAULT_SESSION_TITLE.to_string(),
        })
        .context(StorageSnafu {
            stage: "create-session",
        })?;
    tracing::info!(session_id = %session.id, "created session");
    Ok(session.id)
}

async fn read_commands(handle: &SessionHandle, settings_store: &SettingsStore) -> AppResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
        stage: "read-command",
    })? {
        let outcome = match ReplCommand::parse(&line) {
            ReplCommand::Submit(text) => handle.submit(text).await,
            ReplCommand::Cancel => handle.cancel().await,
            ReplCommand::SelectModel(model_id) => {
                let outcome = handle.select_model(model_id).await;
                if outcome.is_ok() {
                    let selected = handle.snapshot().selected_model.clone();
                    remember_model(settings_store, &selected);
                    println!("model {selected}");
                }
                outcome
            }
            ReplCommand::Clear => handle.clear().await,
            ReplCommand::Help => {
                println!("{HELP}");
                Ok(())
            }
            ReplCommand::Quit => break,
            ReplCommand::Unrecognized(raw) => {
                if !raw.is_empty() {
                    println!("unknown command {raw}; {HELP}");
                }
                Ok(())
            }
        };

        match outcome {
            Ok(()) => {}
            Err(SessionError::RuntimeStopped { .. }) => break,
            Err(error) => eprintln!("! {error}"),
        }
    }

    if let Err(error) = handle.cancel().await {
        tracing::debug!(error = %error, "cancel on exit skipped");
    }
    Ok(())
}

/// Saves the selection as the default for the next launch.
fn remember_model(settings_store: &SettingsStore, model_id: &str) {
    let update = settings_store.update(|settings| settings.model = model_id.to_string());
    if let Err(error) = update {
        tracing::warn!(error = %error, "failed to save model selection");
    }
}

async fn print_transcript(handle: SessionHandle) {
    let mut snapshots = handle.subscribe();
    drop(handle);
    let mut printer = TranscriptPrinter::default();

    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        if let Err(error) = printer.print(&snapshot, &mut std::io::stdout()) {
            tracing::warn!(error = %error, "failed to write transcript");
        }
        if snapshots.changed().await.is_err() {
            break;
        }
    }
}

async fn print_notices(mut notices: NoticeReceiver) {
    while let Some(notice) = notices.recv().await {
        match notice {
            SessionNotice::TransportFailed { message } => {
                eprintln!("! response failed: {message}");
            }
            SessionNotice::PersistenceFailed { message } => {
                eprintln!("! could not save message: {message}");
            }
            SessionNotice::HistoryUnavailable { message } => {
                eprintln!("! history unavailable, starting empty: {message}");
            }
        }
    }
}
