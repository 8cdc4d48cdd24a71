use std::sync::Arc;

use parlor_storage::{MessageStore, SessionId};
use snafu::ResultExt;
use tokio::sync::mpsc;

use crate::error::{BlockingTaskSnafu, PersistenceSnafu, SessionResult};
use crate::turn::Turn;

/// Non-fatal notification surfaced to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// The inference call failed; any partial answer was discarded.
    TransportFailed { message: String },
    /// A finalized turn could not be stored. The transcript is unaffected.
    PersistenceFailed { message: String },
    /// Stored history could not be loaded; the session started empty.
    HistoryUnavailable { message: String },
}

pub type NoticeSender = mpsc::UnboundedSender<SessionNotice>;
pub type NoticeReceiver = mpsc::UnboundedReceiver<SessionNotice>;

/// Backend plus the session its turns belong to.
#[derive(Clone)]
pub struct PersistenceTarget {
    pub store: Arc<dyn MessageStore>,
    pub session_id: SessionId,
}

/// Best-effort durable append of finalized turns.
///
/// Writes are handed to one background writer so the backend sees them in
/// the order they were issued. Without a target every call is a no-op.
pub struct PersistenceSync {
    session_id: Option<SessionId>,
    queue: Option<mpsc::UnboundedSender<Turn>>,
}

impl PersistenceSync {
    pub fn ephemeral() -> Self {
        Self {
            session_id: None,
            queue: None,
        }
    }

    /// Spawns the writer task on the current runtime.
    pub fn spawn(target: PersistenceTarget, notices: NoticeSender) -> Self {
        let (queue, jobs) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(target.clone(), jobs, notices));

        Self {
            session_id: Some(target.session_id),
            queue: Some(queue),
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    /// Queues `turn` for storage and returns immediately.
    pub fn persist(&self, turn: &Turn) {
        let Some(queue) = &self.queue else {
            return;
        };
        if turn.to_new_message().is_none() {
            tracing::debug!(role = ?turn.role, status = ?turn.status, "turn is not persistable");
            return;
        }
        if queue.send(turn.clone()).is_err() {
            tracing::warn!("persistence writer is gone; dropping turn");
        }
    }
}

async fn run_writer(
    target: PersistenceTarget,
    mut jobs: mpsc::UnboundedReceiver<Turn>,
    notices: NoticeSender,
) {
    while let Some(turn) = jobs.recv().await {
        let Some(message) = turn.to_new_message() else {
            continue;
        };
        let store = target.store.clone();
        let session_id = target.session_id;

        let outcome = tokio::task::spawn_blocking(move || {
            store.append_message(session_id, message)
        })
        .await
        .context(BlockingTaskSnafu {
            stage: "persist-append-join",
        })
        .and_then(|stored| {
            stored.context(PersistenceSnafu {
                stage: "persist-append",
            })
        });

        match outcome {
            Ok(record) => {
                tracing::debug!(session_id = %session_id, seq = record.seq, "turn persisted");
            }
            Err(error) => {
                tracing::warn!(session_id = %session_id, error = %error, "failed to persist turn");
                let notice = SessionNotice::PersistenceFailed {
                    message: error.to_string(),
                };
                if notices.send(notice).is_err() {
                    tracing::debug!("notice receiver dropped");
                }
            }
        }
    }
}

/// Reads a session's stored turns in ascending creation order.
pub async fn load_history(target: &PersistenceTarget) -> SessionResult<Vec<Turn>> {
    let store = target.store.clone();
    let session_id = target.session_id;

    let records = tokio::task::spawn_blocking(move || store.list_messages(session_id))
        .await
        .context(BlockingTaskSnafu {
            stage: "load-history-join",
        })?
        .context(PersistenceSnafu {
            stage: "load-history",
        })?;

    Ok(records.into_iter().map(Turn::from_record).collect())
}

/// Like [`load_history`], but a failing backend yields an empty history and a notice.
pub async fn load_history_or_empty(target: &PersistenceTarget, notices: &NoticeSender) -> Vec<Turn> {
    match load_history(target).await {
        Ok(turns) => {
            tracing::info!(
                session_id = %target.session_id,
                turn_count = turns.len(),
                "loaded session history"
            );
            turns
        }
        Err(error) => {
            tracing::warn!(
                session_id = %target.session_id,
                error = %error,
                "failed to load session history; starting empty"
            );
            let notice = SessionNotice::HistoryUnavailable {
                message: error.to_string(),
            };
            if notices.send(notice).is_err() {
                tracing::debug!("notice receiver dropped");
            }
            Vec::new()
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parlor_storage::{MessageRole, MessageStatus};

    use super::testing::RecordingStore;
    use super::*;
    use crate::turn::{Role, TurnStatus};

    fn target(store: Arc<RecordingStore>) -> PersistenceTarget {
        PersistenceTarget {
            store,
            session_id: SessionId::new_v7(),
        }
    }

    async fn wait_for_appends(store: &RecordingStore, count: usize) {
        for _ in 0..200 {
            if store.appended().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} appends, saw {}", store.appended().len());
    }

    #[tokio::test]
    async fn persist_preserves_issue_order() {
        let store = Arc::new(RecordingStore::default());
        let (notices, _notice_rx) = mpsc::unbounded_channel();
        let sync = PersistenceSync::spawn(target(store.clone()), notices);

        sync.persist(&Turn::user("hi"));
        sync.persist(&Turn::new(Role::Assistant, "Hello", TurnStatus::Complete));

        wait_for_appends(&store, 2).await;
        let appended = store.appended();
        assert_eq!(appended[0].role, MessageRole::User);
        assert_eq!(appended[0].content, "hi");
        assert_eq!(appended[1].role, MessageRole::Assistant);
        assert_eq!(appended[1].status, MessageStatus::Complete);
    }

    #[tokio::test]
    async fn ephemeral_sync_never_touches_a_backend() {
        let sync = PersistenceSync::ephemeral();
        sync.persist(&Turn::user("hi"));
        assert_eq!(sync.session_id(), None);
    }

    #[tokio::test]
    async fn failed_append_becomes_a_notice() {
        let store = Arc::new(RecordingStore {
            fail_appends: true,
            ..RecordingStore::default()
        });
        let (notices, mut notice_rx) = mpsc::unbounded_channel();
        let sync = PersistenceSync::spawn(target(store), notices);

        sync.persist(&Turn::user("hi"));

        let notice = tokio::time::timeout(Duration::from_secs(2), notice_rx.recv())
            .await
            .unwrap();
        assert!(matches!(notice, Some(SessionNotice::PersistenceFailed { .. })));
    }

    #[tokio::test]
    async fn unreadable_history_starts_empty() {
        let store = Arc::new(RecordingStore {
            fail_lists: true,
            ..RecordingStore::default()
        });
        let (notices, mut notice_rx) = mpsc::unbounded_channel();

        let turns = load_history_or_empty(&target(store), &notices).await;

        assert!(turns.is_empty());
        assert!(matches!(
            notice_rx.try_recv(),
            Ok(SessionNotice::HistoryUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn unreadable_history_without_a_listener_still_starts_empty() {
        let store = Arc::new(RecordingStore {
            fail_lists: true,
            ..RecordingStore::default()
        });
        let (notices, notice_rx) = mpsc::unbounded_channel();
        drop(notice_rx);

        assert!(load_history_or_empty(&target(store), &notices).await.is_empty());
    }
}
