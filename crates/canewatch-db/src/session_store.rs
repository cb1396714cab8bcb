//! Session lifecycle with optimistic concurrency.
//!
//! A session moves `active <-> paused` and ends exactly once as `completed`
//! or `aborted`. Every transition is a read of the current status and
//! version followed by a guarded update:
//!
//! ```sql
//! UPDATE sessions SET status = $3, end_ts = $4, last_updated = $5, version = version + 1
//! WHERE id = $1 AND version = $2 AND end_ts IS NULL
//! ```
//!
//! Zero affected rows means another writer got there first. That is an
//! expected outcome ([`SessionUpdate::Conflict`]), not an error, and it is
//! never retried.

use canewatch_types::{Session, SessionId, SessionMetadata, SessionStatus};
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::Instrument;

use crate::error::{ErrorCategory, PersistenceError, StoreError};
use crate::persistence::Persistence;

/// Creator recorded when the metadata names none.
const DEFAULT_CREATOR: &str = "system";

/// Outcome of a lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionUpdate {
    /// The transition was written; the session is now at `version`.
    Applied {
        /// Version after the transition.
        version: i64,
    },
    /// The session changed since it was read. Re-read and decide again.
    Conflict {
        /// Version the update was conditioned on.
        expected_version: i64,
    },
    /// No session has this identifier.
    NotFound,
    /// The state machine does not allow this move (including any move out
    /// of a terminal state).
    Rejected {
        /// Current status.
        from: SessionStatus,
        /// Requested status.
        to: SessionStatus,
    },
}

impl SessionUpdate {
    /// Whether the transition was written.
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// A guarded status change, applied only if the stored version matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionChange {
    /// Session to change.
    pub id: SessionId,
    /// Version the caller read.
    pub expected_version: i64,
    /// New status.
    pub status: SessionStatus,
    /// End timestamp, set when `status` is terminal.
    pub end_ts: Option<DateTime<Utc>>,
    /// Transition time.
    pub last_updated: DateTime<Utc>,
}

/// Operations on the `sessions` table.
pub struct SessionStore<'a> {
    db: &'a Persistence,
}

impl<'a> SessionStore<'a> {
    /// Create a session store bound to a persistence handle.
    pub const fn new(db: &'a Persistence) -> Self {
        Self { db }
    }

    /// Open a new active session at version 1.
    ///
    /// The identifier comes from `metadata` or is generated.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::DuplicateSession`] if the identifier is
    /// taken, or [`PersistenceError::Store`] if the store fails.
    pub async fn create(&self, metadata: &SessionMetadata) -> Result<SessionId, PersistenceError> {
        let now = self.db.now();
        let id = metadata
            .session_id
            .clone()
            .unwrap_or_else(|| SessionId::generate(now));

        async {
            if self.get(&id).await?.is_some() {
                tracing::warn!("Session already exists");
                return Err(PersistenceError::DuplicateSession(id.clone()));
            }

            let session = Session {
                id: id.clone(),
                start_ts: now,
                end_ts: None,
                status: SessionStatus::Active,
                created_by: metadata
                    .created_by
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CREATOR.to_owned()),
                last_updated: now,
                version: 1,
            };

            let provider = self.db.provider();
            let session = &session;
            match self
                .db
                .run("insert_session", move || provider.insert_session(session))
                .await
            {
                Ok(()) => {}
                // Lost a race with another creator between the check and the insert.
                Err(PersistenceError::Store { failure, .. })
                    if failure.category == ErrorCategory::Constraint
                        && failure.code.as_deref() == Some("23505") =>
                {
                    return Err(PersistenceError::DuplicateSession(id.clone()));
                }
                Err(e) => return Err(e),
            }

            tracing::info!(created_by = %session.created_by, "Session created");
            Ok(id.clone())
        }
        .instrument(tracing::info_span!("create_session", session_id = %id))
        .await
    }

    /// Fetch a session by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the store fails.
    pub async fn get(&self, id: &SessionId) -> Result<Option<Session>, PersistenceError> {
        let provider = self.db.provider();
        self.db
            .run("fetch_session", move || provider.fetch_session(id))
            .await
    }

    /// Move a session to `new_status`, conditioned on the version read just
    /// before.
    ///
    /// A terminal `new_status` ends the session (see [`SessionStore::end`]).
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the store fails.
    pub async fn update_status(
        &self,
        id: &SessionId,
        new_status: SessionStatus,
    ) -> Result<SessionUpdate, PersistenceError> {
        let Some(current) = self.get(id).await? else {
            return Ok(SessionUpdate::NotFound);
        };
        self.transition(&current, current.version, new_status).await
    }

    /// Move a session to `new_status`, conditioned on a version the caller
    /// cached earlier. A stale version yields [`SessionUpdate::Conflict`].
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the store fails.
    pub async fn update_status_at(
        &self,
        id: &SessionId,
        new_status: SessionStatus,
        expected_version: i64,
    ) -> Result<SessionUpdate, PersistenceError> {
        let Some(current) = self.get(id).await? else {
            return Ok(SessionUpdate::NotFound);
        };
        self.transition(&current, expected_version, new_status)
            .await
    }

    /// Pause an active session.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the store fails.
    pub async fn pause(&self, id: &SessionId) -> Result<SessionUpdate, PersistenceError> {
        self.update_status(id, SessionStatus::Paused).await
    }

    /// Resume a paused session.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the store fails.
    pub async fn resume(&self, id: &SessionId) -> Result<SessionUpdate, PersistenceError> {
        self.update_status(id, SessionStatus::Active).await
    }

    /// End a session as `completed` or `aborted`, stamping `end_ts`.
    ///
    /// Ending an already ended session returns [`SessionUpdate::Rejected`].
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidArgument`] if `final_status` is not
    /// terminal, or [`PersistenceError::Store`] if the store fails.
    pub async fn end(
        &self,
        id: &SessionId,
        final_status: SessionStatus,
    ) -> Result<SessionUpdate, PersistenceError> {
        if !final_status.is_terminal() {
            return Err(PersistenceError::InvalidArgument(format!(
                "a session can only end as completed or aborted, not {final_status}"
            )));
        }
        self.update_status(id, final_status).await
    }

    /// Whether records may be attached: the session exists, is active, and
    /// has not ended.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the store fails.
    pub async fn validate(&self, id: &SessionId) -> Result<bool, PersistenceError> {
        Ok(self.get(id).await?.is_some_and(|session| session.is_open()))
    }

    /// All active sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the store fails.
    pub async fn list_active(&self) -> Result<Vec<Session>, PersistenceError> {
        let provider = self.db.provider();
        self.db
            .run("list_sessions", move || {
                provider.list_sessions(Some(SessionStatus::Active))
            })
            .await
    }

    /// Sessions that started within `[from, to]`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidArgument`] if `from` is after `to`,
    /// or [`PersistenceError::Store`] if the store fails.
    pub async fn list_started_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Session>, PersistenceError> {
        if from > to {
            return Err(PersistenceError::InvalidArgument(format!(
                "range start {from} is after range end {to}"
            )));
        }
        let provider = self.db.provider();
        let sessions = self
            .db
            .run("list_sessions", move || provider.list_sessions(None))
            .await?;
        Ok(sessions
            .into_iter()
            .filter(|session| session.start_ts >= from && session.start_ts <= to)
            .collect())
    }

    async fn transition(
        &self,
        current: &Session,
        expected_version: i64,
        to: SessionStatus,
    ) -> Result<SessionUpdate, PersistenceError> {
        let from = current.status;
        let span = tracing::info_span!(
            "update_session_status",
            session_id = %current.id,
            from = %from,
            to = %to,
            expected_version
        );

        async {
            if expected_version != current.version {
                tracing::warn!(current_version = current.version, "Session version conflict");
                return Ok(SessionUpdate::Conflict { expected_version });
            }
            if current.end_ts.is_some() || !from.can_transition_to(to) {
                tracing::warn!("Session transition rejected");
                return Ok(SessionUpdate::Rejected { from, to });
            }

            let now = self.db.now();
            let change = SessionChange {
                id: current.id.clone(),
                expected_version,
                status: to,
                end_ts: to.is_terminal().then_some(now),
                last_updated: now,
            };
            let provider = self.db.provider();
            let change = &change;
            let applied = self
                .db
                .run("update_session", move || provider.update_session(change))
                .await?;

            if applied {
                let version = expected_version.saturating_add(1);
                tracing::info!(version, "Session status updated");
                Ok(SessionUpdate::Applied { version })
            } else {
                tracing::warn!("Session version conflict");
                Ok(SessionUpdate::Conflict { expected_version })
            }
        }
        .instrument(span)
        .await
    }
}

// =========================================================================
// PostgreSQL primitives
// =========================================================================

/// Row shape of the `sessions` table.
#[derive(Debug, Clone, sqlx::FromRow)]
struct SessionRow {
    id: String,
    start_ts: DateTime<Utc>,
    end_ts: Option<DateTime<Utc>>,
    status: String,
    created_by: String,
    last_updated: DateTime<Utc>,
    version: i64,
}

impl TryFrom<SessionRow> for Session {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let status = SessionStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Decode(format!("unknown session status: {}", row.status)))?;
        Ok(Self {
            id: SessionId::new(row.id),
            start_ts: row.start_ts,
            end_ts: row.end_ts,
            status,
            created_by: row.created_by,
            last_updated: row.last_updated,
            version: row.version,
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, start_ts, end_ts, status, created_by, last_updated, version FROM sessions";

pub(crate) async fn insert_row(conn: &mut PgConnection, session: &Session) -> Result<(), StoreError> {
    sqlx::query(
        r"INSERT INTO sessions (id, start_ts, end_ts, status, created_by, last_updated, version)
          VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(session.id.as_str())
    .bind(session.start_ts)
    .bind(session.end_ts)
    .bind(session.status.as_str())
    .bind(&session.created_by)
    .bind(session.last_updated)
    .bind(session.version)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn select_row(
    conn: &mut PgConnection,
    id: &SessionId,
) -> Result<Option<Session>, StoreError> {
    let row = sqlx::query_as::<_, SessionRow>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    row.map(Session::try_from).transpose()
}

pub(crate) async fn update_row(
    conn: &mut PgConnection,
    change: &SessionChange,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r"UPDATE sessions
          SET status = $3, end_ts = $4, last_updated = $5, version = version + 1
          WHERE id = $1 AND version = $2 AND end_ts IS NULL",
    )
    .bind(change.id.as_str())
    .bind(change.expected_version)
    .bind(change.status.as_str())
    .bind(change.end_ts)
    .bind(change.last_updated)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub(crate) async fn select_rows(
    conn: &mut PgConnection,
    status: Option<SessionStatus>,
) -> Result<Vec<Session>, StoreError> {
    let rows = sqlx::query_as::<_, SessionRow>(&format!(
        "{SELECT_COLUMNS} WHERE ($1::TEXT IS NULL OR status = $1) ORDER BY start_ts DESC"
    ))
    .bind(status.map(SessionStatus::as_str))
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(Session::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str) -> SessionRow {
        let now = Utc::now();
        SessionRow {
            id: "20250421-080000-deadbeef".to_owned(),
            start_ts: now,
            end_ts: None,
            status: status.to_owned(),
            created_by: "system".to_owned(),
            last_updated: now,
            version: 3,
        }
    }

    #[test]
    fn row_maps_to_session() {
        let session = Session::try_from(row("paused"));
        assert!(session.is_ok());
        let session = session.unwrap_or_else(|_| unreachable!());
        assert_eq!(session.status, SessionStatus::Paused);
        assert_eq!(session.version, 3);
    }

    #[test]
    fn unknown_status_is_a_decode_error() {
        assert!(matches!(
            Session::try_from(row("archived")),
            Err(StoreError::Decode(_))
        ));
    }

    #[test]
    fn only_applied_counts_as_applied() {
        assert!(SessionUpdate::Applied { version: 2 }.is_applied());
        assert!(!SessionUpdate::Conflict { expected_version: 1 }.is_applied());
        assert!(!SessionUpdate::NotFound.is_applied());
        assert!(
            !SessionUpdate::Rejected {
                from: SessionStatus::Completed,
                to: SessionStatus::Aborted
            }
            .is_applied()
        );
    }
}
