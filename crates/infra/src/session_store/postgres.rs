//! Postgres-backed session store.
//!
//! One row per session in `chat_sessions`; `messages` and `meta` are JSONB.
//! Every mutation is a single guarded `UPDATE`, so concurrent deliveries of the
//! same task are arbitrated by the row lock Postgres takes for the update.
//!
//! ## Error Mapping
//!
//! | SQLx Error | SessionStoreError |
//! |------------|-------------------|
//! | Database (unique violation `23505`) on insert | `AlreadyExists` |
//! | Row decode failure | `Corrupt` |
//! | Anything else (pool closed, IO, protocol) | `Unavailable` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use parley_core::{ChatMessage, CommitOutcome, Session, SessionId, SessionMeta, SessionStatus, UserId};

use super::store::{BeginOutcome, SessionStore, SessionStoreError};

const SELECT_COLUMNS: &str = "session_id, owner_id, messages, status, meta, error, attempt, \
                              created_at, started_at, completed_at, failed_at";

#[derive(Debug, Clone)]
pub struct PostgresSessionStore {
    pool: Arc<PgPool>,
}

impl PostgresSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, SessionStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the table and the listing index if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), SessionStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_sessions (
                id           BIGSERIAL PRIMARY KEY,
                session_id   UUID        NOT NULL UNIQUE,
                owner_id     UUID        NOT NULL,
                messages     JSONB       NOT NULL DEFAULT '[]'::jsonb,
                status       TEXT        NOT NULL
                             CHECK (status IN ('queued', 'processing', 'completed', 'failed')),
                meta         JSONB       NOT NULL DEFAULT '{}'::jsonb,
                error        TEXT,
                attempt      INTEGER     NOT NULL DEFAULT 0 CHECK (attempt >= 0),
                created_at   TIMESTAMPTZ NOT NULL,
                started_at   TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                failed_at    TIMESTAMPTZ
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_table", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS chat_sessions_owner_created_idx \
             ON chat_sessions (owner_id, created_at DESC)",
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_index", e))?;

        Ok(())
    }

    async fn exists(&self, session_id: SessionId) -> Result<bool, SessionStoreError> {
        let row = sqlx::query("SELECT 1 FROM chat_sessions WHERE session_id = $1")
            .bind(session_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("exists", e))?;
        Ok(row.is_some())
    }

    /// A guarded update touched no row: either the fence is stale or the
    /// session does not exist.
    async fn stale_or_missing(&self, session_id: SessionId) -> Result<CommitOutcome, SessionStoreError> {
        if self.exists(session_id).await? {
            Ok(CommitOutcome::Stale)
        } else {
            Err(SessionStoreError::NotFound(session_id))
        }
    }
}

fn fence_param(fence: u32) -> Result<i32, SessionStoreError> {
    i32::try_from(fence).map_err(|_| SessionStoreError::Corrupt(format!("fence out of range: {fence}")))
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    #[instrument(skip(self, session), fields(session_id = %session.session_id), err)]
    async fn create(&self, session: &Session) -> Result<(), SessionStoreError> {
        let messages = serde_json::to_value(&session.messages)
            .map_err(|e| SessionStoreError::Corrupt(format!("messages: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO chat_sessions
                (session_id, owner_id, messages, status, meta, error, attempt,
                 created_at, started_at, completed_at, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(session.session_id.as_uuid())
        .bind(session.owner_id.as_uuid())
        .bind(messages)
        .bind(session.status.as_str())
        .bind(JsonValue::Object(session.meta.clone()))
        .bind(session.error.as_deref())
        .bind(fence_param(session.attempt)?)
        .bind(session.created_at)
        .bind(session.started_at)
        .bind(session.completed_at)
        .bind(session.failed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                SessionStoreError::AlreadyExists(session.session_id)
            }
            other => map_sqlx_error("create", other),
        })?;

        Ok(())
    }

    #[instrument(skip(self), fields(session_id = %session_id), err)]
    async fn get(&self, session_id: SessionId) -> Result<Option<Session>, SessionStoreError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM chat_sessions WHERE session_id = $1"))
            .bind(session_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(session_from_row).transpose()
    }

    #[instrument(skip(self), fields(session_id = %session_id, owner_id = %owner_id), err)]
    async fn get_owned(
        &self,
        session_id: SessionId,
        owner_id: UserId,
    ) -> Result<Option<Session>, SessionStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM chat_sessions WHERE session_id = $1 AND owner_id = $2"
        ))
        .bind(session_id.as_uuid())
        .bind(owner_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_owned", e))?;

        row.as_ref().map(session_from_row).transpose()
    }

    #[instrument(skip(self), fields(owner_id = %owner_id), err)]
    async fn list_for_owner(&self, owner_id: UserId, limit: usize) -> Result<Vec<Session>, SessionStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM chat_sessions WHERE owner_id = $1 \
             ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(owner_id.as_uuid())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_for_owner", e))?;

        rows.iter().map(session_from_row).collect()
    }

    #[instrument(skip(self), fields(session_id = %session_id), err)]
    async fn begin_attempt(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome, SessionStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE chat_sessions
               SET status = 'processing', attempt = attempt + 1, started_at = $2
             WHERE session_id = $1 AND status IN ('queued', 'processing')
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(session_id.as_uuid())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("begin_attempt", e))?;

        if let Some(row) = row {
            let session = session_from_row(&row)?;
            return Ok(BeginOutcome::Started {
                fence: session.attempt,
                session,
            });
        }

        // No row moved: the session is either terminal or absent.
        match self.get(session_id).await? {
            Some(session) => Ok(BeginOutcome::Terminal(session)),
            None => Ok(BeginOutcome::NotFound),
        }
    }

    #[instrument(skip(self, reply, meta), fields(session_id = %session_id, fence), err)]
    async fn complete(
        &self,
        session_id: SessionId,
        fence: u32,
        reply: &str,
        meta: SessionMeta,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, SessionStoreError> {
        let appended = serde_json::to_value([ChatMessage::assistant(reply)])
            .map_err(|e| SessionStoreError::Corrupt(format!("reply: {e}")))?;

        let result = sqlx::query(
            r#"
            UPDATE chat_sessions
               SET messages = messages || $3::jsonb,
                   status = 'completed',
                   meta = $4,
                   completed_at = $5
             WHERE session_id = $1 AND attempt = $2 AND status = 'processing'
            "#,
        )
        .bind(session_id.as_uuid())
        .bind(fence_param(fence)?)
        .bind(appended)
        .bind(JsonValue::Object(meta))
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        if result.rows_affected() == 1 {
            Ok(CommitOutcome::Applied)
        } else {
            self.stale_or_missing(session_id).await
        }
    }

    #[instrument(skip(self, error), fields(session_id = %session_id, fence), err)]
    async fn fail(
        &self,
        session_id: SessionId,
        fence: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, SessionStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE chat_sessions
               SET status = 'failed', error = $3, failed_at = $4
             WHERE session_id = $1 AND attempt = $2 AND status = 'processing'
            "#,
        )
        .bind(session_id.as_uuid())
        .bind(fence_param(fence)?)
        .bind(error)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;

        if result.rows_affected() == 1 {
            Ok(CommitOutcome::Applied)
        } else {
            self.stale_or_missing(session_id).await
        }
    }

    #[instrument(skip(self), err)]
    async fn list_orphaned(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Session>, SessionStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM chat_sessions \
             WHERE status = 'queued' AND attempt = 0 AND created_at < $1 \
             ORDER BY created_at ASC LIMIT $2"
        ))
        .bind(older_than)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_orphaned", e))?;

        rows.iter().map(session_from_row).collect()
    }
}

/// Raw column values of one `chat_sessions` row.
#[derive(Debug)]
struct SessionRow {
    session_id: Uuid,
    owner_id: Uuid,
    messages: JsonValue,
    status: String,
    meta: JsonValue,
    error: Option<String>,
    attempt: i32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for SessionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(SessionRow {
            session_id: row.try_get("session_id")?,
            owner_id: row.try_get("owner_id")?,
            messages: row.try_get("messages")?,
            status: row.try_get("status")?,
            meta: row.try_get("meta")?,
            error: row.try_get("error")?,
            attempt: row.try_get("attempt")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            failed_at: row.try_get("failed_at")?,
        })
    }
}

impl TryFrom<SessionRow> for Session {
    type Error = SessionStoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let corrupt = |field: &str, msg: String| {
            SessionStoreError::Corrupt(format!("session {}: {field}: {msg}", row.session_id))
        };

        let messages: Vec<ChatMessage> =
            serde_json::from_value(row.messages.clone()).map_err(|e| corrupt("messages", e.to_string()))?;
        if messages.is_empty() {
            return Err(corrupt("messages", "empty conversation".to_string()));
        }

        let status: SessionStatus = row.status.parse().map_err(|e: parley_core::DomainError| {
            corrupt("status", e.to_string())
        })?;

        let meta = match &row.meta {
            JsonValue::Object(map) => map.clone(),
            JsonValue::Null => SessionMeta::new(),
            other => return Err(corrupt("meta", format!("expected object, got {other}"))),
        };

        let attempt = u32::try_from(row.attempt).map_err(|e| corrupt("attempt", e.to_string()))?;

        Ok(Session {
            session_id: SessionId::from_uuid(row.session_id),
            owner_id: UserId::from_uuid(row.owner_id),
            messages,
            status,
            meta,
            error: row.error,
            attempt,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
        })
    }
}

fn session_from_row(row: &PgRow) -> Result<Session, SessionStoreError> {
    use sqlx::FromRow;
    let raw = SessionRow::from_row(row).map_err(|e| SessionStoreError::Corrupt(e.to_string()))?;
    Session::try_from(raw)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SessionStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            SessionStoreError::Unavailable(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            SessionStoreError::Corrupt(format!("decode error in {}: {}", operation, err))
        }
        other => SessionStoreError::Unavailable(format!("{} failed: {}", operation, other)),
    }
}
