// ABOUTME: Storage layer for conversation sandbox session rows
// ABOUTME: Row-locked transactions serialize per-conversation bookkeeping across processes

use crate::{Result, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;

const SESSION_COLUMNS: &str = "id, conversation_id, container_name, workspace_path, owner_host, \
     next_request_seq, created_at, last_used_at";

/// A persistent sandbox bound to one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSandboxSession {
    pub id: String,
    pub conversation_id: String,
    pub container_name: String,
    pub workspace_path: String,
    pub owner_host: String,
    /// Sequence the next enqueued request will receive
    pub next_request_seq: i64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl ConversationSandboxSession {
    pub fn is_expired(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.last_used_at > ttl
    }

    /// Sequence of the most recently enqueued request, zero if none yet.
    pub fn last_request_seq(&self) -> i64 {
        self.next_request_seq - 1
    }
}

/// Fields chosen by the caller when registering a session. The conversation
/// comes from the locked transaction.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: String,
    pub container_name: String,
    pub workspace_path: String,
    pub owner_host: String,
}

#[derive(Clone)]
pub struct SessionStorage {
    pool: SqlitePool,
}

impl SessionStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get_by_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationSandboxSession>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM conversation_sandbox_sessions WHERE conversation_id = ?",
            SESSION_COLUMNS
        ))
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_session).transpose()
    }

    pub async fn list_sessions(&self) -> Result<Vec<ConversationSandboxSession>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM conversation_sandbox_sessions ORDER BY created_at",
            SESSION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_session).collect()
    }

    /// Refresh `last_used_at` without taking the conversation lock.
    pub async fn touch(&self, session_id: &str) -> Result<()> {
        sqlx::query("UPDATE conversation_sandbox_sessions SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Open a transaction holding the write lock for `conversation_id`.
    ///
    /// The first statement is a write against the conversation's row, so the
    /// lock is taken before anything is read and held until commit or drop.
    /// Dropping the returned transaction rolls it back.
    pub async fn lock_conversation(&self, conversation_id: &str) -> Result<SessionTransaction> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE conversation_sandbox_sessions SET conversation_id = conversation_id \
             WHERE conversation_id = ?",
        )
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;

        debug!("Locked session row for conversation {}", conversation_id);

        Ok(SessionTransaction {
            tx,
            conversation_id: conversation_id.to_string(),
        })
    }
}

/// Bookkeeping transaction scoped to one conversation's session row.
pub struct SessionTransaction {
    tx: Transaction<'static, Sqlite>,
    conversation_id: String,
}

impl SessionTransaction {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub async fn current(&mut self) -> Result<Option<ConversationSandboxSession>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM conversation_sandbox_sessions WHERE conversation_id = ?",
            SESSION_COLUMNS
        ))
        .bind(&self.conversation_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(row_to_session).transpose()
    }

    pub async fn insert(&mut self, new: &NewSession) -> Result<ConversationSandboxSession> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO conversation_sandbox_sessions (
                id, conversation_id, container_name, workspace_path, owner_host,
                next_request_seq, created_at, last_used_at
            ) VALUES (?, ?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(&new.id)
        .bind(&self.conversation_id)
        .bind(&new.container_name)
        .bind(&new.workspace_path)
        .bind(&new.owner_host)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StorageError::Conflict(self.conversation_id.clone())
            }
            other => StorageError::Database(other),
        })?;

        Ok(ConversationSandboxSession {
            id: new.id.clone(),
            conversation_id: self.conversation_id.clone(),
            container_name: new.container_name.clone(),
            workspace_path: new.workspace_path.clone(),
            owner_host: new.owner_host.clone(),
            next_request_seq: 1,
            created_at: now,
            last_used_at: now,
        })
    }

    /// Claim the next request sequence for `session_id` and refresh its
    /// last-used time. Returns the claimed sequence.
    pub async fn advance_sequence(&mut self, session_id: &str) -> Result<i64> {
        let row = sqlx::query(
            r#"
            UPDATE conversation_sandbox_sessions
            SET next_request_seq = next_request_seq + 1, last_used_at = ?
            WHERE id = ? AND conversation_id = ?
            RETURNING next_request_seq - 1 AS assigned
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(session_id)
        .bind(&self.conversation_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => Ok(row.try_get::<i64, _>("assigned")?),
            None => Err(StorageError::NotFound(session_id.to_string())),
        }
    }

    pub async fn delete(&mut self, session_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM conversation_sandbox_sessions WHERE id = ? AND conversation_id = ?",
        )
        .bind(session_id)
        .bind(&self.conversation_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

fn parse_timestamp(column: &'static str, value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::InvalidTimestamp { column, value })
}

fn row_to_session(row: SqliteRow) -> Result<ConversationSandboxSession> {
    Ok(ConversationSandboxSession {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        container_name: row.try_get("container_name")?,
        workspace_path: row.try_get("workspace_path")?,
        owner_host: row.try_get("owner_host")?,
        next_request_seq: row.try_get("next_request_seq")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        last_used_at: parse_timestamp("last_used_at", row.try_get("last_used_at")?)?,
    })
}
