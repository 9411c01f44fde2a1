// ABOUTME: Database operations for sessions and executions
// ABOUTME: Terminal statuses are guarded in the SQL itself so they can never be overwritten

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::error::{Result, StorageError};
use crate::types::{
    CaseRef, ExecutionRecord, ExecutionStatus, Session, SessionQuota, SessionStatus,
};

/// Storage layer for session and execution records
#[derive(Clone)]
pub struct CaselabStorage {
    pool: Arc<SqlitePool>,
}

impl CaselabStorage {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Apply the schema migrations. Call once at startup.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StorageError::Database(e.into()))?;
        Ok(())
    }

    // ==================== Session Operations ====================

    pub async fn create_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, user_id, book_slug, chapter_slug, case_slug, status,
                max_concurrent_executions, max_execution_secs,
                original_source, modified_source,
                created_at, updated_at, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.case_ref.book_slug)
        .bind(&session.case_ref.chapter_slug)
        .bind(&session.case_ref.case_slug)
        .bind(session.status.as_str())
        .bind(session.quota.max_concurrent_executions as i64)
        .bind(session.quota.max_execution_secs as i64)
        .bind(&session.original_source)
        .bind(&session.modified_source)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.expires_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Result<Session> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, book_slug, chapter_slug, case_slug, status,
                   max_concurrent_executions, max_execution_secs,
                   original_source, modified_source,
                   created_at, updated_at, expires_at
            FROM sessions WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?
        .ok_or_else(|| StorageError::SessionNotFound(id.to_string()))?;

        row_to_session(&row)
    }

    /// Transition a session's status.
    ///
    /// Guarded in SQL: a session already in a terminal status matches zero
    /// rows and the caller learns the transition did not happen.
    pub async fn update_session_status(&self, id: &str, status: SessionStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET status = ?, updated_at = ?
            WHERE id = ? AND status NOT IN ('expired', 'terminated')
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Push the expiry forward. The deadline only ever increases; an
    /// attempt to shorten it matches zero rows.
    pub async fn extend_session(&self, id: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET expires_at = ?, updated_at = ?
            WHERE id = ?
              AND status IN ('active', 'paused')
              AND expires_at < ?
            "#,
        )
        .bind(expires_at)
        .bind(Utc::now())
        .bind(id)
        .bind(expires_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Save the student's edited copy into the modified slot
    pub async fn update_working_copy(&self, id: &str, source: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET modified_source = ?, updated_at = ?
            WHERE id = ? AND status NOT IN ('expired', 'terminated')
            "#,
        )
        .bind(source)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // ==================== Execution Operations ====================

    pub async fn create_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let parameters = serde_json::to_string(&record.parameters)?;

        sqlx::query(
            r#"
            INSERT INTO executions (
                id, session_id, script_ref, parameters, status,
                started_at, finished_at, stdout, stderr,
                exit_code, duration_ms, error_message, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(&record.script_ref)
        .bind(parameters)
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(&record.stdout)
        .bind(&record.stderr)
        .bind(record.exit_code)
        .bind(record.duration_ms)
        .bind(&record.error_message)
        .bind(record.created_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_execution(&self, id: &str) -> Result<ExecutionRecord> {
        let row = sqlx::query(
            r#"
            SELECT id, session_id, script_ref, parameters, status,
                   started_at, finished_at, stdout, stderr,
                   exit_code, duration_ms, error_message, created_at
            FROM executions WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?
        .ok_or_else(|| StorageError::ExecutionNotFound(id.to_string()))?;

        row_to_execution(&row)
    }

    /// All executions for a session, oldest first
    pub async fn list_executions(&self, session_id: &str) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, script_ref, parameters, status,
                   started_at, finished_at, stdout, stderr,
                   exit_code, duration_ms, error_message, created_at
            FROM executions WHERE session_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(row_to_execution).collect()
    }

    /// How many executions are pending or running for a session
    pub async fn count_active_executions(&self, session_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM executions WHERE session_id = ? AND status IN ('pending', 'running')",
        )
        .bind(session_id)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count)
    }

    /// IDs of pending/running executions for a session
    pub async fn list_active_execution_ids(&self, session_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT id FROM executions WHERE session_id = ? AND status IN ('pending', 'running')",
        )
        .bind(session_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    /// Move a pending execution to running and stamp its start time.
    /// Matches zero rows if the execution was already cancelled.
    pub async fn mark_running(&self, id: &str, started_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'running', started_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(started_at)
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Write an execution's terminal result.
    ///
    /// The guard makes terminal statuses monotonic: once a record is
    /// completed/failed/timeout/cancelled, a later finalize matches zero
    /// rows and returns `false` instead of silently overwriting it.
    #[allow(clippy::too_many_arguments)]
    pub async fn finalize_execution(
        &self,
        id: &str,
        status: ExecutionStatus,
        stdout: &str,
        stderr: &str,
        exit_code: Option<i64>,
        duration_ms: Option<i64>,
        error_message: Option<&str>,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());

        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = ?, finished_at = ?, stdout = ?, stderr = ?,
                exit_code = ?, duration_ms = ?, error_message = ?
            WHERE id = ?
              AND status NOT IN ('completed', 'failed', 'timeout', 'cancelled')
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(stdout)
        .bind(stderr)
        .bind(exit_code)
        .bind(duration_ms)
        .bind(error_message)
        .bind(id)
        .execute(&*self.pool)
        .await?;

        let finalized = result.rows_affected() > 0;
        if !finalized {
            warn!(
                execution_id = %id,
                attempted = status.as_str(),
                "Finalize skipped: execution already terminal"
            );
        }
        Ok(finalized)
    }
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<Session> {
    let status_str: String = row.get("status");
    let status = SessionStatus::parse(&status_str)
        .ok_or_else(|| decode_error("status", &status_str))?;

    Ok(Session {
        id: row.get("id"),
        user_id: row.get("user_id"),
        case_ref: CaseRef {
            book_slug: row.get("book_slug"),
            chapter_slug: row.get("chapter_slug"),
            case_slug: row.get("case_slug"),
        },
        status,
        quota: SessionQuota {
            max_concurrent_executions: row.get::<i64, _>("max_concurrent_executions") as u32,
            max_execution_secs: row.get::<i64, _>("max_execution_secs") as u64,
        },
        original_source: row.get("original_source"),
        modified_source: row.get("modified_source"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        expires_at: row.get("expires_at"),
    })
}

fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> Result<ExecutionRecord> {
    let status_str: String = row.get("status");
    let status = ExecutionStatus::parse(&status_str)
        .ok_or_else(|| decode_error("status", &status_str))?;

    let parameters_json: String = row.get("parameters");
    let parameters: HashMap<String, serde_json::Value> = serde_json::from_str(&parameters_json)?;

    Ok(ExecutionRecord {
        id: row.get("id"),
        session_id: row.get("session_id"),
        script_ref: row.get("script_ref"),
        parameters,
        status,
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        stdout: row.get("stdout"),
        stderr: row.get("stderr"),
        exit_code: row.get("exit_code"),
        duration_ms: row.get("duration_ms"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
    })
}

fn decode_error(column: &str, value: &str) -> StorageError {
    StorageError::Database(sqlx::Error::Decode(
        format!("unknown {} value: {}", column, value).into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn test_storage() -> CaselabStorage {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let storage = CaselabStorage::new(Arc::new(pool));
        storage.migrate().await.unwrap();
        storage
    }

    fn test_session() -> Session {
        Session::new(
            "user-1",
            CaseRef::new("hydraulics", "tanks", "water-tank"),
            SessionQuota::default(),
            "print('hello')",
            chrono::Duration::hours(1),
        )
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let storage = test_storage().await;
        let session = test_session();
        storage.create_session(&session).await.unwrap();

        let loaded = storage.get_session(&session.id).await.unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.case_ref, session.case_ref);
        assert_eq!(loaded.status, SessionStatus::Active);
        assert_eq!(loaded.quota.max_concurrent_executions, 1);
        assert_eq!(loaded.original_source, "print('hello')");
        assert_eq!(loaded.modified_source, None);
    }

    #[tokio::test]
    async fn test_get_missing_session() {
        let storage = test_storage().await;
        let err = storage.get_session("nope").await.unwrap_err();
        assert!(matches!(err, StorageError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_terminal_session_status_is_never_overwritten() {
        let storage = test_storage().await;
        let session = test_session();
        storage.create_session(&session).await.unwrap();

        assert!(storage
            .update_session_status(&session.id, SessionStatus::Terminated)
            .await
            .unwrap());

        // Resurrection attempts match zero rows
        assert!(!storage
            .update_session_status(&session.id, SessionStatus::Active)
            .await
            .unwrap());
        let loaded = storage.get_session(&session.id).await.unwrap();
        assert_eq!(loaded.status, SessionStatus::Terminated);
    }

    #[tokio::test]
    async fn test_extend_only_moves_expiry_forward() {
        let storage = test_storage().await;
        let session = test_session();
        storage.create_session(&session).await.unwrap();

        let later = session.expires_at + chrono::Duration::minutes(30);
        assert!(storage.extend_session(&session.id, later).await.unwrap());

        let earlier = session.expires_at - chrono::Duration::minutes(30);
        assert!(!storage.extend_session(&session.id, earlier).await.unwrap());

        let loaded = storage.get_session(&session.id).await.unwrap();
        assert_eq!(loaded.expires_at, later);
    }

    #[tokio::test]
    async fn test_working_copy_update() {
        let storage = test_storage().await;
        let session = test_session();
        storage.create_session(&session).await.unwrap();

        assert!(storage
            .update_working_copy(&session.id, "print('edited')")
            .await
            .unwrap());
        let loaded = storage.get_session(&session.id).await.unwrap();
        assert_eq!(loaded.modified_source.as_deref(), Some("print('edited')"));
        assert_eq!(loaded.effective_source(), "print('edited')");
    }

    #[tokio::test]
    async fn test_execution_round_trip() {
        let storage = test_storage().await;
        let session = test_session();
        storage.create_session(&session).await.unwrap();

        let mut parameters = HashMap::new();
        parameters.insert("flow_rate".to_string(), serde_json::json!(2.5));
        let record = ExecutionRecord::new(&session.id, "main", parameters);
        storage.create_execution(&record).await.unwrap();

        let loaded = storage.get_execution(&record.id).await.unwrap();
        assert_eq!(loaded.id, record.id);
        assert_eq!(loaded.status, ExecutionStatus::Pending);
        assert_eq!(loaded.parameters["flow_rate"], serde_json::json!(2.5));
    }

    #[tokio::test]
    async fn test_finalize_is_monotonic() {
        let storage = test_storage().await;
        let session = test_session();
        storage.create_session(&session).await.unwrap();
        let record = ExecutionRecord::new(&session.id, "main", HashMap::new());
        storage.create_execution(&record).await.unwrap();

        assert!(storage.mark_running(&record.id, Utc::now()).await.unwrap());
        assert!(storage
            .finalize_execution(
                &record.id,
                ExecutionStatus::Timeout,
                "partial",
                "",
                None,
                Some(1000),
                None,
            )
            .await
            .unwrap());

        // A racing finalize after the timeout loses
        assert!(!storage
            .finalize_execution(
                &record.id,
                ExecutionStatus::Completed,
                "full output",
                "",
                Some(0),
                Some(1200),
                None,
            )
            .await
            .unwrap());

        let loaded = storage.get_execution(&record.id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Timeout);
        assert_eq!(loaded.stdout.as_deref(), Some("partial"));
    }

    #[tokio::test]
    async fn test_finalize_orderings_always_keep_first_terminal_status() {
        let storage = test_storage().await;
        let session = test_session();
        storage.create_session(&session).await.unwrap();

        let orderings = [
            [ExecutionStatus::Cancelled, ExecutionStatus::Completed],
            [ExecutionStatus::Completed, ExecutionStatus::Cancelled],
            [ExecutionStatus::Failed, ExecutionStatus::Timeout],
            [ExecutionStatus::Timeout, ExecutionStatus::Failed],
        ];

        for pair in orderings {
            let record = ExecutionRecord::new(&session.id, "main", HashMap::new());
            storage.create_execution(&record).await.unwrap();

            assert!(storage
                .finalize_execution(&record.id, pair[0], "", "", None, None, None)
                .await
                .unwrap());
            assert!(!storage
                .finalize_execution(&record.id, pair[1], "", "", None, None, None)
                .await
                .unwrap());

            let loaded = storage.get_execution(&record.id).await.unwrap();
            assert_eq!(loaded.status, pair[0]);
        }
    }

    #[tokio::test]
    async fn test_count_active_executions() {
        let storage = test_storage().await;
        let session = test_session();
        storage.create_session(&session).await.unwrap();

        let a = ExecutionRecord::new(&session.id, "main", HashMap::new());
        let b = ExecutionRecord::new(&session.id, "main", HashMap::new());
        storage.create_execution(&a).await.unwrap();
        storage.create_execution(&b).await.unwrap();
        assert_eq!(storage.count_active_executions(&session.id).await.unwrap(), 2);

        storage.mark_running(&a.id, Utc::now()).await.unwrap();
        assert_eq!(storage.count_active_executions(&session.id).await.unwrap(), 2);

        storage
            .finalize_execution(&a.id, ExecutionStatus::Completed, "", "", Some(0), None, None)
            .await
            .unwrap();
        assert_eq!(storage.count_active_executions(&session.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_executions_ordered() {
        let storage = test_storage().await;
        let session = test_session();
        storage.create_session(&session).await.unwrap();

        let mut first = ExecutionRecord::new(&session.id, "main", HashMap::new());
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let second = ExecutionRecord::new(&session.id, "main", HashMap::new());
        storage.create_execution(&second).await.unwrap();
        storage.create_execution(&first).await.unwrap();

        let listed = storage.list_executions(&session.id).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
    }
}
