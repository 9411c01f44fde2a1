// ABOUTME: Record types for caselab persistence
// ABOUTME: Sessions with their two-slot working copy, and execution records with terminal statuses

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Identifies a case within the course catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseRef {
    pub book_slug: String,
    pub chapter_slug: String,
    pub case_slug: String,
}

impl CaseRef {
    pub fn new(
        book_slug: impl Into<String>,
        chapter_slug: impl Into<String>,
        case_slug: impl Into<String>,
    ) -> Self {
        Self {
            book_slug: book_slug.into(),
            chapter_slug: chapter_slug.into(),
            case_slug: case_slug.into(),
        }
    }
}

impl std::fmt::Display for CaseRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.book_slug, self.chapter_slug, self.case_slug
        )
    }
}

/// Per-session resource limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionQuota {
    /// How many executions may be pending/running at once
    pub max_concurrent_executions: u32,
    /// Hard ceiling on any single execution's timeout
    pub max_execution_secs: u64,
}

impl Default for SessionQuota {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 1,
            max_execution_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Expired,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Expired => "expired",
            SessionStatus::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "paused" => Some(SessionStatus::Paused),
            "expired" => Some(SessionStatus::Expired),
            "terminated" => Some(SessionStatus::Terminated),
            _ => None,
        }
    }

    /// Expired and terminated sessions never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Expired | SessionStatus::Terminated)
    }
}

/// A student's working session on a case.
///
/// Carries exactly one snapshot pair of the main script: the original as
/// seeded from the catalog and the student's modified copy, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub case_ref: CaseRef,
    pub status: SessionStatus,
    pub quota: SessionQuota,
    /// The main script as seeded at session creation
    pub original_source: String,
    /// The student's edited copy; `None` until they first save
    pub modified_source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        user_id: impl Into<String>,
        case_ref: CaseRef,
        quota: SessionQuota,
        original_source: impl Into<String>,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            case_ref,
            status: SessionStatus::Active,
            quota,
            original_source: original_source.into(),
            modified_source: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    /// The source an execution of the session's main script should run:
    /// the modified slot when the student has saved one, else the original.
    pub fn effective_source(&self) -> &str {
        self.modified_source
            .as_deref()
            .unwrap_or(&self.original_source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "timeout" => Some(ExecutionStatus::Timeout),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Timeout
                | ExecutionStatus::Cancelled
        )
    }
}

/// One script run inside a session's sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub session_id: String,
    pub script_ref: String,
    pub parameters: HashMap<String, serde_json::Value>,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i64>,
    pub duration_ms: Option<i64>,
    /// Set only for infrastructure failures; script-level failure detail
    /// lives in stderr and the exit code
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(
        session_id: impl Into<String>,
        script_ref: impl Into<String>,
        parameters: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            script_ref: script_ref.into(),
            parameters,
            status: ExecutionStatus::Pending,
            started_at: None,
            finished_at: None,
            stdout: None,
            stderr: None,
            exit_code: None,
            duration_ms: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());

        assert!(!SessionStatus::Active.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
        assert!(SessionStatus::Terminated.is_terminal());
    }

    #[test]
    fn test_status_round_trips_through_sql_strings() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Timeout,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_effective_source_prefers_modified_slot() {
        let mut session = Session::new(
            "user-1",
            CaseRef::new("hydraulics", "tanks", "water-tank"),
            SessionQuota::default(),
            "print('original')",
            chrono::Duration::hours(1),
        );
        assert_eq!(session.effective_source(), "print('original')");

        session.modified_source = Some("print('edited')".to_string());
        assert_eq!(session.effective_source(), "print('edited')");
    }
}
