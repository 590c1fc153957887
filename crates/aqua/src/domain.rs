//! Core domain records for the coordination store.
//!
//! These are the fully decoded in-memory forms of the rows in the store:
//! agents, tasks, the leader record, messages, audit events, and advisory
//! file locks. Status fields are persisted as short strings; decoding an
//! unknown value is a schema error, never a silent default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::errors::AquaError;

/// Lifecycle status of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Participating normally.
    Active,
    /// Registered but not currently working.
    Idle,
    /// Marked dead by a recovery sweep.
    Dead,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AquaError> {
        match s {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "dead" => Ok(Self::Dead),
            other => Err(AquaError::Schema(format!("unknown agent status '{other}'"))),
        }
    }
}

/// Which kind of AI agent a participant runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Claude,
    Codex,
    Gemini,
    Generic,
}

impl AgentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::Generic => "generic",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AquaError> {
        match s {
            "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            "gemini" => Ok(Self::Gemini),
            "generic" => Ok(Self::Generic),
            other => Err(AquaError::Schema(format!("unknown agent type '{other}'"))),
        }
    }
}

/// Lifecycle status of a task.
///
/// `done` and `failed` are terminal for the current attempt; `abandoned` is
/// transient and flows back to `pending` while the retry budget lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Done,
    Failed,
    Abandoned,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AquaError> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(AquaError::Schema(format!("unknown task status '{other}'"))),
        }
    }

    /// Terminal states for the current attempt.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// A registered participant process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Stable opaque id (8 hex chars).
    pub id: String,
    /// Unique human-readable name, e.g. `brave-falcon`.
    pub name: String,
    pub kind: AgentKind,
    /// OS process id, when known. Used by the liveness double-check.
    pub pid: Option<u32>,
    pub status: AgentStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    /// The single task this agent currently holds, if any.
    pub current_task_id: Option<String>,
    pub capabilities: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub last_progress: Option<String>,
    /// Advisory role tag used for task selection preference.
    pub role: Option<String>,
}

/// A unit of work in the shared queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    /// 1 (lowest) to 10 (highest).
    pub priority: i64,
    pub created_by: Option<String>,
    pub claimed_by: Option<String>,
    /// Leader term in effect when the task was claimed (fencing token,
    /// recorded for audit).
    pub claim_term: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub tags: Vec<String>,
    /// Free-form checkpoint written by `progress`.
    pub context: Option<String>,
    /// Bumped on every mutation.
    pub version: i64,
    /// Ids of tasks that must be `done` before this one is claimable.
    pub depends_on: Vec<String>,
}

impl Task {
    /// Whether this task matches an agent role (tag equality).
    pub fn matches_role(&self, role: &str) -> bool {
        self.tags.iter().any(|t| t == role)
    }
}

/// The singleton leader record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leader {
    pub agent_id: String,
    /// Monotonic term, incremented at each successful takeover.
    pub term: i64,
    pub lease_expires_at: DateTime<Utc>,
    pub elected_at: DateTime<Utc>,
}

impl Leader {
    /// Whether the lease has expired as of now.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.lease_expires_at
    }
}

/// A message between agents. `to_agent = None` is a broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub from_agent: String,
    pub to_agent: Option<String>,
    pub content: String,
    pub message_type: String,
    pub created_at: DateTime<Utc>,
    /// For direct messages, the shared read marker; for broadcasts, the
    /// fetching recipient's own marker. Never cleared once set.
    pub read_at: Option<DateTime<Utc>>,
}

/// An append-only audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub agent_id: Option<String>,
    pub task_id: Option<String>,
    /// Free-form JSON detail map.
    pub details: Option<Value>,
}

/// An advisory lock on a file path. At most one holder per path; agents
/// consult these voluntarily, nothing enforces them at the filesystem level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileLock {
    pub file_path: String,
    pub agent_id: String,
    pub locked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Claimed,
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Abandoned,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()).unwrap(), status);
        }
        for status in [AgentStatus::Active, AgentStatus::Idle, AgentStatus::Dead] {
            assert_eq!(AgentStatus::parse(status.as_str()).unwrap(), status);
        }
        for kind in [
            AgentKind::Claude,
            AgentKind::Codex,
            AgentKind::Gemini,
            AgentKind::Generic,
        ] {
            assert_eq!(AgentKind::parse(kind.as_str()).unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_status_is_schema_error() {
        let err = TaskStatus::parse("in_progress").unwrap_err();
        assert_eq!(err.kind(), "schema_error");
        assert!(AgentStatus::parse("zombie").is_err());
        assert!(AgentKind::parse("gpt").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Claimed.is_terminal());
        assert!(!TaskStatus::Abandoned.is_terminal());
    }

    #[test]
    fn test_leader_expiry() {
        let leader = Leader {
            agent_id: "a1".into(),
            term: 1,
            lease_expires_at: Utc::now() - chrono::Duration::seconds(1),
            elected_at: Utc::now() - chrono::Duration::seconds(31),
        };
        assert!(leader.is_expired());
    }

    #[test]
    fn test_role_matching_is_tag_equality() {
        let mut task = Task {
            id: "t1".into(),
            title: "x".into(),
            description: None,
            status: TaskStatus::Pending,
            priority: 5,
            created_by: None,
            claimed_by: None,
            claim_term: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            claimed_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: 3,
            tags: vec!["backend".into(), "parser".into()],
            context: None,
            version: 1,
            depends_on: vec![],
        };
        assert!(task.matches_role("backend"));
        assert!(!task.matches_role("front"));
        task.tags.clear();
        assert!(!task.matches_role("backend"));
    }
}
