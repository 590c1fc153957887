//! Typed error taxonomy for coordination operations.
//!
//! Every failure the core can report is one of these kinds. Conditional-update
//! failures (`ClaimFailed`, `LeaderContention`) are reported without retry;
//! the caller decides whether to try again. Store-level busy errors are
//! retried only by SQLite's own busy handler and surface as `StoreBusy` once
//! the timeout is exhausted.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the coordination core.
#[derive(Debug, Error)]
pub enum AquaError {
    /// No `.aqua` store exists for this project.
    #[error("aqua is not initialized in {0} (run `aqua init`)")]
    NotInitialized(PathBuf),

    /// Another registered agent already uses this name.
    #[error("agent name '{0}' is already taken")]
    NameConflict(String),

    /// The caller has no registered identity in this store.
    #[error("no agent identity for this session (run `aqua join`)")]
    NotJoined,

    /// The operation needs a current task but the agent holds none.
    #[error("agent has no current task")]
    NoCurrentTask,

    /// The optimistic status transition matched zero rows: the task was
    /// already claimed, completed, or is not pending.
    #[error("task {0} could not be claimed")]
    ClaimFailed(String),

    /// The task has dependencies that are not yet done.
    #[error("task {task} is blocked by unfinished dependencies: {}", .blocking.join(", "))]
    DependencyUnmet { task: String, blocking: Vec<String> },

    /// Another agent holds an unexpired leader lease.
    #[error("leadership is held by another agent")]
    LeaderContention,

    /// The agent still holds a claimed task; leave with `--force` to abandon it.
    #[error("agent still holds task {0} (use --force to abandon it)")]
    TaskHeld(String),

    /// Another agent already holds the advisory lock on this path.
    #[error("{path} is locked by {holder}")]
    LockHeld { path: String, holder: String },

    /// Only the holder of an advisory lock may release it.
    #[error("{0} is not locked by you")]
    NotLockHolder(String),

    /// The write lock could not be obtained within the busy timeout.
    #[error("store is busy: another writer holds the lock")]
    StoreBusy,

    /// Stored data the reader cannot interpret: a schema version newer than
    /// this binary, an unknown status string, or a corrupt column.
    #[error("schema error: {0}")]
    Schema(String),

    /// Any other store-level failure.
    #[error("store error: {0}")]
    Store(rusqlite::Error),
}

impl AquaError {
    /// Stable machine-readable kind string, used by the JSON error path.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotInitialized(_) => "not_initialized",
            Self::NameConflict(_) => "name_conflict",
            Self::NotJoined => "not_joined",
            Self::NoCurrentTask => "no_current_task",
            Self::ClaimFailed(_) => "claim_failed",
            Self::DependencyUnmet { .. } => "dependency_unmet",
            Self::LeaderContention => "leader_contention",
            Self::TaskHeld(_) => "task_held",
            Self::LockHeld { .. } => "lock_held",
            Self::NotLockHolder(_) => "not_lock_holder",
            Self::StoreBusy => "store_busy",
            Self::Schema(_) => "schema_error",
            Self::Store(_) => "store_error",
        }
    }

    /// Whether this error is the caller's fault (exit code 1) as opposed to
    /// an internal or store failure (exit code 2).
    pub fn is_user_error(&self) -> bool {
        !matches!(self, Self::StoreBusy | Self::Schema(_) | Self::Store(_))
    }
}

impl From<rusqlite::Error> for AquaError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                Self::StoreBusy
            }
            _ => Self::Store(err),
        }
    }
}

/// Result alias used throughout the core.
pub type Result<T, E = AquaError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(AquaError::NotJoined.kind(), "not_joined");
        assert_eq!(AquaError::ClaimFailed("t1".into()).kind(), "claim_failed");
        assert_eq!(AquaError::StoreBusy.kind(), "store_busy");
        assert_eq!(
            AquaError::Schema("bad status".into()).kind(),
            "schema_error"
        );
    }

    #[test]
    fn test_user_error_split() {
        assert!(AquaError::NotJoined.is_user_error());
        assert!(AquaError::NameConflict("x".into()).is_user_error());
        assert!(AquaError::LockHeld {
            path: "src/a.rs".into(),
            holder: "a1".into()
        }
        .is_user_error());
        assert!(AquaError::NotLockHolder("src/a.rs".into()).is_user_error());
        assert!(!AquaError::StoreBusy.is_user_error());
        assert!(!AquaError::Schema("corrupt".into()).is_user_error());
    }

    #[test]
    fn test_dependency_unmet_lists_blockers() {
        let err = AquaError::DependencyUnmet {
            task: "t9".into(),
            blocking: vec!["t1".into(), "t2".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("t9"));
        assert!(msg.contains("t1, t2"));
    }
}
