//! Advisory file locks.
//!
//! The table records which agent claims which path; nothing enforces the
//! lock at the filesystem level. Agents consult the table voluntarily before
//! touching shared files. Recovery releases every lock held by a dead agent.

use chrono::Utc;
use rusqlite::params;
use serde_json::json;

use super::codec;
use super::Store;
use crate::domain::FileLock;
use crate::errors::{AquaError, Result};

impl Store {
    /// Lock a path for an agent. Returns `false` when another holder exists.
    pub fn lock_file(&self, file_path: &str, agent_id: &str) -> Result<bool> {
        let result = self.conn().execute(
            "INSERT INTO file_locks (file_path, agent_id, locked_at) VALUES (?1, ?2, ?3)",
            params![file_path, agent_id, codec::encode_ts(Utc::now())],
        );
        match result {
            Ok(_) => {
                self.append_event(
                    "file_locked",
                    Some(agent_id),
                    None,
                    Some(json!({ "file": file_path })),
                )?;
                Ok(true)
            }
            Err(err)
                if err.sqlite_error_code()
                    == Some(rusqlite::ErrorCode::ConstraintViolation) =>
            {
                Ok(false)
            }
            Err(err) => Err(AquaError::from(err)),
        }
    }

    /// Unlock a path. Only the holder can unlock; returns `false` otherwise.
    pub fn unlock_file(&self, file_path: &str, agent_id: &str) -> Result<bool> {
        let changed = self.conn().execute(
            "DELETE FROM file_locks WHERE file_path = ?1 AND agent_id = ?2",
            params![file_path, agent_id],
        )?;
        if changed == 1 {
            self.append_event(
                "file_unlocked",
                Some(agent_id),
                None,
                Some(json!({ "file": file_path })),
            )?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Current holder of a path, if any.
    pub fn get_file_lock(&self, file_path: &str) -> Result<Option<FileLock>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT * FROM file_locks WHERE file_path = ?1")?;
        let mut rows = stmt.query(params![file_path])?;
        match rows.next()? {
            Some(row) => Ok(Some(codec::decode_file_lock(row)?)),
            None => Ok(None),
        }
    }

    /// All locks, newest first.
    pub fn list_file_locks(&self) -> Result<Vec<FileLock>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT * FROM file_locks ORDER BY locked_at DESC, file_path")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(codec::decode_file_lock(row)?);
        }
        Ok(out)
    }

    /// Release every lock held by an agent. Returns the count released.
    pub fn release_agent_locks(&self, agent_id: &str) -> Result<usize> {
        let released = self.conn().execute(
            "DELETE FROM file_locks WHERE agent_id = ?1",
            params![agent_id],
        )?;
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, Store) {
        let temp = tempdir().unwrap();
        let store = Store::init(temp.path(), 5000).unwrap();
        (temp, store)
    }

    #[test]
    fn test_one_holder_per_path() {
        let (_t, store) = test_store();
        assert!(store.lock_file("src/parser.rs", "a1").unwrap());
        assert!(!store.lock_file("src/parser.rs", "a2").unwrap());

        let lock = store.get_file_lock("src/parser.rs").unwrap().unwrap();
        assert_eq!(lock.agent_id, "a1");
    }

    #[test]
    fn test_only_holder_unlocks() {
        let (_t, store) = test_store();
        store.lock_file("src/lexer.rs", "a1").unwrap();

        assert!(!store.unlock_file("src/lexer.rs", "a2").unwrap());
        assert!(store.unlock_file("src/lexer.rs", "a1").unwrap());
        assert!(store.get_file_lock("src/lexer.rs").unwrap().is_none());

        // Freed: another agent can take it.
        assert!(store.lock_file("src/lexer.rs", "a2").unwrap());
    }

    #[test]
    fn test_release_all_for_agent() {
        let (_t, store) = test_store();
        store.lock_file("a.rs", "a1").unwrap();
        store.lock_file("b.rs", "a1").unwrap();
        store.lock_file("c.rs", "a2").unwrap();

        assert_eq!(store.release_agent_locks("a1").unwrap(), 2);
        let remaining = store.list_file_locks().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].agent_id, "a2");
    }
}
