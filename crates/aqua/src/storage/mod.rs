//! Durable store for all coordination state.
//!
//! One embedded SQLite database at `.aqua/aqua.db` shared by many unrelated
//! short-lived processes. Writers use short `BEGIN IMMEDIATE` transactions;
//! readers proceed concurrently under WAL. There is no in-memory shared
//! state: every invariant is enforced by row-level conditional updates whose
//! affected-row counts are observed by the caller.
//!
//! The store is opened lazily per CLI invocation and dropped at the end of
//! it; a transaction is never held across an invocation boundary.

use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::{AquaError, Result};

pub mod agents;
pub mod codec;
pub mod events;
pub mod leader;
pub mod locks;
pub mod messages;
pub mod schema;
pub mod tasks;

/// Directory holding all coordination state, relative to the project root.
pub const AQUA_DIR: &str = ".aqua";
/// Database filename inside [`AQUA_DIR`].
pub const DB_FILE: &str = "aqua.db";

/// Handle to the embedded coordination database.
///
/// Holds a single connection; concurrency comes from unrelated processes
/// each opening their own handle against the same file.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open the store for an initialized project.
    ///
    /// # Errors
    ///
    /// `NotInitialized` when `.aqua/aqua.db` does not exist; `Schema` when
    /// the database was written by a newer binary.
    pub fn open(project_root: &Path, busy_timeout_ms: u64) -> Result<Self> {
        let db_path = project_root.join(AQUA_DIR).join(DB_FILE);
        if !db_path.exists() {
            return Err(AquaError::NotInitialized(project_root.to_path_buf()));
        }
        Self::open_path(&db_path, busy_timeout_ms)
    }

    /// Initialize the store for a project, creating `.aqua/` and the schema.
    ///
    /// Idempotent: re-running on an initialized project migrates forward and
    /// leaves existing data alone.
    pub fn init(project_root: &Path, busy_timeout_ms: u64) -> Result<Self> {
        let aqua_dir = project_root.join(AQUA_DIR);
        std::fs::create_dir_all(aqua_dir.join("sessions"))
            .map_err(|e| AquaError::Schema(format!("cannot create {}: {e}", aqua_dir.display())))?;
        Self::open_path(&aqua_dir.join(DB_FILE), busy_timeout_ms)
    }

    /// Open (creating if absent) a database file directly.
    pub fn open_path(db_path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", busy_timeout_ms as i64)?;
        schema::apply_schema(&conn)?;
        debug!(db = %db_path.display(), "store opened");
        Ok(Self { conn })
    }

    /// Borrow the underlying connection (used by the per-entity modules and
    /// by tests that need to poke rows directly).
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a closure inside one `BEGIN IMMEDIATE` transaction.
    ///
    /// The write lock is taken up front, so every read inside the closure
    /// sees a state no concurrent writer can change before commit. Rolls back
    /// on error. Must not be nested.
    pub fn immediate<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => {
                // Preserve the original error even if rollback also fails.
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(err)
            }
        }
    }
}

/// Walk upward from `start` looking for a directory containing `.aqua`.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(current) = dir {
        if current.join(AQUA_DIR).is_dir() {
            return Some(current.to_path_buf());
        }
        dir = current.parent();
    }
    None
}
