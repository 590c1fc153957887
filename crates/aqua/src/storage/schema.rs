//! Schema definition, versioning, and forward-only migrations.
//!
//! The schema version lives in a one-row table. On open, the stored version
//! is compared with [`SCHEMA_VERSION`]: older stores are migrated forward
//! with additive changes only; a newer stored version is a schema error so
//! old binaries never downgrade or misread a newer database.

use rusqlite::Connection;

use crate::errors::{AquaError, Result};

/// Version written by this binary.
pub const SCHEMA_VERSION: i64 = 4;

/// Complete DDL for a current-version store. Idempotent via `IF NOT EXISTS`.
pub const SCHEMA_SQL: &str = r"
    -- Agents: registered participants
    CREATE TABLE IF NOT EXISTS agents (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        agent_type TEXT NOT NULL DEFAULT 'generic',
        pid INTEGER,
        status TEXT NOT NULL DEFAULT 'active',
        last_heartbeat_at TEXT NOT NULL,
        registered_at TEXT NOT NULL,
        current_task_id TEXT,
        capabilities TEXT,
        metadata TEXT,
        last_progress TEXT,
        role TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);
    CREATE INDEX IF NOT EXISTS idx_agents_heartbeat ON agents(last_heartbeat_at);

    -- Leader: single row guarded by the id CHECK
    CREATE TABLE IF NOT EXISTS leader (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        agent_id TEXT NOT NULL,
        term INTEGER NOT NULL,
        lease_expires_at TEXT NOT NULL,
        elected_at TEXT NOT NULL
    );

    -- Tasks: the shared work queue
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        description TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        priority INTEGER NOT NULL DEFAULT 5,
        created_by TEXT,
        claimed_by TEXT,
        claim_term INTEGER,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        claimed_at TEXT,
        completed_at TEXT,
        result TEXT,
        error TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        tags TEXT,
        context TEXT,
        version INTEGER NOT NULL DEFAULT 1,
        depends_on TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
    CREATE INDEX IF NOT EXISTS idx_tasks_claimed_by ON tasks(claimed_by);
    -- Selection scan order: highest priority first, oldest first
    CREATE INDEX IF NOT EXISTS idx_tasks_queue ON tasks(status, priority DESC, created_at ASC);

    -- Messages: inter-agent mail; to_agent NULL means broadcast
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_agent TEXT NOT NULL,
        to_agent TEXT,
        content TEXT NOT NULL,
        message_type TEXT NOT NULL DEFAULT 'chat',
        created_at TEXT NOT NULL,
        read_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_messages_to ON messages(to_agent, read_at);
    CREATE INDEX IF NOT EXISTS idx_messages_from ON messages(from_agent);

    -- Per-recipient read markers for broadcast messages
    CREATE TABLE IF NOT EXISTS message_reads (
        message_id INTEGER NOT NULL,
        agent_id TEXT NOT NULL,
        read_at TEXT NOT NULL,
        PRIMARY KEY (message_id, agent_id)
    );

    -- Events: append-only audit log
    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        event_type TEXT NOT NULL,
        agent_id TEXT,
        task_id TEXT,
        details TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp DESC);
    CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);

    -- Advisory file locks
    CREATE TABLE IF NOT EXISTS file_locks (
        file_path TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        locked_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_file_locks_agent ON file_locks(agent_id);

    -- Schema version: one row
    CREATE TABLE IF NOT EXISTS schema_version (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        version INTEGER NOT NULL
    );
";

/// Apply the schema and bring an older database forward.
///
/// Safe to run on every open: the DDL is idempotent and migrations are
/// additive. A database written by a newer binary is rejected.
pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    match stored_version(conn)? {
        None => {
            conn.execute(
                "INSERT INTO schema_version (id, version) VALUES (1, ?1)",
                [SCHEMA_VERSION],
            )?;
            Ok(())
        }
        Some(version) if version > SCHEMA_VERSION => Err(AquaError::Schema(format!(
            "store schema version {version} is newer than this binary supports ({SCHEMA_VERSION})"
        ))),
        Some(version) => run_migrations(conn, version),
    }
}

/// Read the stored schema version, if any.
pub fn stored_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_version WHERE id = 1")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

/// Migrate an older store forward to [`SCHEMA_VERSION`].
///
/// Additive only. Column probes keep each step idempotent even if a previous
/// run was interrupted between the ALTER and the version bump.
fn run_migrations(conn: &Connection, mut version: i64) -> Result<()> {
    // v1 -> v2: progress checkpoints and role tags on agents
    if version < 2 {
        if !column_exists(conn, "agents", "last_progress")? {
            conn.execute("ALTER TABLE agents ADD COLUMN last_progress TEXT", [])?;
        }
        if !column_exists(conn, "agents", "role")? {
            conn.execute("ALTER TABLE agents ADD COLUMN role TEXT", [])?;
        }
        version = bump_version(conn, 2)?;
    }

    // v2 -> v3: dependency gating on tasks
    if version < 3 {
        if !column_exists(conn, "tasks", "depends_on")? {
            conn.execute("ALTER TABLE tasks ADD COLUMN depends_on TEXT", [])?;
        }
        version = bump_version(conn, 3)?;
    }

    // v3 -> v4: per-recipient read markers for broadcasts
    if version < 4 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS message_reads (
                message_id INTEGER NOT NULL,
                agent_id TEXT NOT NULL,
                read_at TEXT NOT NULL,
                PRIMARY KEY (message_id, agent_id)
            )",
        )?;
        bump_version(conn, 4)?;
    }

    Ok(())
}

fn bump_version(conn: &Connection, to: i64) -> Result<i64> {
    conn.execute("UPDATE schema_version SET version = ?1 WHERE id = 1", [to])?;
    Ok(to)
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!(
        "SELECT 1 FROM pragma_table_info('{table}') WHERE name = ?1"
    ))?;
    Ok(stmt.exists([column])?)
}
