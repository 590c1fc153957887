//! Agent registry and heartbeat persistence.
//!
//! Liveness is implied by CLI activity: callers stamp the heartbeat at the
//! start of any substantive operation. No heartbeat threads are spawned by
//! the core.

use chrono::Utc;
use rusqlite::params;
use serde_json::json;
use tracing::debug;

use super::codec::{self, encode_list, encode_map};
use super::Store;
use crate::domain::{Agent, AgentStatus};
use crate::errors::{AquaError, Result};

impl Store {
    /// Register a new agent.
    ///
    /// # Errors
    ///
    /// `NameConflict` when the name is already taken.
    pub fn create_agent(&self, agent: &Agent) -> Result<()> {
        if self.get_agent_by_name(&agent.name)?.is_some() {
            return Err(AquaError::NameConflict(agent.name.clone()));
        }

        self.conn().execute(
            "INSERT INTO agents (id, name, agent_type, pid, status, last_heartbeat_at,
                                 registered_at, current_task_id, capabilities, metadata,
                                 last_progress, role)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                agent.id,
                agent.name,
                agent.kind.as_str(),
                agent.pid.map(i64::from),
                agent.status.as_str(),
                codec::encode_ts(agent.last_heartbeat_at),
                codec::encode_ts(agent.registered_at),
                agent.current_task_id,
                encode_list(&agent.capabilities),
                encode_map(&agent.metadata),
                agent.last_progress,
                agent.role,
            ],
        )?;
        self.append_event(
            "agent_joined",
            Some(&agent.id),
            None,
            Some(json!({ "name": agent.name, "pid": agent.pid })),
        )?;
        debug!(agent = %agent.id, name = %agent.name, "agent registered");
        Ok(())
    }

    /// Fetch an agent by id.
    pub fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>> {
        let mut stmt = self.conn().prepare("SELECT * FROM agents WHERE id = ?1")?;
        let mut rows = stmt.query(params![agent_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(codec::decode_agent(row)?)),
            None => Ok(None),
        }
    }

    /// Fetch an agent by its unique name.
    pub fn get_agent_by_name(&self, name: &str) -> Result<Option<Agent>> {
        let mut stmt = self.conn().prepare("SELECT * FROM agents WHERE name = ?1")?;
        let mut rows = stmt.query(params![name])?;
        match rows.next()? {
            Some(row) => Ok(Some(codec::decode_agent(row)?)),
            None => Ok(None),
        }
    }

    /// List agents, optionally filtered by status, in registration order.
    pub fn list_agents(&self, status: Option<AgentStatus>) -> Result<Vec<Agent>> {
        let mut out = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = self.conn().prepare(
                    "SELECT * FROM agents WHERE status = ?1 ORDER BY registered_at, rowid",
                )?;
                let mut rows = stmt.query(params![status.as_str()])?;
                while let Some(row) = rows.next()? {
                    out.push(codec::decode_agent(row)?);
                }
            }
            None => {
                let mut stmt = self
                    .conn()
                    .prepare("SELECT * FROM agents ORDER BY registered_at, rowid")?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    out.push(codec::decode_agent(row)?);
                }
            }
        }
        Ok(out)
    }

    /// Stamp the agent's heartbeat. Touches no other column.
    pub fn touch_heartbeat(&self, agent_id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE agents SET last_heartbeat_at = ?1 WHERE id = ?2",
            params![codec::encode_ts(Utc::now()), agent_id],
        )?;
        Ok(())
    }

    /// Set an agent's lifecycle status.
    pub fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        self.conn().execute(
            "UPDATE agents SET status = ?1 WHERE id = ?2",
            params![status.as_str(), agent_id],
        )?;
        Ok(())
    }

    /// Point the agent at its current task (or clear the pointer).
    pub fn set_agent_task(&self, agent_id: &str, task_id: Option<&str>) -> Result<()> {
        self.conn().execute(
            "UPDATE agents SET current_task_id = ?1 WHERE id = ?2",
            params![task_id, agent_id],
        )?;
        Ok(())
    }

    /// Record the agent's latest free-form progress note.
    pub fn set_agent_progress(&self, agent_id: &str, progress: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE agents SET last_progress = ?1 WHERE id = ?2",
            params![progress, agent_id],
        )?;
        Ok(())
    }

    /// Delete an agent registration.
    pub fn delete_agent(&self, agent_id: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM agents WHERE id = ?1", params![agent_id])?;
        self.append_event("agent_left", Some(agent_id), None, None)?;
        Ok(())
    }
}
