//! Command execution logic for the CLI surface.
//!
//! The `CommandExecutor` owns the store handle for one invocation, resolves
//! the calling agent's identity, and wraps the coordinator entry points.
//! Rendering is the binary's concern; everything here returns typed values.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::config::AquaConfig;
use crate::coordinator::{Coordinator, DoctorReport, RecoverySummary};
use crate::domain::{
    Agent, AgentKind, AgentStatus, Event, FileLock, Leader, Message, Task, TaskStatus,
};
use crate::errors::AquaError;
use crate::identity;
use crate::storage::tasks::TaskFilter;
use crate::storage::{find_project_root, Store, AQUA_DIR};

/// Overview returned by `status`.
#[derive(Debug, Serialize)]
pub struct StatusSummary {
    pub agents_total: usize,
    pub agents_active: usize,
    pub tasks: BTreeMap<String, i64>,
    pub leader: Option<Leader>,
}

/// Result of a claim attempt.
#[derive(Debug, Serialize)]
pub struct ClaimOutcome {
    pub task: Option<Task>,
    /// Whether the claimed task matched the agent's role. Advisory; `true`
    /// when the agent has no role or nothing was claimed.
    pub role_match: bool,
}

/// Executes CLI commands against one open store.
pub struct CommandExecutor {
    store: Store,
    config: AquaConfig,
    project_root: PathBuf,
}

impl CommandExecutor {
    /// Open the store for an already-initialized project.
    pub fn open(project_root: &Path) -> Result<Self> {
        let config = AquaConfig::load(&project_root.join(AQUA_DIR))?;
        let store = Store::open(project_root, config.store().busy_timeout_ms())?;
        Ok(Self {
            store,
            config,
            project_root: project_root.to_path_buf(),
        })
    }

    /// Initialize the store (idempotent) and open it.
    pub fn init(project_root: &Path) -> Result<Self> {
        let config = AquaConfig::load(&project_root.join(AQUA_DIR)).unwrap_or_default();
        let store = Store::init(project_root, config.store().busy_timeout_ms())?;
        Ok(Self {
            store,
            config,
            project_root: project_root.to_path_buf(),
        })
    }

    /// Locate the project root by walking up from `start` until a directory
    /// containing `.aqua` is found.
    pub fn locate_root(start: &Path) -> Result<PathBuf, AquaError> {
        find_project_root(start).ok_or_else(|| AquaError::NotInitialized(start.to_path_buf()))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &AquaConfig {
        &self.config
    }

    pub fn aqua_dir(&self) -> PathBuf {
        self.project_root.join(AQUA_DIR)
    }

    fn coordinator(&self) -> Coordinator<'_> {
        Coordinator::new(&self.store, &self.config)
    }

    /// The agent identity resolved for this invocation.
    ///
    /// # Errors
    ///
    /// `NotJoined` when the resolved id names no registered agent.
    pub fn current_agent(&self) -> Result<Agent, AquaError> {
        let agent_id = identity::resolve_agent_id(&self.aqua_dir());
        self.store.get_agent(&agent_id)?.ok_or(AquaError::NotJoined)
    }

    // =========================================================================
    // Agents
    // =========================================================================

    /// Register a new agent and bind it to the current session.
    pub fn join(
        &self,
        name: Option<String>,
        kind: AgentKind,
        role: Option<String>,
        capabilities: Vec<String>,
    ) -> Result<Agent> {
        let now = Utc::now();
        let agent = Agent {
            id: identity::generate_short_id(),
            name: name.unwrap_or_else(identity::generate_agent_name),
            kind,
            pid: Some(identity::current_pid()),
            status: AgentStatus::Active,
            last_heartbeat_at: now,
            registered_at: now,
            current_task_id: None,
            capabilities,
            metadata: BTreeMap::new(),
            last_progress: None,
            role,
        };
        self.store.create_agent(&agent)?;
        identity::store_session_identity(&self.aqua_dir(), &agent.id)?;
        Ok(agent)
    }

    /// Deregister the calling agent.
    ///
    /// Refuses while a task is held unless `force`, which abandons it first.
    pub fn leave(&self, force: bool) -> Result<Agent> {
        let agent = self.current_agent()?;

        if let Some(task_id) = &agent.current_task_id {
            if !force {
                return Err(AquaError::TaskHeld(task_id.clone()).into());
            }
            self.store
                .abandon_task(task_id, &format!("agent {} left", agent.name))?;
        }
        self.store.release_agent_locks(&agent.id)?;
        self.store.delete_agent(&agent.id)?;
        identity::clear_session_identity(&self.aqua_dir())?;
        Ok(agent)
    }

    pub fn list_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.store.list_agents(None)?)
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Add a task to the queue. The creator need not be joined.
    pub fn add_task(
        &self,
        title: String,
        description: Option<String>,
        priority: i64,
        tags: Vec<String>,
        depends_on: Vec<String>,
        max_retries: Option<i64>,
    ) -> Result<Task> {
        let created_by = self.current_agent().ok().map(|agent| agent.id);
        let now = Utc::now();
        let task = Task {
            id: identity::generate_short_id(),
            title,
            description,
            status: TaskStatus::Pending,
            priority,
            created_by,
            claimed_by: None,
            claim_term: None,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: max_retries.unwrap_or_else(|| self.config.tasks().max_retries()),
            tags,
            context: None,
            version: 1,
            depends_on,
        };
        self.store.create_task(&task)?;
        Ok(task)
    }

    pub fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        tag: Option<String>,
        mine: bool,
    ) -> Result<Vec<Task>> {
        let claimed_by = if mine {
            Some(self.current_agent()?.id)
        } else {
            None
        };
        Ok(self.store.list_tasks(&TaskFilter {
            status,
            claimed_by,
            tag,
        })?)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Task, AquaError> {
        self.store
            .get_task(task_id)?
            .ok_or_else(|| AquaError::ClaimFailed(task_id.to_string()))
    }

    /// Claim a specific task, or the next available one (role-aware).
    ///
    /// Heartbeats first and runs an opportunistic recovery sweep so work
    /// orphaned by crashed agents is back in the queue before selection.
    pub fn claim(&self, task_id: Option<&str>) -> Result<ClaimOutcome> {
        let agent = self.current_agent()?;
        self.store.touch_heartbeat(&agent.id)?;
        self.opportunistic_recovery();

        let coordinator = self.coordinator();
        match task_id {
            Some(task_id) => {
                let task = coordinator.claim_specific_task(&agent.id, task_id)?;
                Ok(ClaimOutcome {
                    task: Some(task),
                    role_match: true,
                })
            }
            None => {
                let (task, role_match) = coordinator.claim_next_task_for_role(&agent.id)?;
                Ok(ClaimOutcome { task, role_match })
            }
        }
    }

    /// Complete a task (the current one by default).
    pub fn done(&self, task_id: Option<&str>, summary: Option<&str>) -> Result<Task> {
        let agent = self.current_agent()?;
        self.store.touch_heartbeat(&agent.id)?;
        Ok(self.coordinator().complete_task(&agent.id, task_id, summary)?)
    }

    /// Fail a task (the current one by default).
    pub fn fail(&self, task_id: Option<&str>, error: &str) -> Result<Task> {
        let agent = self.current_agent()?;
        self.store.touch_heartbeat(&agent.id)?;
        Ok(self.coordinator().fail_task(&agent.id, task_id, error)?)
    }

    /// Checkpoint progress on the current task.
    pub fn progress(&self, note: &str) -> Result<Task> {
        let agent = self.current_agent()?;
        self.store.touch_heartbeat(&agent.id)?;

        let task_id = agent.current_task_id.ok_or(AquaError::NoCurrentTask)?;
        self.store.update_task_context(&task_id, note)?;
        self.store.set_agent_progress(&agent.id, note)?;
        self.get_task(&task_id).map_err(Into::into)
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Send a message; `to = None` broadcasts.
    pub fn send_message(&self, to: Option<&str>, content: &str) -> Result<Message> {
        let agent = self.current_agent()?;
        self.store.touch_heartbeat(&agent.id)?;

        let to_id = match to {
            Some(recipient) => Some(self.resolve_agent_ref(recipient)?.id),
            None => None,
        };
        Ok(self
            .store
            .send_message(&agent.id, to_id.as_deref(), content, "chat")?)
    }

    /// Fetch the inbox, marking fetched messages read for this agent.
    pub fn inbox(&self, include_read: bool, limit: usize) -> Result<Vec<Message>> {
        let agent = self.current_agent()?;
        self.store.touch_heartbeat(&agent.id)?;
        Ok(self.store.fetch_inbox(&agent.id, !include_read, limit)?)
    }

    /// Resolve an agent reference given as either an id or a name.
    fn resolve_agent_ref(&self, reference: &str) -> Result<Agent, AquaError> {
        if let Some(agent) = self.store.get_agent(reference)? {
            return Ok(agent);
        }
        self.store
            .get_agent_by_name(reference)?
            .ok_or(AquaError::NotJoined)
    }

    // =========================================================================
    // Leadership, recovery, observability
    // =========================================================================

    pub fn leader(&self) -> Result<Option<Leader>> {
        Ok(self.store.get_leader()?)
    }

    /// Attempt to become or remain leader.
    ///
    /// # Errors
    ///
    /// `LeaderContention` when another agent's lease stands.
    pub fn elect(&self, lease_secs: Option<u64>) -> Result<Leader> {
        let agent = self.current_agent()?;
        self.store.touch_heartbeat(&agent.id)?;

        let lease = lease_secs.unwrap_or_else(|| self.config.coordination().lease_secs());
        let (won, _term) = self.store.try_become_leader(&agent.id, lease)?;
        if !won {
            return Err(AquaError::LeaderContention.into());
        }
        self.store
            .get_leader()?
            .ok_or_else(|| AquaError::Schema("leader row vanished after election".into()).into())
    }

    pub fn recover(&self) -> Result<RecoverySummary> {
        Ok(self.coordinator().run_recovery()?)
    }

    pub fn doctor(&self) -> Result<DoctorReport> {
        Ok(self.coordinator().diagnose()?)
    }

    pub fn list_events(
        &self,
        event_type: Option<&str>,
        agent_id: Option<&str>,
        task_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        Ok(self.store.list_events(event_type, agent_id, task_id, limit)?)
    }

    pub fn status(&self) -> Result<StatusSummary> {
        let agents = self.store.list_agents(None)?;
        let agents_active = agents
            .iter()
            .filter(|a| a.status == AgentStatus::Active)
            .count();

        let mut tasks = BTreeMap::new();
        for status in [
            TaskStatus::Pending,
            TaskStatus::Claimed,
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Abandoned,
        ] {
            tasks.insert(status.as_str().to_string(), 0);
        }
        for (status, count) in self.store.task_counts()? {
            tasks.insert(status.as_str().to_string(), count);
        }

        Ok(StatusSummary {
            agents_total: agents.len(),
            agents_active,
            tasks,
            leader: self.store.get_leader()?,
        })
    }

    // =========================================================================
    // File locks
    // =========================================================================

    /// Take an advisory lock.
    ///
    /// # Errors
    ///
    /// `LockHeld` when another agent already holds the path.
    pub fn lock(&self, path: &str) -> Result<FileLock> {
        let agent = self.current_agent()?;
        self.store.touch_heartbeat(&agent.id)?;

        if self.store.lock_file(path, &agent.id)? {
            let lock = self
                .store
                .get_file_lock(path)?
                .ok_or_else(|| AquaError::Schema("lock row vanished after insert".into()))?;
            Ok(lock)
        } else {
            let holder = self
                .store
                .get_file_lock(path)?
                .ok_or_else(|| AquaError::Schema("lock conflict with no holder".into()))?;
            Err(AquaError::LockHeld {
                path: path.to_string(),
                holder: holder.agent_id,
            }
            .into())
        }
    }

    /// Release an advisory lock held by the calling agent.
    ///
    /// # Errors
    ///
    /// `NotLockHolder` when the path is unlocked or held by someone else.
    pub fn unlock(&self, path: &str) -> Result<()> {
        let agent = self.current_agent()?;
        if !self.store.unlock_file(path, &agent.id)? {
            return Err(AquaError::NotLockHolder(path.to_string()).into());
        }
        Ok(())
    }

    pub fn list_locks(&self) -> Result<Vec<FileLock>> {
        Ok(self.store.list_file_locks()?)
    }

    /// Recovery piggybacked on routine calls. Failures are logged, never
    /// surfaced: a broken sweep must not block the operation it rode on.
    fn opportunistic_recovery(&self) {
        if let Err(err) = self.coordinator().run_recovery() {
            warn!(error = %err, "opportunistic recovery failed");
        }
    }
}
