//! Claim orchestration and crash recovery.
//!
//! The coordinator is a thin layer over the store: it reads the current
//! leader term before each claim (fencing token), pairs the claim with the
//! agent's current-task pointer in one immediate transaction, and runs the
//! recovery sweep that marks dead agents, times out stuck claims, and
//! re-queues abandoned work.
//!
//! Recovery is deliberately forgiving: a failure on one agent or task is
//! logged as an event and the sweep moves on, so one bad row cannot halt it.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::AquaConfig;
use crate::domain::{Agent, AgentStatus, Task, TaskStatus};
use crate::errors::{AquaError, Result};
use crate::identity::process_alive;
use crate::storage::tasks::TaskFilter;
use crate::storage::Store;

/// Outcome of a full recovery cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoverySummary {
    /// Ids of agents newly marked dead.
    pub dead_agents: Vec<String>,
    /// Claimed tasks abandoned because the claim outlived the timeout.
    pub stale_tasks: usize,
    /// Abandoned tasks flipped back to pending.
    pub requeued_tasks: usize,
}

/// Read-only health report produced by `doctor`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DoctorReport {
    pub stale_agents: Vec<StaleAgent>,
    pub stale_claims: Vec<StaleClaim>,
    pub leader: Option<LeaderHealth>,
    /// Abandoned tasks that exhausted their retry budget and need a human.
    pub exhausted_tasks: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StaleAgent {
    pub id: String,
    pub name: String,
    pub heartbeat_age_secs: i64,
    pub pid_alive: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StaleClaim {
    pub task_id: String,
    pub claimed_by: Option<String>,
    pub claim_age_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderHealth {
    pub agent_id: String,
    pub term: i64,
    pub expired: bool,
}

/// Orchestrates claims and recovery over a store handle.
pub struct Coordinator<'a> {
    store: &'a Store,
    dead_threshold: Duration,
    claim_timeout: Duration,
}

impl<'a> Coordinator<'a> {
    /// Build a coordinator with thresholds from configuration.
    pub fn new(store: &'a Store, config: &AquaConfig) -> Self {
        let coordination = config.coordination();
        Self::with_thresholds(
            store,
            coordination.dead_threshold_secs(),
            coordination.claim_timeout_secs(),
        )
    }

    /// Build a coordinator with explicit thresholds (seconds).
    pub fn with_thresholds(store: &'a Store, dead_threshold_secs: u64, claim_timeout_secs: u64) -> Self {
        Self {
            store,
            dead_threshold: Duration::seconds(dead_threshold_secs as i64),
            claim_timeout: Duration::seconds(claim_timeout_secs as i64),
        }
    }

    /// Claim the next available task for an agent.
    ///
    /// Returns `None` when no claimable task exists or a concurrent claimer
    /// won the race for the selected task.
    pub fn claim_next_task(&self, agent_id: &str) -> Result<Option<Task>> {
        let term = self.store.current_term()?;
        let Some(candidate) = self.store.next_pending_task()? else {
            return Ok(None);
        };
        self.attempt_claim(agent_id, &candidate.id, term)
    }

    /// Claim the next task, preferring ones matching the agent's role.
    ///
    /// The flag reports whether the claimed task matched the role (`true`
    /// when the agent has no role or nothing was claimed); it is advisory
    /// and the caller decides what a mismatch means.
    pub fn claim_next_task_for_role(&self, agent_id: &str) -> Result<(Option<Task>, bool)> {
        let role = self
            .store
            .get_agent(agent_id)?
            .and_then(|agent| agent.role);
        let term = self.store.current_term()?;

        let (candidate, role_match) = self.store.next_pending_task_for_role(role.as_deref())?;
        let Some(candidate) = candidate else {
            return Ok((None, true));
        };
        match self.attempt_claim(agent_id, &candidate.id, term)? {
            Some(task) => Ok((Some(task), role_match)),
            None => Ok((None, true)),
        }
    }

    /// Claim one specific task.
    ///
    /// # Errors
    ///
    /// `DependencyUnmet` when prerequisites are not done; `ClaimFailed` when
    /// the task is missing or not pending.
    pub fn claim_specific_task(&self, agent_id: &str, task_id: &str) -> Result<Task> {
        let term = self.store.current_term()?;

        let Some(task) = self.store.get_task(task_id)? else {
            return Err(AquaError::ClaimFailed(task_id.to_string()));
        };
        let blocking = self.store.blocking_dependencies(&task)?;
        if !blocking.is_empty() {
            return Err(AquaError::DependencyUnmet {
                task: task_id.to_string(),
                blocking,
            });
        }

        self.attempt_claim(agent_id, task_id, term)?
            .ok_or_else(|| AquaError::ClaimFailed(task_id.to_string()))
    }

    /// One immediate transaction: conditional claim plus the agent's
    /// current-task pointer.
    fn attempt_claim(&self, agent_id: &str, task_id: &str, term: i64) -> Result<Option<Task>> {
        let claimed = self.store.immediate(|store| {
            if store.claim_task(task_id, agent_id, term)? {
                store.set_agent_task(agent_id, Some(task_id))?;
                Ok(true)
            } else {
                Ok(false)
            }
        })?;
        if claimed {
            self.store.get_task(task_id)
        } else {
            Ok(None)
        }
    }

    /// Complete a task; defaults to the agent's current task.
    pub fn complete_task(
        &self,
        agent_id: &str,
        task_id: Option<&str>,
        result: Option<&str>,
    ) -> Result<Task> {
        let task_id = self.resolve_task_id(agent_id, task_id)?;
        self.store.immediate(|store| {
            if !store.complete_task(&task_id, agent_id, result)? {
                return Err(AquaError::ClaimFailed(task_id.clone()));
            }
            store.set_agent_task(agent_id, None)?;
            Ok(())
        })?;
        self.store
            .get_task(&task_id)?
            .ok_or_else(|| AquaError::ClaimFailed(task_id))
    }

    /// Fail a task; defaults to the agent's current task.
    pub fn fail_task(&self, agent_id: &str, task_id: Option<&str>, error: &str) -> Result<Task> {
        let task_id = self.resolve_task_id(agent_id, task_id)?;
        self.store.immediate(|store| {
            if !store.fail_task(&task_id, agent_id, error)? {
                return Err(AquaError::ClaimFailed(task_id.clone()));
            }
            store.set_agent_task(agent_id, None)?;
            Ok(())
        })?;
        self.store
            .get_task(&task_id)?
            .ok_or_else(|| AquaError::ClaimFailed(task_id))
    }

    fn resolve_task_id(&self, agent_id: &str, task_id: Option<&str>) -> Result<String> {
        match task_id {
            Some(id) => Ok(id.to_string()),
            None => self
                .store
                .get_agent(agent_id)?
                .and_then(|agent| agent.current_task_id)
                .ok_or(AquaError::NoCurrentTask),
        }
    }

    /// Mark crashed agents dead and abandon their tasks.
    ///
    /// An agent is deemed dead only when its heartbeat is older than the
    /// dead threshold AND its recorded PID no longer exists. A stale
    /// heartbeat with a live PID is flagged `agent_unresponsive` and left
    /// alone, so a merely slow process is never evicted.
    pub fn recover_dead_agents(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let threshold = now - self.dead_threshold;
        let mut recovered = Vec::new();

        for agent in self.store.list_agents(Some(AgentStatus::Active))? {
            if agent.last_heartbeat_at >= threshold {
                continue;
            }

            if let Some(pid) = agent.pid {
                if process_alive(pid) {
                    self.store.append_event(
                        "agent_unresponsive",
                        Some(&agent.id),
                        None,
                        Some(json!({
                            "pid": pid,
                            "last_heartbeat_at": agent.last_heartbeat_at.to_rfc3339(),
                        })),
                    )?;
                    continue;
                }
            }

            match self.recover_agent(&agent) {
                Ok(()) => recovered.push(agent.id),
                Err(err) => {
                    warn!(agent = %agent.id, error = %err, "agent recovery failed");
                    self.store.append_event(
                        "recovery_error",
                        Some(&agent.id),
                        None,
                        Some(json!({ "error": err.to_string() })),
                    )?;
                }
            }
        }

        Ok(recovered)
    }

    fn recover_agent(&self, agent: &Agent) -> Result<()> {
        self.store.set_agent_status(&agent.id, AgentStatus::Dead)?;

        let claimed = self.store.list_tasks(&TaskFilter {
            status: Some(TaskStatus::Claimed),
            claimed_by: Some(agent.id.clone()),
            ..Default::default()
        })?;
        for task in &claimed {
            self.store
                .abandon_task(&task.id, &format!("agent {} died", agent.name))?;
        }
        self.store.set_agent_task(&agent.id, None)?;
        let locks_released = self.store.release_agent_locks(&agent.id)?;

        self.store.append_event(
            "agent_died",
            Some(&agent.id),
            None,
            Some(json!({
                "reason": "heartbeat_timeout",
                "pid": agent.pid,
                "tasks_released": claimed.len(),
                "locks_released": locks_released,
            })),
        )?;
        debug!(agent = %agent.id, tasks = claimed.len(), "dead agent recovered");
        Ok(())
    }

    /// Abandon claims that outlived the claim timeout. Returns the count.
    pub fn recover_stale_tasks(&self) -> Result<usize> {
        let threshold = Utc::now() - self.claim_timeout;
        let mut recovered = 0;

        let claimed = self.store.list_tasks(&TaskFilter {
            status: Some(TaskStatus::Claimed),
            ..Default::default()
        })?;
        for task in claimed {
            if !claim_is_stale(&task, threshold) {
                continue;
            }
            let reason = format!(
                "claim timed out after {}s",
                self.claim_timeout.num_seconds()
            );
            match self.store.abandon_task(&task.id, &reason) {
                Ok(true) => {
                    if let Some(agent_id) = &task.claimed_by {
                        self.store.set_agent_task(agent_id, None)?;
                    }
                    recovered += 1;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(task = %task.id, error = %err, "stale-claim recovery failed");
                    self.store.append_event(
                        "recovery_error",
                        None,
                        Some(&task.id),
                        Some(json!({ "error": err.to_string() })),
                    )?;
                }
            }
        }

        Ok(recovered)
    }

    /// Full recovery cycle: dead agents, stale claims, then re-queue.
    pub fn run_recovery(&self) -> Result<RecoverySummary> {
        let dead_agents = self.recover_dead_agents()?;
        let stale_tasks = self.recover_stale_tasks()?;
        let requeued_tasks = self.store.requeue_abandoned()?;
        Ok(RecoverySummary {
            dead_agents,
            stale_tasks,
            requeued_tasks,
        })
    }

    /// Read-only diagnosis: what a recovery run would look at, without
    /// changing anything.
    pub fn diagnose(&self) -> Result<DoctorReport> {
        let now = Utc::now();
        let mut report = DoctorReport::default();

        for agent in self.store.list_agents(Some(AgentStatus::Active))? {
            let age = now - agent.last_heartbeat_at;
            if age > self.dead_threshold {
                report.stale_agents.push(StaleAgent {
                    pid_alive: agent.pid.map(process_alive).unwrap_or(false),
                    id: agent.id,
                    name: agent.name,
                    heartbeat_age_secs: age.num_seconds(),
                });
            }
        }

        for task in self.store.list_tasks(&TaskFilter {
            status: Some(TaskStatus::Claimed),
            ..Default::default()
        })? {
            if claim_is_stale(&task, now - self.claim_timeout) {
                let age = task
                    .claimed_at
                    .map(|at| (now - at).num_seconds())
                    .unwrap_or(0);
                report.stale_claims.push(StaleClaim {
                    task_id: task.id,
                    claimed_by: task.claimed_by,
                    claim_age_secs: age,
                });
            }
        }

        for task in self.store.list_tasks(&TaskFilter {
            status: Some(TaskStatus::Abandoned),
            ..Default::default()
        })? {
            if task.retry_count >= task.max_retries {
                report.exhausted_tasks.push(task.id);
            }
        }

        report.leader = self.store.get_leader()?.map(|leader| LeaderHealth {
            expired: leader.is_expired_at(now),
            agent_id: leader.agent_id,
            term: leader.term,
        });

        Ok(report)
    }
}

fn claim_is_stale(task: &Task, threshold: DateTime<Utc>) -> bool {
    matches!(task.claimed_at, Some(at) if at < threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AgentKind;
    use crate::storage::codec;
    use rusqlite::params;
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, Store) {
        let temp = tempdir().unwrap();
        let store = Store::init(temp.path(), 5000).unwrap();
        (temp, store)
    }

    fn join(store: &Store, id: &str, name: &str, pid: Option<u32>) {
        let now = Utc::now();
        store
            .create_agent(&Agent {
                id: id.to_string(),
                name: name.to_string(),
                kind: AgentKind::Generic,
                pid,
                status: AgentStatus::Active,
                last_heartbeat_at: now,
                registered_at: now,
                current_task_id: None,
                capabilities: vec![],
                metadata: Default::default(),
                last_progress: None,
                role: None,
            })
            .unwrap();
    }

    fn add_task(store: &Store, id: &str, title: &str, priority: i64) {
        let now = Utc::now();
        store
            .create_task(&Task {
                id: id.to_string(),
                title: title.to_string(),
                description: None,
                status: TaskStatus::Pending,
                priority,
                created_by: None,
                claimed_by: None,
                claim_term: None,
                created_at: now,
                updated_at: now,
                claimed_at: None,
                completed_at: None,
                result: None,
                error: None,
                retry_count: 0,
                max_retries: 3,
                tags: vec![],
                context: None,
                version: 1,
                depends_on: vec![],
            })
            .unwrap();
    }

    fn backdate_heartbeat(store: &Store, agent_id: &str, secs: i64) {
        let stale = codec::encode_ts(Utc::now() - Duration::seconds(secs));
        store
            .conn()
            .execute(
                "UPDATE agents SET last_heartbeat_at = ?1 WHERE id = ?2",
                params![stale, agent_id],
            )
            .unwrap();
    }

    #[test]
    fn test_claim_pairs_current_task_pointer() {
        let (_t, store) = test_store();
        join(&store, "a1", "worker", None);
        add_task(&store, "t1", "fix parser", 5);

        let coordinator = Coordinator::with_thresholds(&store, 300, 1800);
        let claimed = coordinator.claim_next_task("a1").unwrap().unwrap();
        assert_eq!(claimed.id, "t1");
        assert_eq!(
            store.get_agent("a1").unwrap().unwrap().current_task_id,
            Some("t1".to_string())
        );
    }

    #[test]
    fn test_complete_current_task_clears_pointer() {
        let (_t, store) = test_store();
        join(&store, "a1", "worker", None);
        add_task(&store, "t1", "fix parser", 5);

        let coordinator = Coordinator::with_thresholds(&store, 300, 1800);
        coordinator.claim_next_task("a1").unwrap();
        let done = coordinator
            .complete_task("a1", None, Some("patched"))
            .unwrap();

        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.result.as_deref(), Some("patched"));
        assert!(store
            .get_agent("a1")
            .unwrap()
            .unwrap()
            .current_task_id
            .is_none());
    }

    #[test]
    fn test_complete_without_current_task() {
        let (_t, store) = test_store();
        join(&store, "a1", "worker", None);
        let coordinator = Coordinator::with_thresholds(&store, 300, 1800);

        let err = coordinator.complete_task("a1", None, None).unwrap_err();
        assert_eq!(err.kind(), "no_current_task");
    }

    #[test]
    fn test_claim_specific_unmet_dependency() {
        let (_t, store) = test_store();
        join(&store, "a1", "worker", None);
        add_task(&store, "t1", "first", 5);
        let now = Utc::now();
        store
            .create_task(&Task {
                id: "t2".to_string(),
                title: "second".to_string(),
                description: None,
                status: TaskStatus::Pending,
                priority: 5,
                created_by: None,
                claimed_by: None,
                claim_term: None,
                created_at: now,
                updated_at: now,
                claimed_at: None,
                completed_at: None,
                result: None,
                error: None,
                retry_count: 0,
                max_retries: 3,
                tags: vec![],
                context: None,
                version: 1,
                depends_on: vec!["t1".to_string()],
            })
            .unwrap();

        let coordinator = Coordinator::with_thresholds(&store, 300, 1800);
        let err = coordinator.claim_specific_task("a1", "t2").unwrap_err();
        match err {
            AquaError::DependencyUnmet { blocking, .. } => {
                assert_eq!(blocking, vec!["t1".to_string()]);
            }
            other => panic!("expected DependencyUnmet, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_of_dead_agent() {
        let (_t, store) = test_store();
        // PID far outside any plausible pid range on the test host.
        join(&store, "a1", "doomed", Some(999_999_999));
        add_task(&store, "t1", "orphan me", 5);

        let coordinator = Coordinator::with_thresholds(&store, 300, 1800);
        coordinator.claim_next_task("a1").unwrap();
        backdate_heartbeat(&store, "a1", 400);

        let summary = coordinator.run_recovery().unwrap();
        assert_eq!(summary.dead_agents, vec!["a1".to_string()]);
        assert_eq!(summary.stale_tasks, 0);
        assert_eq!(summary.requeued_tasks, 1);

        let agent = store.get_agent("a1").unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Dead);
        let task = store.get_task("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
    }

    #[test]
    fn test_live_pid_is_flagged_not_recovered() {
        let (_t, store) = test_store();
        // Our own PID is definitely alive.
        join(&store, "a1", "slowpoke", Some(std::process::id()));
        add_task(&store, "t1", "slow work", 5);

        let coordinator = Coordinator::with_thresholds(&store, 300, 1800);
        coordinator.claim_next_task("a1").unwrap();
        backdate_heartbeat(&store, "a1", 400);

        let summary = coordinator.run_recovery().unwrap();
        assert!(summary.dead_agents.is_empty());

        // Agent stays active, task stays claimed, but the event log notes it.
        assert_eq!(
            store.get_agent("a1").unwrap().unwrap().status,
            AgentStatus::Active
        );
        assert_eq!(
            store.get_task("t1").unwrap().unwrap().status,
            TaskStatus::Claimed
        );
        let flagged = store
            .list_events(Some("agent_unresponsive"), Some("a1"), None, 10)
            .unwrap();
        assert_eq!(flagged.len(), 1);
    }

    #[test]
    fn test_fresh_heartbeat_never_recovered() {
        let (_t, store) = test_store();
        join(&store, "a1", "healthy", Some(999_999_999));

        let coordinator = Coordinator::with_thresholds(&store, 300, 1800);
        let recovered = coordinator.recover_dead_agents().unwrap();
        assert!(recovered.is_empty());
        assert_eq!(
            store.get_agent("a1").unwrap().unwrap().status,
            AgentStatus::Active
        );
    }

    #[test]
    fn test_stale_claim_timeout() {
        let (_t, store) = test_store();
        join(&store, "a1", "worker", None);
        add_task(&store, "t1", "stuck", 5);

        let coordinator = Coordinator::with_thresholds(&store, 300, 600);
        coordinator.claim_next_task("a1").unwrap();

        // Backdate the claim past the timeout.
        let old = codec::encode_ts(Utc::now() - Duration::seconds(3600));
        store
            .conn()
            .execute(
                "UPDATE tasks SET claimed_at = ?1 WHERE id = 't1'",
                params![old],
            )
            .unwrap();

        assert_eq!(coordinator.recover_stale_tasks().unwrap(), 1);
        let task = store.get_task("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Abandoned);
        // The claimant's pointer was cleared too.
        assert!(store
            .get_agent("a1")
            .unwrap()
            .unwrap()
            .current_task_id
            .is_none());
    }

    #[test]
    fn test_recovery_is_noop_on_healthy_store() {
        let (_t, store) = test_store();
        let coordinator = Coordinator::with_thresholds(&store, 300, 1800);
        assert_eq!(coordinator.run_recovery().unwrap(), RecoverySummary::default());
    }

    #[test]
    fn test_diagnose_reports_without_mutating() {
        let (_t, store) = test_store();
        join(&store, "a1", "stale", Some(std::process::id()));
        backdate_heartbeat(&store, "a1", 400);
        store.try_become_leader("a1", 30).unwrap();

        let coordinator = Coordinator::with_thresholds(&store, 300, 1800);
        let report = coordinator.diagnose().unwrap();

        assert_eq!(report.stale_agents.len(), 1);
        assert!(report.stale_agents[0].pid_alive);
        let leader = report.leader.unwrap();
        assert_eq!(leader.agent_id, "a1");
        assert!(!leader.expired);

        // Nothing changed.
        assert_eq!(
            store.get_agent("a1").unwrap().unwrap().status,
            AgentStatus::Active
        );
    }
}
