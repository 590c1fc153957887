//! Task queue persistence and the atomic claim protocol.
//!
//! Selection scans pending tasks ordered by `priority DESC, created_at ASC`
//! (ties broken by insertion order) and returns the first whose dependencies
//! are all done. The claim itself is a single conditional UPDATE gated on
//! `status = 'pending'`; it succeeds iff exactly one row changed, which
//! linearizes `pending -> claimed` per task across all processes.

use chrono::Utc;
use rusqlite::params;
use serde_json::json;
use tracing::debug;

use super::codec::{self, encode_list};
use super::Store;
use crate::domain::{Task, TaskStatus};
use crate::errors::Result;

/// Optional filters for task listings.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub claimed_by: Option<String>,
    pub tag: Option<String>,
}

impl Store {
    /// Insert a new task.
    pub fn create_task(&self, task: &Task) -> Result<()> {
        self.conn().execute(
            "INSERT INTO tasks (id, title, description, status, priority, created_by,
                                claimed_by, claim_term, created_at, updated_at, claimed_at,
                                completed_at, result, error, retry_count, max_retries,
                                tags, context, version, depends_on)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20)",
            params![
                task.id,
                task.title,
                task.description,
                task.status.as_str(),
                task.priority,
                task.created_by,
                task.claimed_by,
                task.claim_term,
                codec::encode_ts(task.created_at),
                codec::encode_ts(task.updated_at),
                task.claimed_at.map(codec::encode_ts),
                task.completed_at.map(codec::encode_ts),
                task.result,
                task.error,
                task.retry_count,
                task.max_retries,
                encode_list(&task.tags),
                task.context,
                task.version,
                if task.depends_on.is_empty() {
                    None
                } else {
                    Some(encode_list(&task.depends_on))
                },
            ],
        )?;
        self.append_event(
            "task_created",
            task.created_by.as_deref(),
            Some(&task.id),
            Some(json!({ "title": task.title, "priority": task.priority })),
        )?;
        Ok(())
    }

    /// Fetch a task by id.
    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let mut stmt = self.conn().prepare("SELECT * FROM tasks WHERE id = ?1")?;
        let mut rows = stmt.query(params![task_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(codec::decode_task(row)?)),
            None => Ok(None),
        }
    }

    /// List tasks in queue order, with optional filters.
    ///
    /// Tag filtering matches on the encoded JSON list, which is exact for
    /// whole-tag queries because each element is quoted.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut sql = String::from("SELECT * FROM tasks WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status.as_str().to_string()));
        }
        if let Some(claimed_by) = &filter.claimed_by {
            sql.push_str(" AND claimed_by = ?");
            args.push(Box::new(claimed_by.clone()));
        }
        if let Some(tag) = &filter.tag {
            sql.push_str(" AND tags LIKE ?");
            args.push(Box::new(format!("%\"{tag}\"%")));
        }
        sql.push_str(" ORDER BY priority DESC, created_at ASC, rowid ASC");

        let mut stmt = self.conn().prepare(&sql)?;
        let params = rusqlite::params_from_iter(args.iter().map(|p| p.as_ref()));
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(codec::decode_task(row)?);
        }
        Ok(out)
    }

    /// The next claimable pending task: highest priority, oldest first, with
    /// all dependencies done. Returns `None` when the queue is empty or fully
    /// blocked.
    pub fn next_pending_task(&self) -> Result<Option<Task>> {
        for task in self.pending_tasks_in_order()? {
            if self.dependencies_met(&task)? {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Role-preferring variant: first claimable pending task whose tags
    /// contain the role, falling back to any claimable task. The flag
    /// reports whether the returned task matched the role; it is advisory.
    pub fn next_pending_task_for_role(&self, role: Option<&str>) -> Result<(Option<Task>, bool)> {
        let Some(role) = role else {
            return Ok((self.next_pending_task()?, true));
        };

        let pending = self.pending_tasks_in_order()?;
        for task in &pending {
            if task.matches_role(role) && self.dependencies_met(task)? {
                return Ok((Some(task.clone()), true));
            }
        }
        for task in pending {
            if self.dependencies_met(&task)? {
                return Ok((Some(task), false));
            }
        }
        Ok((None, true))
    }

    fn pending_tasks_in_order(&self) -> Result<Vec<Task>> {
        let mut stmt = self.conn().prepare(
            "SELECT * FROM tasks WHERE status = 'pending'
             ORDER BY priority DESC, created_at ASC, rowid ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(codec::decode_task(row)?);
        }
        Ok(out)
    }

    /// Whether every dependency of `task` is done.
    pub fn dependencies_met(&self, task: &Task) -> Result<bool> {
        Ok(self.blocking_dependencies(task)?.is_empty())
    }

    /// Ids of dependencies that are missing or not yet done.
    pub fn blocking_dependencies(&self, task: &Task) -> Result<Vec<String>> {
        let mut blocking = Vec::new();
        for dep_id in &task.depends_on {
            match self.get_task(dep_id)? {
                Some(dep) if dep.status == TaskStatus::Done => {}
                _ => blocking.push(dep_id.clone()),
            }
        }
        Ok(blocking)
    }

    /// Atomically claim a task for an agent, recording the leader term in
    /// effect as a fencing token. Succeeds iff the task was still pending.
    pub fn claim_task(&self, task_id: &str, agent_id: &str, term: i64) -> Result<bool> {
        let now = codec::encode_ts(Utc::now());
        let changed = self.conn().execute(
            "UPDATE tasks
                SET status = 'claimed', claimed_by = ?1, claimed_at = ?2,
                    claim_term = ?3, updated_at = ?2, version = version + 1
              WHERE id = ?4 AND status = 'pending'",
            params![agent_id, now, term, task_id],
        )?;
        if changed == 1 {
            self.append_event("task_claimed", Some(agent_id), Some(task_id), None)?;
            debug!(task = task_id, agent = agent_id, term, "task claimed");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Mark a claimed task done. Fenced on the claiming agent.
    pub fn complete_task(
        &self,
        task_id: &str,
        agent_id: &str,
        result: Option<&str>,
    ) -> Result<bool> {
        let now = codec::encode_ts(Utc::now());
        let changed = self.conn().execute(
            "UPDATE tasks
                SET status = 'done', completed_at = ?1, result = ?2,
                    updated_at = ?1, version = version + 1
              WHERE id = ?3 AND claimed_by = ?4 AND status = 'claimed'",
            params![now, result, task_id, agent_id],
        )?;
        if changed == 1 {
            self.append_event(
                "task_completed",
                Some(agent_id),
                Some(task_id),
                result.map(|r| json!({ "result": r })),
            )?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Mark a claimed task failed and charge a retry. Fenced on the claiming
    /// agent.
    pub fn fail_task(&self, task_id: &str, agent_id: &str, error: &str) -> Result<bool> {
        let now = codec::encode_ts(Utc::now());
        let changed = self.conn().execute(
            "UPDATE tasks
                SET status = 'failed', error = ?1, updated_at = ?2,
                    retry_count = retry_count + 1, version = version + 1
              WHERE id = ?3 AND claimed_by = ?4 AND status = 'claimed'",
            params![error, now, task_id, agent_id],
        )?;
        if changed == 1 {
            self.append_event(
                "task_failed",
                Some(agent_id),
                Some(task_id),
                Some(json!({ "error": error })),
            )?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Recovery-only transition: release a claimed task back to un-owned,
    /// whoever the claimant was. Charges a retry and records the reason.
    pub fn abandon_task(&self, task_id: &str, reason: &str) -> Result<bool> {
        let now = codec::encode_ts(Utc::now());
        let changed = self.conn().execute(
            "UPDATE tasks
                SET status = 'abandoned', claimed_by = NULL, error = ?1,
                    updated_at = ?2, retry_count = retry_count + 1, version = version + 1
              WHERE id = ?3 AND status = 'claimed'",
            params![reason, now, task_id],
        )?;
        if changed == 1 {
            self.append_event(
                "task_abandoned",
                None,
                Some(task_id),
                Some(json!({ "reason": reason })),
            )?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Flip abandoned tasks below their retry cap back to pending. Tasks at
    /// or over the cap stay abandoned for human attention. Returns the count
    /// re-queued.
    pub fn requeue_abandoned(&self) -> Result<usize> {
        let now = codec::encode_ts(Utc::now());
        let changed = self.conn().execute(
            "UPDATE tasks
                SET status = 'pending', updated_at = ?1, version = version + 1
              WHERE status = 'abandoned' AND retry_count < max_retries",
            params![now],
        )?;
        if changed > 0 {
            self.append_event(
                "tasks_requeued",
                None,
                None,
                Some(json!({ "count": changed })),
            )?;
        }
        Ok(changed)
    }

    /// Write a progress checkpoint into the task's context without touching
    /// its status.
    pub fn update_task_context(&self, task_id: &str, context: &str) -> Result<bool> {
        let now = codec::encode_ts(Utc::now());
        let changed = self.conn().execute(
            "UPDATE tasks SET context = ?1, updated_at = ?2, version = version + 1
              WHERE id = ?3",
            params![context, now, task_id],
        )?;
        Ok(changed == 1)
    }

    /// Count tasks by status.
    pub fn task_counts(&self) -> Result<Vec<(TaskStatus, i64)>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let mut rows = stmt.query([])?;
        let mut counts = Vec::new();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            counts.push((TaskStatus::parse(&status)?, row.get(1)?));
        }
        Ok(counts)
    }
}
