//! Shared fixtures for integration tests.

use chrono::Utc;
use tempfile::TempDir;

use aqua::domain::{Agent, AgentKind, AgentStatus, Task, TaskStatus};
use aqua::storage::Store;

/// An isolated store in a fresh temp directory.
#[allow(dead_code)]
pub fn temp_store() -> (TempDir, Store) {
    let temp = TempDir::new().unwrap();
    let store = Store::init(temp.path(), 5000).unwrap();
    (temp, store)
}

/// Build an agent with sensible test defaults.
#[allow(dead_code)]
pub fn agent(id: &str, name: &str) -> Agent {
    let now = Utc::now();
    Agent {
        id: id.to_string(),
        name: name.to_string(),
        kind: AgentKind::Generic,
        pid: Some(std::process::id()),
        status: AgentStatus::Active,
        last_heartbeat_at: now,
        registered_at: now,
        current_task_id: None,
        capabilities: vec![],
        metadata: Default::default(),
        last_progress: None,
        role: None,
    }
}

/// Build a pending task with sensible test defaults.
#[allow(dead_code)]
pub fn task(id: &str, title: &str, priority: i64) -> Task {
    let now = Utc::now();
    Task {
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
    }
}

/// Same as [`task`] but with dependencies.
#[allow(dead_code)]
pub fn task_with_deps(id: &str, title: &str, priority: i64, deps: &[&str]) -> Task {
    let mut t = task(id, title, priority);
    t.depends_on = deps.iter().map(|d| d.to_string()).collect();
    t
}
