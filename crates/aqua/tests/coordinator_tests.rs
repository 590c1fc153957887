//! Coordinator integration tests: claiming, completion, failure, dependency
//! chains, and the crash-recovery sweep.

mod common;

use chrono::{Duration, Utc};
use rusqlite::params;

use aqua::coordinator::Coordinator;
use aqua::domain::{AgentStatus, TaskStatus};
use aqua::errors::AquaError;
use aqua::storage::Store;
use common::{agent, task, task_with_deps, temp_store};

fn backdate_heartbeat(store: &Store, agent_id: &str, secs: i64) {
    let stale = (Utc::now() - Duration::seconds(secs))
        .naive_utc()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string();
    store
        .conn()
        .execute(
            "UPDATE agents SET last_heartbeat_at = ?1 WHERE id = ?2",
            params![stale, agent_id],
        )
        .unwrap();
}

#[test]
fn single_agent_single_task() {
    // Scenario: join, add one task, claim it, finish it with a summary.
    let (_t, store) = temp_store();
    store.create_agent(&agent("bf01", "brave-falcon")).unwrap();
    store.create_task(&task("t1", "fix parser", 5)).unwrap();

    let coordinator = Coordinator::with_thresholds(&store, 300, 1800);
    let claimed = coordinator.claim_next_task("bf01").unwrap().unwrap();
    assert_eq!(claimed.id, "t1");
    assert_eq!(claimed.status, TaskStatus::Claimed);
    assert_eq!(claimed.claimed_by.as_deref(), Some("bf01"));

    let done = coordinator
        .complete_task("bf01", None, Some("patched"))
        .unwrap();
    assert_eq!(done.status, TaskStatus::Done);
    assert_eq!(done.result.as_deref(), Some("patched"));
    assert!(done.completed_at.is_some());
}

#[test]
fn claim_respects_priority_and_age() {
    let (_t, store) = temp_store();
    store.create_agent(&agent("a1", "agent-1")).unwrap();
    store.create_task(&task("low", "low priority", 1)).unwrap();
    store.create_task(&task("high", "high priority", 10)).unwrap();
    store.create_task(&task("high-late", "late twin", 10)).unwrap();

    let coordinator = Coordinator::with_thresholds(&store, 300, 1800);
    let first = coordinator.claim_next_task("a1").unwrap().unwrap();
    assert_eq!(first.title, "high priority");
}

#[test]
fn claim_when_queue_empty() {
    let (_t, store) = temp_store();
    store.create_agent(&agent("a1", "agent-1")).unwrap();

    let coordinator = Coordinator::with_thresholds(&store, 300, 1800);
    assert!(coordinator.claim_next_task("a1").unwrap().is_none());
}

#[test]
fn dependency_chain_gates_selection() {
    // Scenario: t1 done, t2 depends on t1 (claimable), t3 depends on the
    // still-pending t4 (never selectable).
    let (_t, store) = temp_store();
    store.create_agent(&agent("a1", "agent-1")).unwrap();

    store.create_task(&task("t1", "first", 5)).unwrap();
    store.claim_task("t1", "a1", 0).unwrap();
    store.complete_task("t1", "a1", None).unwrap();
    store.set_agent_task("a1", None).unwrap();

    store
        .create_task(&task_with_deps("t2", "second", 5, &["t1"]))
        .unwrap();
    store
        .create_task(&task_with_deps("t3", "blocked", 9, &["t4"]))
        .unwrap();
    store.create_task(&task("t4", "prerequisite", 1)).unwrap();

    let coordinator = Coordinator::with_thresholds(&store, 300, 1800);

    // t3 has the highest priority but is gated; t2's dependency is met but
    // t4 outranks nothing — priority order among unblocked tasks is t2 at 5
    // over t4 at 1.
    let next = coordinator.claim_next_task("a1").unwrap().unwrap();
    assert_eq!(next.id, "t2");

    let next = coordinator.claim_next_task("a1").unwrap().unwrap();
    assert_ne!(next.id, "t3", "a gated task must never be selected");
    assert_eq!(next.id, "t4");
}

#[test]
fn crash_recovery_requeues_orphaned_task() {
    // Scenario: an agent with a dead PID claims a task, its heartbeat goes
    // stale, and one recovery pass returns the work to the queue.
    let (_t, store) = temp_store();
    let mut crashed = agent("a1", "crashed");
    crashed.pid = Some(999_999_999);
    store.create_agent(&crashed).unwrap();
    store.create_task(&task("t1", "orphaned work", 5)).unwrap();

    let coordinator = Coordinator::with_thresholds(&store, 300, 1800);
    coordinator.claim_next_task("a1").unwrap();
    backdate_heartbeat(&store, "a1", 400);

    let summary = coordinator.run_recovery().unwrap();
    assert_eq!(summary.dead_agents, vec!["a1".to_string()]);
    assert_eq!(summary.stale_tasks, 0);
    assert_eq!(summary.requeued_tasks, 1);

    assert_eq!(
        store.get_agent("a1").unwrap().unwrap().status,
        AgentStatus::Dead
    );
    let recovered = store.get_task("t1").unwrap().unwrap();
    assert_eq!(recovered.status, TaskStatus::Pending);
    assert_eq!(recovered.retry_count, 1);
    assert!(recovered.claimed_by.is_none());
}

#[test]
fn live_process_with_stale_heartbeat_is_spared() {
    let (_t, store) = temp_store();
    // The test process itself: stale heartbeat, but the PID is alive.
    store.create_agent(&agent("a1", "slow-agent")).unwrap();
    store.create_task(&task("t1", "slow work", 5)).unwrap();

    let coordinator = Coordinator::with_thresholds(&store, 300, 1800);
    coordinator.claim_next_task("a1").unwrap();
    backdate_heartbeat(&store, "a1", 400);

    let summary = coordinator.run_recovery().unwrap();
    assert!(summary.dead_agents.is_empty());
    assert_eq!(
        store.get_agent("a1").unwrap().unwrap().status,
        AgentStatus::Active
    );
    assert_eq!(
        store.get_task("t1").unwrap().unwrap().status,
        TaskStatus::Claimed,
        "tasks of a live agent must remain claimed"
    );

    let flagged = store
        .list_events(Some("agent_unresponsive"), Some("a1"), None, 10)
        .unwrap();
    assert_eq!(flagged.len(), 1);
}

#[test]
fn recovery_releases_dead_agents_locks() {
    let (_t, store) = temp_store();
    let mut crashed = agent("a1", "crashed");
    crashed.pid = Some(999_999_999);
    store.create_agent(&crashed).unwrap();
    store.lock_file("src/main.rs", "a1").unwrap();
    backdate_heartbeat(&store, "a1", 400);

    let coordinator = Coordinator::with_thresholds(&store, 300, 1800);
    coordinator.run_recovery().unwrap();

    assert!(store.get_file_lock("src/main.rs").unwrap().is_none());
}

#[test]
fn retry_cap_limits_requeue() {
    let (_t, store) = temp_store();
    store.create_agent(&agent("a1", "agent-1")).unwrap();

    let mut capped = task("t1", "fragile", 5);
    capped.max_retries = 2;
    store.create_task(&capped).unwrap();

    let coordinator = Coordinator::with_thresholds(&store, 300, 1800);

    // Two abandon/requeue cycles exhaust the budget.
    for round in 1..=2 {
        let claimed = coordinator.claim_next_task("a1").unwrap();
        assert!(claimed.is_some(), "round {round} should find the task");
        store.abandon_task("t1", "sweep").unwrap();
        store.set_agent_task("a1", None).unwrap();
        let requeued = store.requeue_abandoned().unwrap();
        if round < 2 {
            assert_eq!(requeued, 1);
        } else {
            assert_eq!(requeued, 0, "over-cap task must stay abandoned");
        }
    }

    let exhausted = store.get_task("t1").unwrap().unwrap();
    assert_eq!(exhausted.status, TaskStatus::Abandoned);
    assert_eq!(exhausted.retry_count, 2);
}

#[test]
fn failed_task_is_terminal_for_recovery() {
    let (_t, store) = temp_store();
    store.create_agent(&agent("a1", "agent-1")).unwrap();
    store.create_task(&task("t1", "will fail", 5)).unwrap();

    let coordinator = Coordinator::with_thresholds(&store, 300, 1800);
    coordinator.claim_next_task("a1").unwrap();
    coordinator.fail_task("a1", None, "broke").unwrap();

    // Neither the sweep nor a claim touches it again.
    let summary = coordinator.run_recovery().unwrap();
    assert_eq!(summary.requeued_tasks, 0);
    assert!(coordinator.claim_next_task("a1").unwrap().is_none());
    assert_eq!(
        store.get_task("t1").unwrap().unwrap().status,
        TaskStatus::Failed
    );
}

#[test]
fn role_preference_reported_to_caller() {
    let (_t, store) = temp_store();
    let mut docs_agent = agent("a1", "doc-writer");
    docs_agent.role = Some("docs".to_string());
    store.create_agent(&docs_agent).unwrap();

    let mut tagged = task("t-doc", "document the api", 2);
    tagged.tags = vec!["docs".to_string()];
    store.create_task(&task("t-hot", "urgent refactor", 9)).unwrap();
    store.create_task(&tagged).unwrap();

    let coordinator = Coordinator::with_thresholds(&store, 300, 1800);
    let (claimed, role_match) = coordinator.claim_next_task_for_role("a1").unwrap();
    assert_eq!(claimed.unwrap().id, "t-doc");
    assert!(role_match);

    // Next claim falls back to the non-matching task and says so.
    store.set_agent_task("a1", None).unwrap();
    let (claimed, role_match) = coordinator.claim_next_task_for_role("a1").unwrap();
    assert_eq!(claimed.unwrap().id, "t-hot");
    assert!(!role_match);
}

#[test]
fn claim_specific_reports_blockers() {
    let (_t, store) = temp_store();
    store.create_agent(&agent("a1", "agent-1")).unwrap();
    store.create_task(&task("t1", "prerequisite", 5)).unwrap();
    store
        .create_task(&task_with_deps("t2", "gated", 5, &["t1"]))
        .unwrap();

    let coordinator = Coordinator::with_thresholds(&store, 300, 1800);
    match coordinator.claim_specific_task("a1", "t2") {
        Err(AquaError::DependencyUnmet { task, blocking }) => {
            assert_eq!(task, "t2");
            assert_eq!(blocking, vec!["t1".to_string()]);
        }
        other => panic!("expected DependencyUnmet, got {other:?}"),
    }

    // A nonexistent task is a claim failure, not a panic.
    match coordinator.claim_specific_task("a1", "ghost") {
        Err(AquaError::ClaimFailed(id)) => assert_eq!(id, "ghost"),
        other => panic!("expected ClaimFailed, got {other:?}"),
    }
}
