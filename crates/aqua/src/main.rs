//! Aqua — decentralized coordinator for CLI AI agents sharing a codebase.
//!
//! Every invocation opens the store, does a bounded amount of work under
//! short transactions, and exits. There is no daemon unless `aqua daemon`
//! is asked for explicitly.

use anyhow::Result;
use clap::Parser;
use rand::Rng;
use tracing_subscriber::EnvFilter;

use aqua::cli::{Cli, Commands};
use aqua::commands::CommandExecutor;
use aqua::domain::{AgentKind, TaskStatus};
use aqua::errors::AquaError;
use aqua::output::{format_age, ExitCode, JsonErrorBody, OutputContext};

fn main() {
    let cli = Cli::parse();
    init_tracing();

    let out = OutputContext::new(cli.quiet, cli.json);
    let exit_code = match run(&cli, &out) {
        Ok(()) => ExitCode::Success,
        Err(err) => {
            let (kind, code) = classify_error(&err);
            if out.is_json() {
                JsonErrorBody::new(kind, err.to_string()).print();
            } else {
                eprintln!("Error: {err}");
            }
            code
        }
    };

    if exit_code != ExitCode::Success {
        std::process::exit(exit_code.code());
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("AQUA_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Map an error to its JSON kind and exit code.
fn classify_error(err: &anyhow::Error) -> (&'static str, ExitCode) {
    match err.downcast_ref::<AquaError>() {
        Some(aqua_err) if aqua_err.is_user_error() => (aqua_err.kind(), ExitCode::UserError),
        Some(aqua_err) => (aqua_err.kind(), ExitCode::InternalError),
        None => ("internal", ExitCode::InternalError),
    }
}

fn run(cli: &Cli, out: &OutputContext) -> Result<()> {
    let cwd = std::env::current_dir()?;

    if let Commands::Init = cli.command {
        let executor = CommandExecutor::init(&cwd)?;
        out.print_data(format!(
            "Initialized aqua store in {}",
            executor.aqua_dir().display()
        ));
        out.print_json("init", &serde_json::json!({ "dir": executor.aqua_dir() }));
        return Ok(());
    }

    let root = CommandExecutor::locate_root(&cwd)?;
    let executor = CommandExecutor::open(&root)?;

    match &cli.command {
        Commands::Init => unreachable!("handled above"),

        Commands::Join {
            name,
            kind,
            role,
            capabilities,
        } => {
            let kind = AgentKind::parse(kind)
                .map_err(|_| anyhow::anyhow!("invalid agent kind '{kind}'"))?;
            let agent = executor.join(name.clone(), kind, role.clone(), capabilities.clone())?;
            out.print_data(format!("Joined as {} ({})", agent.name, agent.id));
            out.print_info(format!(
                "Pin this identity with: export AQUA_AGENT_ID={}",
                agent.id
            ));
            out.print_json("join", &agent);
        }

        Commands::Leave { force } => {
            let agent = executor.leave(*force)?;
            out.print_data(format!("Left the quorum: {} ({})", agent.name, agent.id));
            out.print_json("leave", &agent);
        }

        Commands::Agents => {
            let agents = executor.list_agents()?;
            if agents.is_empty() {
                out.print_data("No agents registered");
            }
            for agent in &agents {
                let task = agent
                    .current_task_id
                    .as_deref()
                    .map(|id| format!("  task={id}"))
                    .unwrap_or_default();
                out.print_data(format!(
                    "{:<20} {:<10} {:<8} heartbeat {}{}",
                    agent.name,
                    agent.id,
                    agent.status.as_str(),
                    format_age(agent.last_heartbeat_at),
                    task,
                ));
            }
            out.print_json("agents", &agents);
        }

        Commands::Add {
            title,
            desc,
            priority,
            tags,
            depends_on,
            max_retries,
        } => {
            if !(1..=10).contains(priority) {
                anyhow::bail!("priority must be between 1 and 10");
            }
            let task = executor.add_task(
                title.clone(),
                desc.clone(),
                *priority,
                tags.clone(),
                depends_on.clone(),
                *max_retries,
            )?;
            out.print_data(format!("Added task {} (priority {})", task.id, task.priority));
            out.print_json("add", &task);
        }

        Commands::Tasks { status, tag, mine } => {
            let status = status
                .as_deref()
                .map(TaskStatus::parse)
                .transpose()
                .map_err(|_| anyhow::anyhow!("invalid task status '{}'", status.clone().unwrap_or_default()))?;
            let tasks = executor.list_tasks(status, tag.clone(), *mine)?;
            if tasks.is_empty() {
                out.print_data("No tasks");
            }
            for task in &tasks {
                let owner = task
                    .claimed_by
                    .as_deref()
                    .map(|id| format!("  by {id}"))
                    .unwrap_or_default();
                out.print_data(format!(
                    "{}  p{} {:<10} {}{}",
                    task.id,
                    task.priority,
                    task.status.as_str(),
                    task.title,
                    owner,
                ));
            }
            out.print_json("tasks", &tasks);
        }

        Commands::Task { id } => {
            let task = executor.get_task(id)?;
            out.print_data(format!("{}: {}", task.id, task.title));
            out.print_data(format!("  status: {}", task.status.as_str()));
            out.print_data(format!("  priority: {}", task.priority));
            if let Some(desc) = &task.description {
                out.print_data(format!("  description: {desc}"));
            }
            if let Some(claimed_by) = &task.claimed_by {
                out.print_data(format!("  claimed by: {claimed_by}"));
            }
            if !task.depends_on.is_empty() {
                out.print_data(format!("  depends on: {}", task.depends_on.join(", ")));
            }
            if let Some(context) = &task.context {
                out.print_data(format!("  context: {context}"));
            }
            out.print_json("task", &task);
        }

        Commands::Claim { id } => {
            let outcome = executor.claim(id.as_deref())?;
            match &outcome.task {
                Some(task) => {
                    out.print_data(format!("Claimed {}: {}", task.id, task.title));
                    if !outcome.role_match {
                        out.print_warning("task does not match your role");
                    }
                }
                None => out.print_data("No tasks available"),
            }
            out.print_json("claim", &outcome);
        }

        Commands::Done { summary, task } => {
            let task = executor.done(task.as_deref(), summary.as_deref())?;
            out.print_data(format!("Task {} done", task.id));
            out.print_json("done", &task);
        }

        Commands::Fail { error, task } => {
            let task = executor.fail(task.as_deref(), error)?;
            out.print_data(format!(
                "Task {} failed (retry {}/{})",
                task.id, task.retry_count, task.max_retries
            ));
            out.print_json("fail", &task);
        }

        Commands::Progress { note } => {
            let task = executor.progress(note)?;
            out.print_data(format!("Progress recorded on {}", task.id));
            out.print_json("progress", &task);
        }

        Commands::Msg { content, to } => {
            let message = executor.send_message(to.as_deref(), content)?;
            match &message.to_agent {
                Some(recipient) => out.print_data(format!("Sent to {recipient}")),
                None => out.print_data("Broadcast sent"),
            }
            out.print_json("msg", &message);
        }

        Commands::Inbox { all, limit } => {
            let messages = executor.inbox(*all, *limit)?;
            if messages.is_empty() {
                out.print_data("Inbox empty");
            }
            for message in &messages {
                let scope = if message.to_agent.is_none() {
                    " [broadcast]"
                } else {
                    ""
                };
                out.print_data(format!(
                    "{} from {}{}: {}",
                    format_age(message.created_at),
                    message.from_agent,
                    scope,
                    message.content,
                ));
            }
            out.print_json("inbox", &messages);
        }

        Commands::Leader => {
            let leader = executor.leader()?;
            match &leader {
                Some(leader) => {
                    let state = if leader.is_expired() { "expired" } else { "active" };
                    out.print_data(format!(
                        "Leader {} term={} lease {} ({})",
                        leader.agent_id,
                        leader.term,
                        leader.lease_expires_at.format("%H:%M:%S"),
                        state,
                    ));
                }
                None => out.print_data("No leader elected"),
            }
            out.print_json("leader", &leader);
        }

        Commands::Elect { lease } => {
            let leader = executor.elect(*lease)?;
            out.print_data(format!("Leading with term {}", leader.term));
            out.print_json("elect", &leader);
        }

        Commands::Doctor => {
            let report = executor.doctor()?;
            if report.stale_agents.is_empty()
                && report.stale_claims.is_empty()
                && report.exhausted_tasks.is_empty()
            {
                out.print_data("Store healthy");
            }
            for agent in &report.stale_agents {
                let pid = if agent.pid_alive { "pid alive" } else { "pid gone" };
                out.print_data(format!(
                    "stale agent {} ({}) heartbeat {}s ago, {}",
                    agent.name, agent.id, agent.heartbeat_age_secs, pid,
                ));
            }
            for claim in &report.stale_claims {
                out.print_data(format!(
                    "stale claim on {} held {}s by {}",
                    claim.task_id,
                    claim.claim_age_secs,
                    claim.claimed_by.as_deref().unwrap_or("?"),
                ));
            }
            for task_id in &report.exhausted_tasks {
                out.print_data(format!("task {task_id} exhausted its retries"));
            }
            out.print_json("doctor", &report);
        }

        Commands::Recover => {
            let summary = executor.recover()?;
            out.print_data(format!(
                "Recovered: {} dead agents, {} stale claims, {} tasks re-queued",
                summary.dead_agents.len(),
                summary.stale_tasks,
                summary.requeued_tasks,
            ));
            out.print_json("recover", &summary);
        }

        Commands::Daemon { interval } => {
            out.print_info(format!("Recovery daemon: sweep every ~{interval}s"));
            run_daemon(&root, *interval, out)?;
        }

        Commands::Events {
            event_type,
            agent,
            task,
            limit,
        } => {
            let events = executor.list_events(
                event_type.as_deref(),
                agent.as_deref(),
                task.as_deref(),
                *limit,
            )?;
            for event in &events {
                let subject = event
                    .agent_id
                    .as_deref()
                    .or(event.task_id.as_deref())
                    .unwrap_or("-");
                out.print_data(format!(
                    "{}  {:<18} {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.event_type,
                    subject,
                ));
            }
            out.print_json("events", &events);
        }

        Commands::Lock { path } => {
            let lock = executor.lock(path)?;
            out.print_data(format!("Locked {path}"));
            out.print_json("lock", &lock);
        }

        Commands::Unlock { path } => {
            executor.unlock(path)?;
            out.print_data(format!("Unlocked {path}"));
            out.print_json("unlock", &serde_json::json!({ "file_path": path }));
        }

        Commands::Locks => {
            let locks = executor.list_locks()?;
            if locks.is_empty() {
                out.print_data("No file locks");
            }
            for lock in &locks {
                out.print_data(format!(
                    "{}  held by {} since {}",
                    lock.file_path,
                    lock.agent_id,
                    format_age(lock.locked_at),
                ));
            }
            out.print_json("locks", &locks);
        }

        Commands::Status => {
            let status = executor.status()?;
            out.print_data(format!(
                "Agents: {} ({} active)",
                status.agents_total, status.agents_active
            ));
            let tasks = status
                .tasks
                .iter()
                .map(|(name, count)| format!("{name}={count}"))
                .collect::<Vec<_>>()
                .join(" ");
            out.print_data(format!("Tasks: {tasks}"));
            match &status.leader {
                Some(leader) => out.print_data(format!(
                    "Leader: {} term={}",
                    leader.agent_id, leader.term
                )),
                None => out.print_data("Leader: none"),
            }
            out.print_json("status", &status);
        }
    }

    Ok(())
}

/// Loop recovery sweeps until killed. Stateless between iterations: each
/// sweep opens a fresh executor, so a restarted daemon resumes identically.
fn run_daemon(root: &std::path::Path, interval_secs: u64, out: &OutputContext) -> Result<()> {
    loop {
        let executor = CommandExecutor::open(root)?;
        match executor.recover() {
            Ok(summary) => {
                if !summary.dead_agents.is_empty()
                    || summary.stale_tasks > 0
                    || summary.requeued_tasks > 0
                {
                    out.print_info(format!(
                        "sweep: {} dead agents, {} stale claims, {} re-queued",
                        summary.dead_agents.len(),
                        summary.stale_tasks,
                        summary.requeued_tasks,
                    ));
                }
            }
            Err(err) => out.print_warning(format!("sweep failed: {err}")),
        }
        drop(executor);

        // Jitter so many daemons on one store do not sweep in lockstep.
        let jitter = rand::thread_rng().gen_range(0..=interval_secs.max(1) / 4 + 1);
        std::thread::sleep(std::time::Duration::from_secs(interval_secs + jitter));
    }
}
