//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "aqua")]
#[command(about = "Decentralized coordinator for CLI AI agents sharing a codebase", long_about = None)]
pub struct Cli {
    /// Suppress informational output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit machine-readable JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the coordination store in the current directory
    Init,

    /// Join the quorum as a new agent
    Join {
        /// Agent name (generated when omitted, e.g. brave-falcon)
        #[arg(short, long)]
        name: Option<String>,

        /// Agent kind: claude, codex, gemini, or generic
        #[arg(short, long, default_value = "generic")]
        kind: String,

        /// Advisory role tag used for task selection preference
        #[arg(short, long)]
        role: Option<String>,

        /// Capability tags (repeatable)
        #[arg(short, long = "capability")]
        capabilities: Vec<String>,
    },

    /// Leave the quorum
    Leave {
        /// Abandon a held task instead of refusing to leave
        #[arg(long)]
        force: bool,
    },

    /// List registered agents
    Agents,

    /// Add a task to the queue
    Add {
        /// Short task title
        title: String,

        #[arg(short, long)]
        desc: Option<String>,

        /// 1 (lowest) to 10 (highest)
        #[arg(short, long, default_value_t = 5)]
        priority: i64,

        /// Tags (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Task ids that must be done first (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,

        /// Re-queue budget before the task needs human attention
        #[arg(long)]
        max_retries: Option<i64>,
    },

    /// List tasks
    Tasks {
        /// Filter by status: pending, claimed, done, failed, abandoned
        #[arg(short, long)]
        status: Option<String>,

        /// Filter by tag
        #[arg(short, long)]
        tag: Option<String>,

        /// Only tasks claimed by me
        #[arg(long)]
        mine: bool,
    },

    /// Show one task
    Task { id: String },

    /// Claim a task (the next available one, or a specific id)
    Claim {
        /// Task id; omit to take the next available task
        id: Option<String>,
    },

    /// Complete the current task
    Done {
        /// Result summary stored on the task
        #[arg(short, long)]
        summary: Option<String>,

        /// Complete a specific task instead of the current one
        #[arg(long)]
        task: Option<String>,
    },

    /// Fail the current task
    Fail {
        /// What went wrong
        #[arg(short, long, default_value = "task failed")]
        error: String,

        /// Fail a specific task instead of the current one
        #[arg(long)]
        task: Option<String>,
    },

    /// Checkpoint progress on the current task
    Progress {
        /// Free-form progress note
        note: String,
    },

    /// Send a message to one agent or everyone
    Msg {
        content: String,

        /// Recipient agent name or id; omit to broadcast
        #[arg(short, long)]
        to: Option<String>,
    },

    /// Fetch messages (marks them read)
    Inbox {
        /// Include already-read messages
        #[arg(long)]
        all: bool,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Show the current leader
    Leader,

    /// Try to become (or remain) leader
    Elect {
        /// Lease duration in seconds
        #[arg(long)]
        lease: Option<u64>,
    },

    /// Diagnose store health without changing anything
    Doctor,

    /// Run a recovery sweep: dead agents, stale claims, re-queue
    Recover,

    /// Loop recovery sweeps with a jittered sleep
    Daemon {
        /// Base interval between sweeps in seconds
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },

    /// Read the event log
    Events {
        #[arg(short = 't', long)]
        event_type: Option<String>,

        #[arg(short, long)]
        agent: Option<String>,

        #[arg(long)]
        task: Option<String>,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Take an advisory lock on a file path
    Lock { path: String },

    /// Release an advisory lock
    Unlock { path: String },

    /// List advisory file locks
    Locks,

    /// Show an overall status summary
    Status,
}
