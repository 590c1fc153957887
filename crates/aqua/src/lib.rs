//! Aqua coordination library.
//!
//! A local, decentralized coordinator that lets independently-running CLI AI
//! agents share a single codebase: a durable SQLite store serializes the
//! work queue, a lease-based election picks one leader per term, and an
//! opportunistic recovery sweep re-queues work orphaned by crashed agents.
//!
//! The library exposes the coordination kernel; the `aqua` binary is a thin
//! rendering layer over [`commands::CommandExecutor`].

pub mod cli;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod errors;
pub mod identity;
pub mod output;
pub mod storage;

// Re-export commonly used types
pub use commands::CommandExecutor;
pub use config::AquaConfig;
pub use coordinator::{Coordinator, RecoverySummary};
pub use domain::{
    Agent, AgentKind, AgentStatus, Event, FileLock, Leader, Message, Task, TaskStatus,
};
pub use errors::AquaError;
pub use storage::Store;
