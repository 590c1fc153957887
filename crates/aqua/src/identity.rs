//! Agent identity: id and name generation, per-session identity resolution,
//! and the zero-signal process liveness probe.
//!
//! The core never decides who is calling; it accepts a resolved agent id.
//! Resolution order for the CLI wrapper:
//!
//! 1. `AQUA_AGENT_ID` environment variable
//! 2. `AQUA_SESSION_ID` environment variable, mapped to a session file
//! 3. TTY device name of stdin, mapped to a session file
//! 4. the literal `"default"`
//!
//! Session files live in `.aqua/sessions/<session>.agent` and hold a single
//! agent id, so each terminal keeps its identity across invocations.

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use std::env;
use std::fs;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Environment variable that pins the agent id directly.
pub const AGENT_ID_VAR: &str = "AQUA_AGENT_ID";
/// Environment variable that names the session (maps to a session file).
pub const SESSION_ID_VAR: &str = "AQUA_SESSION_ID";
/// Fallback identity when nothing else resolves.
pub const DEFAULT_AGENT_ID: &str = "default";

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "dark", "eager", "fair", "gentle", "happy", "idle", "jolly", "keen", "lively",
    "merry", "noble", "odd", "proud", "quick", "rapid", "silent", "tall", "unique", "vivid", "warm",
    "young", "zesty", "amber", "blue", "coral", "dusty", "emerald", "frosty", "golden", "hazy",
];

const NOUNS: &[&str] = &[
    "falcon", "tiger", "eagle", "wolf", "bear", "lion", "hawk", "fox", "otter", "raven", "shark",
    "whale", "cobra", "crane", "drake", "elk", "finch", "gecko", "heron", "ibis", "jay", "koala",
    "lemur", "moose", "newt", "owl", "panda", "quail", "robin", "swan", "trout", "viper",
];

/// Generate a short opaque id (8 hex characters).
pub fn generate_short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Generate a memorable agent name like `brave-falcon`.
pub fn generate_agent_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).expect("non-empty list");
    let noun = NOUNS.choose(&mut rng).expect("non-empty list");
    format!("{adjective}-{noun}")
}

/// Check whether a process exists without disturbing it (zero-signal probe).
///
/// `EPERM` means the process exists but belongs to another user, which still
/// counts as alive.
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// The current process id.
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Name of the current session, if one can be determined.
///
/// Prefers `AQUA_SESSION_ID`; otherwise derives a name from the controlling
/// TTY of stdin (`/dev/pts/3` becomes `dev-pts-3`). Returns `None` when
/// stdin is not a terminal, e.g. in pipelines or CI.
pub fn session_name() -> Option<String> {
    if let Ok(session) = env::var(SESSION_ID_VAR) {
        if !session.is_empty() {
            return Some(sanitize_session(&session));
        }
    }

    let stdin = std::io::stdin();
    match nix::unistd::ttyname(stdin.as_fd()) {
        Ok(tty) => Some(sanitize_session(&tty.to_string_lossy())),
        Err(_) => None,
    }
}

/// Sanitize a session name for use as a filename.
fn sanitize_session(raw: &str) -> String {
    raw.trim_start_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
            c
        } else {
            '-'
        })
        .collect()
}

/// Path of the session identity file for a session name.
pub fn session_file(aqua_dir: &Path, session: &str) -> PathBuf {
    aqua_dir.join("sessions").join(format!("{session}.agent"))
}

/// Resolve the calling agent's id.
///
/// Never fails: falls back to [`DEFAULT_AGENT_ID`] when nothing resolves.
/// Whether the resolved id names a registered agent is checked by the caller.
pub fn resolve_agent_id(aqua_dir: &Path) -> String {
    if let Ok(id) = env::var(AGENT_ID_VAR) {
        if !id.is_empty() {
            return id;
        }
    }

    if let Some(session) = session_name() {
        let path = session_file(aqua_dir, &session);
        if let Ok(contents) = fs::read_to_string(&path) {
            let id = contents.trim();
            if !id.is_empty() {
                return id.to_string();
            }
        }
    }

    DEFAULT_AGENT_ID.to_string()
}

/// Record the agent id for the current session, if a session is identifiable.
///
/// # Errors
///
/// Returns an error if the sessions directory or file cannot be written.
pub fn store_session_identity(aqua_dir: &Path, agent_id: &str) -> Result<Option<PathBuf>> {
    let Some(session) = session_name() else {
        return Ok(None);
    };
    let path = session_file(aqua_dir, &session);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&path, agent_id)
        .with_context(|| format!("failed to write session file {}", path.display()))?;
    Ok(Some(path))
}

/// Remove the session identity file for the current session, if any.
pub fn clear_session_identity(aqua_dir: &Path) -> Result<()> {
    if let Some(session) = session_name() {
        let path = session_file(aqua_dir, &session);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove session file {}", path.display()))?;
        }
    }
    Ok(())
}
