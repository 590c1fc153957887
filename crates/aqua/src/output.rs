//! Structured output for CLI commands.
//!
//! Human output goes through [`OutputContext`] so `--quiet` and `--json`
//! behave consistently. JSON mode wraps successful results in a
//! `{success, data, metadata}` envelope; errors are a flat
//! `{"error": "<kind>", "message": "..."}` object so callers can switch on
//! the kind without digging.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Display;
use std::io::{self, Write};

/// Process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    /// The caller did something wrong: not initialized, not joined, name
    /// conflict, no current task, claim failure, and friends.
    UserError,
    /// Store or internal failure.
    InternalError,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::UserError => 1,
            Self::InternalError => 2,
        }
    }
}

/// Controls output verbosity and format for one invocation.
pub struct OutputContext {
    quiet: bool,
    json: bool,
}

impl OutputContext {
    pub fn new(quiet: bool, json: bool) -> Self {
        Self { quiet, json }
    }

    /// Essential output (suppressed only by `--json`).
    pub fn print_data(&self, msg: impl Display) {
        if !self.json {
            writeln_safe(&msg.to_string());
        }
    }

    /// Informational output (suppressed by `--quiet` or `--json`).
    pub fn print_info(&self, msg: impl Display) {
        if !self.quiet && !self.json {
            writeln_safe(&msg.to_string());
        }
    }

    /// Warning to stderr (suppressed by `--quiet` or `--json`).
    pub fn print_warning(&self, msg: impl Display) {
        if !self.quiet && !self.json {
            writeln_safe_stderr(&format!("Warning: {msg}"));
        }
    }

    /// Emit a success envelope in JSON mode; no-op otherwise.
    pub fn print_json<T: Serialize>(&self, command: &str, data: &T) {
        if self.json {
            let envelope = JsonOutput::success(data, command);
            match serde_json::to_string_pretty(&envelope) {
                Ok(json) => writeln_safe(&json),
                Err(err) => writeln_safe_stderr(&format!("Error: cannot serialize output: {err}")),
            }
        }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

/// Success envelope for `--json` mode.
#[derive(Debug, Serialize)]
pub struct JsonOutput<'a, T: Serialize> {
    pub success: bool,
    pub data: &'a T,
    pub metadata: Metadata,
}

impl<'a, T: Serialize> JsonOutput<'a, T> {
    pub fn success(data: &'a T, command: &str) -> Self {
        Self {
            success: true,
            data,
            metadata: Metadata::new(command),
        }
    }
}

/// Envelope metadata.
#[derive(Debug, Serialize)]
pub struct Metadata {
    pub command: String,
    pub timestamp: DateTime<Utc>,
}

impl Metadata {
    fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Flat error object for `--json` mode.
#[derive(Debug, Serialize)]
pub struct JsonErrorBody {
    pub error: String,
    pub message: String,
}

impl JsonErrorBody {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            error: kind.to_string(),
            message: message.into(),
        }
    }

    pub fn print(&self) {
        match serde_json::to_string_pretty(self) {
            Ok(json) => writeln_safe(&json),
            Err(_) => writeln_safe(&format!("{{\"error\": \"{}\"}}", self.error)),
        }
    }
}

/// Render a timestamp as a short "how long ago" string.
pub fn format_age(ts: DateTime<Utc>) -> String {
    let seconds = (Utc::now() - ts).num_seconds();
    if seconds < 0 {
        "in the future".to_string()
    } else if seconds < 60 {
        format!("{seconds}s ago")
    } else if seconds < 3600 {
        format!("{}m ago", seconds / 60)
    } else if seconds < 86400 {
        format!("{}h ago", seconds / 3600)
    } else {
        format!("{}d ago", seconds / 86400)
    }
}

/// Println that tolerates broken pipes (piping into `head` and the like).
fn writeln_safe(msg: &str) {
    if let Err(e) = writeln!(io::stdout(), "{msg}") {
        if e.kind() == io::ErrorKind::BrokenPipe {
            std::process::exit(0);
        }
    }
}

fn writeln_safe_stderr(msg: &str) {
    if let Err(e) = writeln!(io::stderr(), "{msg}") {
        if e.kind() == io::ErrorKind::BrokenPipe {
            std::process::exit(0);
        }
    }
}
