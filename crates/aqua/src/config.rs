//! Configuration loading for `.aqua/config.toml`.
//!
//! Every knob is optional; missing sections or a missing file fall back to
//! the documented defaults, so a bare `aqua init` works with no config at
//! all.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration loaded from `.aqua/config.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AquaConfig {
    /// Coordination timing knobs (optional).
    pub coordination: Option<CoordinationConfig>,
    /// Task queue defaults (optional).
    pub tasks: Option<TasksConfig>,
    /// Store tuning (optional).
    pub store: Option<StoreConfig>,
}

/// Timing knobs for liveness, claims, and leadership.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoordinationConfig {
    /// Heartbeat age after which an agent is a death candidate (default: 300).
    pub dead_threshold_secs: Option<u64>,
    /// Claim age after which a task is considered stuck (default: 1800).
    pub claim_timeout_secs: Option<u64>,
    /// Leader lease duration in seconds (default: 30).
    pub lease_secs: Option<u64>,
}

impl CoordinationConfig {
    pub fn dead_threshold_secs(&self) -> u64 {
        self.dead_threshold_secs.unwrap_or(300)
    }

    pub fn claim_timeout_secs(&self) -> u64 {
        self.claim_timeout_secs.unwrap_or(1800)
    }

    pub fn lease_secs(&self) -> u64 {
        self.lease_secs.unwrap_or(30)
    }
}

/// Defaults applied to new tasks.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TasksConfig {
    /// Re-queue budget for abandoned tasks (default: 3).
    pub max_retries: Option<i64>,
}

impl TasksConfig {
    pub fn max_retries(&self) -> i64 {
        self.max_retries.unwrap_or(3)
    }
}

/// Store tuning.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// SQLite busy timeout in milliseconds (default: 5000).
    pub busy_timeout_ms: Option<u64>,
}

impl StoreConfig {
    pub fn busy_timeout_ms(&self) -> u64 {
        self.busy_timeout_ms.unwrap_or(5000)
    }
}

impl AquaConfig {
    /// Load configuration from `<aqua_dir>/config.toml`.
    ///
    /// A missing file yields the defaults; a malformed file is an error.
    pub fn load(aqua_dir: &Path) -> Result<Self> {
        let path = aqua_dir.join("config.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn coordination(&self) -> CoordinationConfig {
        self.coordination.clone().unwrap_or_default()
    }

    pub fn tasks(&self) -> TasksConfig {
        self.tasks.clone().unwrap_or_default()
    }

    pub fn store(&self) -> StoreConfig {
        self.store.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let temp = tempfile::tempdir().unwrap();
        let config = AquaConfig::load(temp.path()).unwrap();
        assert_eq!(config.coordination().dead_threshold_secs(), 300);
        assert_eq!(config.coordination().claim_timeout_secs(), 1800);
        assert_eq!(config.coordination().lease_secs(), 30);
        assert_eq!(config.tasks().max_retries(), 3);
        assert_eq!(config.store().busy_timeout_ms(), 5000);
    }

    #[test]
    fn test_partial_file_overrides() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(
            temp.path().join("config.toml"),
            r#"
[coordination]
dead_threshold_secs = 60
lease_secs = 5

[store]
busy_timeout_ms = 250
"#,
        )
        .unwrap();

        let config = AquaConfig::load(temp.path()).unwrap();
        assert_eq!(config.coordination().dead_threshold_secs(), 60);
        assert_eq!(config.coordination().lease_secs(), 5);
        // Untouched knobs keep their defaults.
        assert_eq!(config.coordination().claim_timeout_secs(), 1800);
        assert_eq!(config.tasks().max_retries(), 3);
        assert_eq!(config.store().busy_timeout_ms(), 250);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("config.toml"), "not [valid toml").unwrap();
        assert!(AquaConfig::load(temp.path()).is_err());
    }
}
