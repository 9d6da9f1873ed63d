//! # Agent configuration.
//!
//! Provides [`AgentConfig`], the centralized settings for the agent runtime.
//!
//! Config is used in three places:
//! 1. **Lifecycle**: update endpoint, check interval, script cache location.
//! 2. **Generations**: event queue capacity, stop grace, process policy.
//! 3. **Capability modules**: default download and exec timeouts.
//!
//! ## Sentinel values
//! - `check_interval = 0s` → clamped to 1s
//! - `queue_capacity = 0` → clamped to 1
//! - `download_timeout = 0s` / `exec_timeout = 0s` → built-in defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default download timeout applied when a script passes a non-positive value.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for `agent.exec`.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(10);

/// What happens to child processes when their generation stops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProcessPolicy {
    /// Kill every running child (no process outlives its script).
    #[default]
    KillOnStop,
    /// Stop supervising children but leave them running.
    Detach,
}

/// Global configuration for the agent.
///
/// ## Field semantics
/// - `working_dir` / `script_file`: where the last good script is cached
/// - `server_url`: update endpoint queried on every tick
/// - `project`: project id to pick from a multi-project update response
/// - `check_interval`: time between update checks
/// - `queue_capacity`: bound of each generation's event queue
/// - `download_timeout`: default per-download deadline
/// - `exec_timeout`: default `agent.exec` deadline
/// - `http_timeout`: deadline for metadata and script fetches
/// - `stop_grace`: how long a stopping generation waits for cancelled tasks
/// - `process_policy`: kill or detach children on generation stop
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Directory holding the cached script.
    pub working_dir: PathBuf,

    /// File name of the cached script inside `working_dir`.
    pub script_file: String,

    /// Update endpoint (`GET` returning `{ "md5": .., "url": .. }`).
    pub server_url: String,

    /// Project id for the multi-project response variant.
    ///
    /// `None` picks the first entry of an array response.
    pub project: Option<String>,

    /// Interval between update checks.
    pub check_interval: Duration,

    /// Capacity of each generation's event queue.
    pub queue_capacity: usize,

    /// Download deadline used when the script passes `timeout <= 0`.
    pub download_timeout: Duration,

    /// Deadline for `agent.exec` when the script passes no timeout.
    pub exec_timeout: Duration,

    /// Deadline for update metadata and script fetches.
    pub http_timeout: Duration,

    /// Maximum time `Generation::stop` waits for cancelled tasks before aborting them.
    pub stop_grace: Duration,

    /// Lifetime of child processes relative to their generation.
    pub process_policy: ProcessPolicy,
}

impl AgentConfig {
    /// Returns the full path of the cached script.
    pub fn script_path(&self) -> PathBuf {
        self.working_dir.join(&self.script_file)
    }

    /// Returns the working directory.
    #[inline]
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Returns the update check interval clamped to a minimum of 1s.
    #[inline]
    pub fn check_interval_clamped(&self) -> Duration {
        self.check_interval.max(Duration::from_secs(1))
    }

    /// Returns a queue capacity clamped to a minimum of 1.
    #[inline]
    pub fn queue_capacity_clamped(&self) -> usize {
        self.queue_capacity.max(1)
    }

    /// Returns the download timeout, falling back to the built-in default for `0s`.
    #[inline]
    pub fn download_timeout(&self) -> Duration {
        if self.download_timeout.is_zero() {
            DEFAULT_DOWNLOAD_TIMEOUT
        } else {
            self.download_timeout
        }
    }

    /// Returns the exec timeout, falling back to the built-in default for `0s`.
    #[inline]
    pub fn exec_timeout(&self) -> Duration {
        if self.exec_timeout.is_zero() {
            DEFAULT_EXEC_TIMEOUT
        } else {
            self.exec_timeout
        }
    }
}

impl Default for AgentConfig {
    /// Default configuration:
    ///
    /// - `working_dir = "."`, `script_file = "script.lua"`
    /// - `check_interval = 60s`
    /// - `queue_capacity = 64`
    /// - `download_timeout = 30s`, `exec_timeout = 10s`, `http_timeout = 5s`
    /// - `stop_grace = 5s`
    /// - `process_policy = KillOnStop`
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            script_file: "script.lua".to_string(),
            server_url: String::new(),
            project: None,
            check_interval: Duration::from_secs(60),
            queue_capacity: 64,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            http_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(5),
            process_policy: ProcessPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_are_clamped() {
        let cfg = AgentConfig {
            check_interval: Duration::ZERO,
            queue_capacity: 0,
            download_timeout: Duration::ZERO,
            exec_timeout: Duration::ZERO,
            ..AgentConfig::default()
        };
        assert_eq!(cfg.check_interval_clamped(), Duration::from_secs(1));
        assert_eq!(cfg.queue_capacity_clamped(), 1);
        assert_eq!(cfg.download_timeout(), DEFAULT_DOWNLOAD_TIMEOUT);
        assert_eq!(cfg.exec_timeout(), DEFAULT_EXEC_TIMEOUT);
    }

    #[test]
    fn test_script_path_joins_working_dir() {
        let cfg = AgentConfig {
            working_dir: PathBuf::from("/var/lib/agent"),
            ..AgentConfig::default()
        };
        assert_eq!(cfg.script_path(), PathBuf::from("/var/lib/agent/script.lua"));
    }
}
