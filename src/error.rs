//! Error types used by the agent runtime and its capability modules.
//!
//! This module defines two main error enums:
//!
//! - [`AgentError`]: failures of the agent itself (update checks, script loading,
//!   callback invocation, local persistence). None of them is fatal: the agent keeps
//!   running the last good script.
//! - [`TaskStartError`]: a capability module refused to create a task. These are
//!   handed back to the calling script as an error string, never thrown.
//!
//! Both types provide `as_label` for logs.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// # Errors produced by the agent runtime.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum AgentError {
    /// The control server could not be reached (connect, timeout, body read).
    #[error("fetch {url} failed: {reason}")]
    Fetch {
        /// Requested location.
        url: String,
        /// Transport error message.
        reason: String,
    },

    /// The control server answered with a non-success status.
    #[error("fetch {url} returned status {status}: {body}")]
    Status {
        /// Requested location.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Response body (for diagnostics).
        body: String,
    },

    /// Update metadata could not be decoded.
    #[error("invalid update metadata: {reason}")]
    Decode {
        /// Decoder message.
        reason: String,
    },

    /// Downloaded script content does not hash to the advertised checksum.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Checksum advertised by the server.
        expected: String,
        /// Checksum of the bytes actually received.
        actual: String,
    },

    /// The script failed to parse or evaluate.
    #[error("script load failed: {reason}")]
    Load {
        /// Interpreter message.
        reason: String,
    },

    /// A script callback raised an error.
    #[error("callback `{callback}` failed: {reason}")]
    Callback {
        /// Name of the exported function.
        callback: String,
        /// Interpreter message.
        reason: String,
    },

    /// The cached script could not be read or written.
    #[error("script store {path:?}: {source}")]
    Store {
        /// Location of the cached script.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl AgentError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use scriptvisor::AgentError;
    ///
    /// let err = AgentError::ChecksumMismatch { expected: "a".into(), actual: "b".into() };
    /// assert_eq!(err.as_label(), "checksum_mismatch");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            AgentError::Fetch { .. } => "fetch_failed",
            AgentError::Status { .. } => "fetch_status",
            AgentError::Decode { .. } => "metadata_invalid",
            AgentError::ChecksumMismatch { .. } => "checksum_mismatch",
            AgentError::Load { .. } => "script_load_failed",
            AgentError::Callback { .. } => "callback_failed",
            AgentError::Store { .. } => "store_failed",
        }
    }

    /// Indicates whether the error comes from talking to the control server.
    ///
    /// Those are retried on the next update tick.
    pub fn is_fetch(&self) -> bool {
        matches!(
            self,
            AgentError::Fetch { .. } | AgentError::Status { .. } | AgentError::Decode { .. }
        )
    }
}

/// # Reasons a capability module refuses to create a task.
///
/// Returned synchronously to the calling script; no task exists afterwards.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskStartError {
    /// Tag or name was empty.
    #[error("{kind} name must not be empty")]
    EmptyName {
        /// Registry kind (`timer`, `download`, `process`).
        kind: &'static str,
    },

    /// A live task already uses this tag or name.
    #[error("{kind} `{name}` already exists")]
    AlreadyExists {
        /// Registry kind.
        kind: &'static str,
        /// Offending tag or name.
        name: String,
    },

    /// The callback is not a function exported by the current script.
    #[error("callback `{callback}` is not exported by the script")]
    UnknownCallback {
        /// Requested callback name.
        callback: String,
    },

    /// The running script did not return an exports table.
    #[error("script has no exports table")]
    NoExports,

    /// Timer interval was zero, negative or not finite.
    #[error("invalid timer interval {interval}")]
    InvalidInterval {
        /// Interval in seconds as passed by the script.
        interval: f64,
    },

    /// Command line had no executable.
    #[error("invalid command `{command}`")]
    InvalidCommand {
        /// Command line as passed by the script.
        command: String,
    },

    /// Process environment was neither a `K=V` string nor a table of strings.
    #[error("invalid process env: {reason}")]
    InvalidEnv {
        /// Why the environment was refused.
        reason: String,
    },

    /// The operating system refused to launch the process.
    #[error("failed to start `{command}`: {reason}")]
    Spawn {
        /// Command line as passed by the script.
        command: String,
        /// OS error message.
        reason: String,
    },
}

impl TaskStartError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskStartError::EmptyName { .. } => "task_name_empty",
            TaskStartError::AlreadyExists { .. } => "task_already_exists",
            TaskStartError::UnknownCallback { .. } => "task_unknown_callback",
            TaskStartError::NoExports => "task_no_exports",
            TaskStartError::InvalidInterval { .. } => "task_invalid_interval",
            TaskStartError::InvalidCommand { .. } => "task_invalid_command",
            TaskStartError::InvalidEnv { .. } => "task_invalid_env",
            TaskStartError::Spawn { .. } => "task_spawn_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_errors_are_retryable_class() {
        let err = AgentError::Status {
            url: "http://x".into(),
            status: 503,
            body: String::new(),
        };
        assert!(err.is_fetch());
        assert_eq!(err.as_label(), "fetch_status");

        let err = AgentError::Load { reason: "syntax".into() };
        assert!(!err.is_fetch());
    }

    #[test]
    fn test_invalid_interval_compares_by_value() {
        let err = TaskStartError::InvalidInterval { interval: -1.5 };
        assert_eq!(err.clone(), TaskStartError::InvalidInterval { interval: -1.5 });
        assert_ne!(err, TaskStartError::InvalidInterval { interval: 2.0 });
        assert_eq!(err.to_string(), "invalid timer interval -1.5");
        assert_eq!(err.as_label(), "task_invalid_interval");
    }

    #[test]
    fn test_task_start_error_message() {
        let err = TaskStartError::AlreadyExists {
            kind: "timer",
            name: "t1".into(),
        };
        assert_eq!(err.to_string(), "timer `t1` already exists");
        assert_eq!(err.as_label(), "task_already_exists");
    }
}
