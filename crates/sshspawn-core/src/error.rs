use std::path::PathBuf;
use std::time::Duration;

use crate::models::ServerStatus;

/// Which remote operation a timeout interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Connect,
    Exec,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutPhase::Connect => f.write_str("connect"),
            TimeoutPhase::Exec => f.write_str("exec"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnerError {
    #[error("authentication to '{host}' failed: {message}")]
    Auth { host: String, message: String },

    #[error("host '{host}' is unreachable: {message}")]
    Unreachable { host: String, message: String },

    #[error("{phase} timed out on '{host}' after {elapsed:?}")]
    Timeout {
        host: String,
        phase: TimeoutPhase,
        elapsed: Duration,
    },

    #[error("remote command failed on '{host}' (exit {exit_code}): {stderr}")]
    RemoteExec {
        host: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("malformed discovery output {output:?}: {reason}")]
    MalformedDiscoveryOutput { output: String, reason: String },

    #[error("discovery command exited {exit_code} on '{host}': {stderr}")]
    DiscoveryTimeout {
        host: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("no endpoint discovered for pid {pid} on '{host}' after {attempts} attempts")]
    Discovery {
        host: String,
        pid: u32,
        attempts: u32,
    },

    #[error("launch failed on '{host}': {message}")]
    Launch { host: String, message: String },

    #[error("pid {pid} on '{host}' still alive after {waited:?}")]
    TerminationTimeout {
        host: String,
        pid: u32,
        waited: Duration,
    },

    #[error("no hosts available for selection")]
    NoHostsAvailable,

    #[error("session to '{host}' failed: {message}")]
    Session { host: String, message: String },

    #[error("config file not found at {0}")]
    ConfigNotFound(PathBuf),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("illegal server status transition {from:?} -> {to:?}")]
    InvalidTransition { from: ServerStatus, to: ServerStatus },

    #[error("stored state is invalid: {0}")]
    State(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl SpawnerError {
    /// True when the failure says nothing about the request itself, only about
    /// the host it was sent to, so another pool member may succeed.
    pub fn is_retryable_on_other_host(&self) -> bool {
        matches!(
            self,
            SpawnerError::Unreachable { .. }
                | SpawnerError::Timeout {
                    phase: TimeoutPhase::Connect,
                    ..
                }
        )
    }
}

pub type Result<T> = std::result::Result<T, SpawnerError>;
