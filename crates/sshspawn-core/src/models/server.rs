use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SpawnerError};

/// Address a spawned server reported through the discovery helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ServerStatus {
    Launching,
    Discovering,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ServerStatus {
    pub fn can_advance_to(self, next: ServerStatus) -> bool {
        use ServerStatus::*;
        matches!(
            (self, next),
            (Launching, Discovering)
                | (Launching, Failed)
                | (Discovering, Running)
                | (Discovering, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopping)
                | (Stopping, Stopped)
                | (Failed, Stopping)
        )
    }

    pub fn advance(self, next: ServerStatus) -> Result<ServerStatus> {
        if self.can_advance_to(next) {
            Ok(next)
        } else {
            Err(SpawnerError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

/// Outcome of a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
}

/// Signals the termination path knows how to send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    #[default]
    Terminate,
    Kill,
}

impl Signal {
    /// Name accepted by `kill -s`.
    pub fn name(self) -> &'static str {
        match self {
            Signal::Interrupt => "INT",
            Signal::Terminate => "TERM",
            Signal::Kill => "KILL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim_start_matches("SIG").to_ascii_uppercase().as_str() {
            "INT" | "2" => Some(Signal::Interrupt),
            "TERM" | "15" => Some(Signal::Terminate),
            "KILL" | "9" => Some(Signal::Kill),
            _ => None,
        }
    }
}

/// Everything needed to find a spawned server again on a later call.
///
/// The orchestrator stores this opaquely (see [`SpawnedServerRecord::to_state`]).
/// A record without an endpoint belongs to a server that is still starting and
/// must not be reported as ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnedServerRecord {
    pub hostname: String,
    pub username: String,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    pub status: ServerStatus,
    pub started_at: DateTime<Utc>,
}

impl SpawnedServerRecord {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>, pid: u32) -> Self {
        Self {
            hostname: hostname.into(),
            username: username.into(),
            pid,
            endpoint: None,
            status: ServerStatus::Launching,
            started_at: Utc::now(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == ServerStatus::Running && self.endpoint.is_some()
    }

    /// `(ip, port)` once discovery has succeeded.
    pub fn address(&self) -> Option<(&str, u16)> {
        self.endpoint.as_ref().map(|e| (e.ip.as_str(), e.port))
    }

    pub fn advance(&mut self, next: ServerStatus) -> Result<()> {
        self.status = self.status.advance(next)?;
        Ok(())
    }

    pub fn to_state(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_state(state: &str) -> Result<Self> {
        let record: SpawnedServerRecord = serde_json::from_str(state)?;
        if record.hostname.is_empty() {
            return Err(SpawnerError::State("hostname is empty".into()));
        }
        if record.username.is_empty() {
            return Err(SpawnerError::State("username is empty".into()));
        }
        if record.pid == 0 {
            return Err(SpawnerError::State("pid must be non-zero".into()));
        }
        Ok(record)
    }
}
