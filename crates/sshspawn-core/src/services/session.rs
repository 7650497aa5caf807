//! Transport seam between the spawner and a remote host.
//!
//! Production code uses [`super::ssh::OpenSshConnector`]; tests plug in a
//! scripted connector that never touches the network.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// Key-based login for one remote user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub keyfile: PathBuf,
    pub port: u16,
}

/// Result of a remote command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Opens authenticated sessions to hosts.
pub trait SessionConnector: Send + Sync {
    type Session: RemoteSession;

    /// Fails with `Auth`, `Unreachable` or a connect-phase `Timeout`.
    fn open(
        &self,
        host: &str,
        credentials: &Credentials,
        connect_timeout: Duration,
    ) -> impl Future<Output = Result<Self::Session>> + Send;
}

/// One open session. Owned by a single operation and never shared.
pub trait RemoteSession: Send {
    fn host(&self) -> &str;

    /// Run `command`, optionally feeding `stdin` to it, and wait for it to
    /// exit. A nonzero exit is reported in [`ExecOutput`], not as an error.
    fn run(
        &mut self,
        command: &str,
        stdin: Option<&[u8]>,
        exec_timeout: Duration,
    ) -> impl Future<Output = Result<ExecOutput>> + Send;

    /// Idempotent; safe after any failure.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}
