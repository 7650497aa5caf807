use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::error::{Result, SpawnerError, TimeoutPhase};
use crate::models::SpawnerConfig;

use super::session::{Credentials, ExecOutput, RemoteSession, SessionConnector};

static NEXT_SOCKET: AtomicU64 = AtomicU64::new(0);

const CHECK_INTERVAL: Duration = Duration::from_millis(100);
const EXIT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens sessions with the system OpenSSH client.
///
/// Each session is a ControlMaster connection owned by the session value;
/// commands are multiplexed over its control socket so authentication
/// happens once per session.
#[derive(Debug, Clone)]
pub struct OpenSshConnector {
    ssh_command: String,
    control_dir: PathBuf,
}

impl OpenSshConnector {
    pub fn new(ssh_command: impl Into<String>) -> Self {
        Self {
            ssh_command: ssh_command.into(),
            control_dir: std::env::temp_dir(),
        }
    }

    pub fn from_config(config: &SpawnerConfig) -> Self {
        Self::new(config.ssh_command.clone())
    }

    pub fn with_control_dir(mut self, control_dir: impl Into<PathBuf>) -> Self {
        self.control_dir = control_dir.into();
        self
    }

    fn next_control_path(&self) -> PathBuf {
        let n = NEXT_SOCKET.fetch_add(1, Ordering::Relaxed);
        self.control_dir
            .join(format!("sshspawn-{}-{n}.sock", std::process::id()))
    }
}

/// Login options shared by the master connection.
pub fn login_args(credentials: &Credentials, connect_timeout: Duration) -> Vec<String> {
    let connect_secs = connect_timeout.as_secs_f64().ceil().max(1.0) as u64;
    vec![
        "-o".into(),
        "BatchMode=yes".into(),
        "-o".into(),
        "StrictHostKeyChecking=accept-new".into(),
        "-o".into(),
        "PreferredAuthentications=publickey".into(),
        "-o".into(),
        format!("ConnectTimeout={connect_secs}"),
        "-i".into(),
        credentials.keyfile.to_string_lossy().to_string(),
        "-l".into(),
        credentials.username.clone(),
        "-p".into(),
        credentials.port.to_string(),
    ]
}

const SSH_CLIENT_MARKERS: &[&str] = &[
    "ssh:",
    "mux_client",
    "control socket",
    "controlsocket",
    "permission denied",
    "too many authentication failures",
    "no more authentication methods",
    "host key verification failed",
    "connection refused",
    "no route to host",
    "could not resolve hostname",
    "network is unreachable",
    "name or service not known",
    "connection closed by",
    "connection reset by",
    "kex_exchange_identification",
];

/// Whether stderr of an exit-255 `run` came from the ssh client itself.
///
/// ssh exits 255 on its own errors but also passes a remote command's exit
/// status through, so a remote helper exiting 255 must not be mistaken for a
/// broken connection.
pub fn is_ssh_client_failure(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    SSH_CLIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Map an ssh client failure (exit 255) to the error taxonomy.
pub fn classify_ssh_failure(host: &str, stderr: &str) -> SpawnerError {
    let message = stderr.trim().to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("permission denied")
        || lower.contains("too many authentication failures")
        || lower.contains("no more authentication methods")
        || lower.contains("host key verification failed")
    {
        SpawnerError::Auth {
            host: host.to_string(),
            message,
        }
    } else if lower.contains("connection refused")
        || lower.contains("no route to host")
        || lower.contains("could not resolve hostname")
        || lower.contains("network is unreachable")
        || lower.contains("name or service not known")
    {
        SpawnerError::Unreachable {
            host: host.to_string(),
            message,
        }
    } else if lower.contains("timed out") {
        SpawnerError::Timeout {
            host: host.to_string(),
            phase: TimeoutPhase::Connect,
            elapsed: Duration::ZERO,
        }
    } else {
        SpawnerError::Session {
            host: host.to_string(),
            message,
        }
    }
}

impl SessionConnector for OpenSshConnector {
    type Session = OpenSshSession;

    async fn open(
        &self,
        host: &str,
        credentials: &Credentials,
        connect_timeout: Duration,
    ) -> Result<OpenSshSession> {
        let control_path = self.next_control_path();
        tracing::debug!(host, control_path = %control_path.display(), "opening ssh master");

        let mut master = Command::new(&self.ssh_command)
            .args(login_args(credentials, connect_timeout))
            .args(["-M", "-N", "-o", "ControlPersist=no", "-S"])
            .arg(&control_path)
            .arg(host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SpawnerError::Session {
                host: host.to_string(),
                message: format!("failed to start {}: {e}", self.ssh_command),
            })?;

        let ready = tokio::time::timeout(connect_timeout, async {
            loop {
                match master.try_wait() {
                    Ok(Some(status)) => return Err(master_exited(host, status, &mut master).await),
                    Ok(None) => {}
                    Err(e) => {
                        return Err(SpawnerError::Session {
                            host: host.to_string(),
                            message: format!("failed to query ssh master: {e}"),
                        })
                    }
                }
                if control_check(&self.ssh_command, &control_path, host).await {
                    return Ok(());
                }
                tokio::time::sleep(CHECK_INTERVAL).await;
            }
        })
        .await;

        match ready {
            Ok(Ok(())) => Ok(OpenSshSession {
                host: host.to_string(),
                ssh_command: self.ssh_command.clone(),
                control_path,
                master: Some(master),
            }),
            Ok(Err(e)) => {
                let _ = master.kill().await;
                Err(e)
            }
            Err(_) => {
                let _ = master.kill().await;
                let _ = std::fs::remove_file(&control_path);
                Err(SpawnerError::Timeout {
                    host: host.to_string(),
                    phase: TimeoutPhase::Connect,
                    elapsed: connect_timeout,
                })
            }
        }
    }
}

async fn master_exited(host: &str, status: ExitStatus, master: &mut Child) -> SpawnerError {
    let mut stderr = String::new();
    if let Some(mut pipe) = master.stderr.take() {
        let _ = pipe.read_to_string(&mut stderr).await;
    }
    tracing::debug!(host, ?status, stderr = %stderr.trim(), "ssh master exited during connect");
    classify_ssh_failure(host, &stderr)
}

async fn control_check(ssh_command: &str, control_path: &Path, host: &str) -> bool {
    Command::new(ssh_command)
        .arg("-S")
        .arg(control_path)
        .args(["-O", "check", host])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// A live ControlMaster connection. Dropping it without `close` kills the
/// master process.
pub struct OpenSshSession {
    host: String,
    ssh_command: String,
    control_path: PathBuf,
    master: Option<Child>,
}

impl RemoteSession for OpenSshSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(
        &mut self,
        command: &str,
        stdin: Option<&[u8]>,
        exec_timeout: Duration,
    ) -> Result<ExecOutput> {
        if self.master.is_none() {
            return Err(SpawnerError::Session {
                host: self.host.clone(),
                message: "session is closed".into(),
            });
        }
        tracing::debug!(host = %self.host, command, piped = stdin.is_some(), "running remote command");

        let mut child = Command::new(&self.ssh_command)
            .arg("-S")
            .arg(&self.control_path)
            .args(["-o", "BatchMode=yes"])
            .arg(&self.host)
            .arg(command)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SpawnerError::Session {
                host: self.host.clone(),
                message: format!("failed to start {}: {e}", self.ssh_command),
            })?;

        if let (Some(payload), Some(mut pipe)) = (stdin, child.stdin.take()) {
            let payload = payload.to_vec();
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&payload).await {
                    tracing::debug!("failed to write remote stdin: {e}");
                }
                let _ = pipe.shutdown().await;
            });
        }

        let output = match tokio::time::timeout(exec_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SpawnerError::Session {
                    host: self.host.clone(),
                    message: format!("failed to wait for ssh: {e}"),
                })
            }
            Err(_) => {
                return Err(SpawnerError::Timeout {
                    host: self.host.clone(),
                    phase: TimeoutPhase::Exec,
                    elapsed: exec_timeout,
                })
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code == 255 {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_ssh_client_failure(&stderr) {
                return Err(classify_ssh_failure(&self.host, &stderr));
            }
        }
        let output = ExecOutput {
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        };
        tracing::debug!(
            host = %self.host,
            exit_code,
            stdout = %output.stdout_str(),
            stderr = %output.stderr_str(),
            "remote command finished"
        );
        Ok(output)
    }

    async fn close(&mut self) {
        let Some(mut master) = self.master.take() else {
            return;
        };
        let exit = Command::new(&self.ssh_command)
            .arg("-S")
            .arg(&self.control_path)
            .args(["-O", "exit", &self.host])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match tokio::time::timeout(EXIT_REQUEST_TIMEOUT, exit).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => tracing::warn!(host = %self.host, ?status, "ssh -O exit failed"),
            Ok(Err(e)) => tracing::warn!(host = %self.host, "ssh -O exit failed: {e}"),
            Err(_) => tracing::warn!(host = %self.host, "ssh -O exit timed out"),
        }
        let _ = master.kill().await;
        let _ = std::fs::remove_file(&self.control_path);
        tracing::debug!(host = %self.host, "ssh session closed");
    }
}

impl Drop for OpenSshSession {
    fn drop(&mut self) {
        if self.master.is_some() {
            tracing::warn!(host = %self.host, "ssh session dropped without close");
            let _ = std::fs::remove_file(&self.control_path);
        }
    }
}
