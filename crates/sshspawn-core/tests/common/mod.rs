// Each test binary compiles this module independently and uses a different
// subset of helpers, so unused-function warnings are expected.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sshspawn_core::error::{Result, SpawnerError, TimeoutPhase};
use sshspawn_core::models::SpawnerConfig;
use sshspawn_core::services::{Credentials, ExecOutput, RemoteSession, SessionConnector};

/// Command name the tests configure as `port_discovery_command`.
pub const DISCOVER_COMMAND: &str = "discover-port";

/// How one simulated host behaves.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    pub unreachable: bool,
    pub auth_fails: bool,
    pub launch_exit: i32,
    /// Discovery attempts that report "not listening" before the endpoint.
    pub discovery_failures: u32,
    /// Replaces the `<ip> <port>` line discovery prints.
    pub discovery_output: Option<String>,
    pub ignore_term: bool,
    pub probe_denied: bool,
    /// `kill` reports errors in German unless run under `LC_ALL=C`.
    pub localized: bool,
    /// Commands starting with this never finish.
    pub hang_on: Option<String>,
    pub connect_hangs: bool,
    pub latency: Duration,
}

/// A set of simulated hosts that understands the handful of commands the
/// spawner sends: the launch script, discovery, `kill -0` and `kill -s`.
#[derive(Default)]
pub struct FakeRemote {
    behaviors: Mutex<HashMap<String, Behavior>>,
    processes: Mutex<HashSet<(String, u32)>>,
    discovery_calls: Mutex<HashMap<(String, u32), u32>>,
    commands: Mutex<Vec<(String, String)>>,
    next_pid: AtomicU32,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        let remote = Self::default();
        remote.next_pid.store(1000, Ordering::SeqCst);
        Arc::new(remote)
    }

    pub fn set_behavior(&self, host: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(host.to_string(), behavior);
    }

    fn behavior(&self, host: &str) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(host)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_running(&self, host: &str, pid: u32) -> bool {
        self.processes
            .lock()
            .unwrap()
            .contains(&(host.to_string(), pid))
    }

    /// Simulate the server dying on its own.
    pub fn crash(&self, host: &str, pid: u32) {
        self.processes
            .lock()
            .unwrap()
            .remove(&(host.to_string(), pid));
    }

    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn handle(&self, host: &str, command: &str, stdin: Option<&[u8]>) -> ExecOutput {
        self.commands
            .lock()
            .unwrap()
            .push((host.to_string(), command.to_string()));
        let behavior = self.behavior(host);
        let (c_locale, command) = match command.strip_prefix("LC_ALL=C ") {
            Some(rest) => (true, rest),
            None => (false, command),
        };
        let localized = behavior.localized && !c_locale;
        let no_such_process = |pid: u32| {
            if localized {
                format!("bash: kill: ({pid}) - Kein passender Prozess gefunden")
            } else {
                format!("bash: kill: ({pid}) - No such process")
            }
        };

        if command == "bash -s" {
            let script = String::from_utf8_lossy(stdin.unwrap_or_default());
            assert!(script.contains("echo $!"), "unexpected launch script: {script}");
            if behavior.launch_exit != 0 {
                return exit(behavior.launch_exit, "", "jupyterhub-singleuser: command not found");
            }
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.processes
                .lock()
                .unwrap()
                .insert((host.to_string(), pid));
            return exit(0, &format!("{pid}\n"), "");
        }

        if let Some(pid) = discovery_pid(command) {
            let mut calls = self.discovery_calls.lock().unwrap();
            let count = calls.entry((host.to_string(), pid)).or_insert(0);
            *count += 1;
            if *count <= behavior.discovery_failures {
                return exit(1, "", &format!("process {pid} is not listening yet"));
            }
            let line = behavior
                .discovery_output
                .unwrap_or_else(|| "10.0.0.5 8888".to_string());
            return exit(0, &format!("{line}\n"), "");
        }

        if let Some(pid) = command.strip_prefix("kill -0 ") {
            let pid: u32 = pid.parse().unwrap();
            if behavior.probe_denied {
                return exit(1, "", &format!("bash: kill: ({pid}) - Operation not permitted"));
            }
            return if self.is_running(host, pid) {
                exit(0, "", "")
            } else {
                exit(1, "", &no_such_process(pid))
            };
        }

        if let Some(rest) = command.strip_prefix("kill -s ") {
            let (signal, pid) = rest.split_once(' ').unwrap();
            let pid: u32 = pid.parse().unwrap();
            if !self.is_running(host, pid) {
                return exit(1, "", &no_such_process(pid));
            }
            if !(signal == "TERM" && behavior.ignore_term) {
                self.crash(host, pid);
            }
            return exit(0, "", "");
        }

        exit(127, "", &format!("bash: {command}: command not found"))
    }
}

fn discovery_pid(command: &str) -> Option<u32> {
    let rest = command
        .strip_prefix("bash -s -- ")
        .or_else(|| command.strip_prefix(&format!("{DISCOVER_COMMAND} ")))?;
    rest.split_whitespace().next()?.parse().ok()
}

fn exit(code: i32, stdout: &str, stderr: &str) -> ExecOutput {
    ExecOutput {
        exit_code: code,
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

#[derive(Clone)]
pub struct FakeConnector(pub Arc<FakeRemote>);

impl SessionConnector for FakeConnector {
    type Session = FakeSession;

    async fn open(
        &self,
        host: &str,
        _credentials: &Credentials,
        connect_timeout: Duration,
    ) -> Result<FakeSession> {
        let behavior = self.0.behavior(host);
        if !behavior.latency.is_zero() {
            tokio::time::sleep(behavior.latency).await;
        }
        if behavior.connect_hangs {
            tokio::time::sleep(connect_timeout).await;
            return Err(SpawnerError::Timeout {
                host: host.to_string(),
                phase: TimeoutPhase::Connect,
                elapsed: connect_timeout,
            });
        }
        if behavior.unreachable {
            return Err(SpawnerError::Unreachable {
                host: host.to_string(),
                message: format!("ssh: connect to host {host} port 22: Connection refused"),
            });
        }
        if behavior.auth_fails {
            return Err(SpawnerError::Auth {
                host: host.to_string(),
                message: "Permission denied (publickey).".into(),
            });
        }
        assert!(!connect_timeout.is_zero());
        self.0.opens.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSession {
            remote: Arc::clone(&self.0),
            host: host.to_string(),
            closed: false,
        })
    }
}

pub struct FakeSession {
    remote: Arc<FakeRemote>,
    host: String,
    closed: bool,
}

impl RemoteSession for FakeSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(
        &mut self,
        command: &str,
        stdin: Option<&[u8]>,
        exec_timeout: Duration,
    ) -> Result<ExecOutput> {
        assert!(!self.closed, "command sent on a closed session");
        let behavior = self.remote.behavior(&self.host);
        let hangs = behavior.hang_on.as_deref().is_some_and(|prefix| {
            command
                .strip_prefix("LC_ALL=C ")
                .unwrap_or(command)
                .starts_with(prefix)
        });
        let work = async {
            if !behavior.latency.is_zero() {
                tokio::time::sleep(behavior.latency).await;
            }
            if hangs {
                std::future::pending::<()>().await;
            }
            self.remote.handle(&self.host, command, stdin)
        };
        tokio::time::timeout(exec_timeout, work)
            .await
            .map_err(|_| SpawnerError::Timeout {
                host: self.host.clone(),
                phase: TimeoutPhase::Exec,
                elapsed: exec_timeout,
            })
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.remote.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Config with intervals short enough for tests.
pub fn test_config(hosts: &[&str]) -> SpawnerConfig {
    let mut config = SpawnerConfig::new(
        hosts.iter().map(|h| h.to_string()).collect(),
        "jupyterhub-singleuser --ip=0.0.0.0 --port=0",
    );
    config.connect_timeout = 0.2;
    config.exec_timeout = 0.2;
    config.discovery_poll_interval = 0.001;
    config.discovery_max_attempts = 5;
    config.termination_timeout = 0.05;
    config.termination_poll_interval = 0.005;
    config
}
