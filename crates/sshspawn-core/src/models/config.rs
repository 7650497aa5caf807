use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Built-in host selection policies that can be named in the config file.
/// Custom policies are handed to `HostPool::with_balancer` directly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerKind {
    #[default]
    LeastLoaded,
    RoundRobin,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpawnerConfig {
    pub hosts: Vec<String>,
    #[serde(default)]
    pub port_discovery_command: Option<String>,
    pub remote_launch_command_template: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout: f64,
    #[serde(default = "default_discovery_poll_interval")]
    pub discovery_poll_interval: f64,
    #[serde(default = "default_discovery_max_attempts")]
    pub discovery_max_attempts: u32,
    #[serde(default = "default_termination_timeout")]
    pub termination_timeout: f64,
    #[serde(default = "default_termination_poll_interval")]
    pub termination_poll_interval: f64,
    #[serde(default)]
    pub load_balancer: LoadBalancerKind,
    #[serde(default = "default_ssh_command")]
    pub ssh_command: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_ssh_keyfile")]
    pub ssh_keyfile: String,
    #[serde(default = "default_remote_username")]
    pub remote_username: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

fn default_connect_timeout() -> f64 {
    10.0
}

fn default_exec_timeout() -> f64 {
    30.0
}

fn default_discovery_poll_interval() -> f64 {
    1.0
}

fn default_discovery_max_attempts() -> u32 {
    30
}

fn default_termination_timeout() -> f64 {
    10.0
}

fn default_termination_poll_interval() -> f64 {
    0.5
}

fn default_ssh_command() -> String {
    "/usr/bin/ssh".into()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_keyfile() -> String {
    "~/.ssh/id_rsa".into()
}

fn default_remote_username() -> String {
    "%U".into()
}

fn default_log_file() -> String {
    "jupyter.log".into()
}

impl SpawnerConfig {
    /// A config with every optional key at its default.
    pub fn new(hosts: Vec<String>, remote_launch_command_template: impl Into<String>) -> Self {
        Self {
            hosts,
            port_discovery_command: None,
            remote_launch_command_template: remote_launch_command_template.into(),
            connect_timeout: default_connect_timeout(),
            exec_timeout: default_exec_timeout(),
            discovery_poll_interval: default_discovery_poll_interval(),
            discovery_max_attempts: default_discovery_max_attempts(),
            termination_timeout: default_termination_timeout(),
            termination_poll_interval: default_termination_poll_interval(),
            load_balancer: LoadBalancerKind::default(),
            ssh_command: default_ssh_command(),
            ssh_port: default_ssh_port(),
            ssh_keyfile: default_ssh_keyfile(),
            remote_username: default_remote_username(),
            path: None,
            log_file: default_log_file(),
            environment: BTreeMap::new(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        seconds(self.connect_timeout)
    }

    pub fn exec_timeout(&self) -> Duration {
        seconds(self.exec_timeout)
    }

    pub fn discovery_poll_interval(&self) -> Duration {
        seconds(self.discovery_poll_interval)
    }

    pub fn termination_timeout(&self) -> Duration {
        seconds(self.termination_timeout)
    }

    pub fn termination_poll_interval(&self) -> Duration {
        seconds(self.termination_poll_interval)
    }

    /// Remote login name for a hub user (`%U` is the user name).
    pub fn remote_user_for(&self, username: &str) -> String {
        self.remote_username.replace("%U", username)
    }

    /// Private key path for a hub user, with `%U` and a leading `~` expanded.
    pub fn keyfile_for(&self, username: &str) -> PathBuf {
        let raw = self.ssh_keyfile.replace("%U", username);
        match raw.strip_prefix("~/") {
            Some(rest) => match std::env::var_os("HOME") {
                Some(home) => PathBuf::from(home).join(rest),
                None => PathBuf::from(&raw),
            },
            None => PathBuf::from(&raw),
        }
    }
}

fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}
