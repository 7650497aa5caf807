use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sshspawn_core::models::Signal;

#[derive(Debug, Parser)]
#[command(
    name = "sshspawn",
    version,
    about = "Start, poll and stop single-user servers on remote hosts over SSH",
    long_about = None
)]
pub struct Args {
    #[command(subcommand)]
    pub action: Action,

    /// User whose server is managed (required).
    #[arg(long, global = true, value_parser = parse_user)]
    pub user: Option<String>,

    /// Config file (default: ./.sshspawn.yaml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Where server records are kept.
    #[arg(long, global = true, default_value = ".sshspawn-state")]
    pub state_dir: PathBuf,

    /// Write debug logs to .sshspawn-debug.log.
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Action {
    /// Launch a server on the least busy host and print `<ip> <port>`.
    Start {
        /// Extra environment for the server (repeatable).
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Per-command timeout in seconds.
        #[arg(long, value_name = "SECS", value_parser = parse_seconds)]
        timeout: Option<Duration>,
    },
    /// Report whether the server is still running.
    Poll,
    /// Signal the server and wait for it to exit.
    Stop {
        /// TERM, INT or KILL.
        #[arg(long, value_parser = parse_signal, default_value = "TERM")]
        signal: Signal,
    },
}

fn parse_user(raw: &str) -> Result<String, String> {
    if raw.is_empty() || raw.contains('/') || raw == "." || raw == ".." {
        return Err(format!("invalid user name {raw:?}"));
    }
    Ok(raw.to_string())
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in {raw:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_seconds(raw: &str) -> Result<Duration, String> {
    raw.parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s > 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| format!("expected positive seconds, got {raw:?}"))
}

fn parse_signal(raw: &str) -> Result<Signal, String> {
    Signal::parse(raw).ok_or_else(|| format!("unknown signal {raw:?} (TERM, INT or KILL)"))
}
