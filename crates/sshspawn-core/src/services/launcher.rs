use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::error::{Result, SpawnerError};
use crate::models::{HostRecord, ServerStatus, Signal, SpawnRequest, SpawnedServerRecord, SpawnerConfig};

use super::discovery;
use super::liveness::signal_command;
use super::session::{Credentials, RemoteSession, SessionConnector};

// Group 1 catches a leading `$` so shell `${VAR}` expansions pass through.
static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\$?)\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

static ENV_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Quote `s` for a POSIX shell unless it is made only of safe characters.
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '%' | ':' | '=' | ',')
    }) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Login used for every remote operation on behalf of `username`.
pub fn credentials_for(config: &SpawnerConfig, username: &str) -> Credentials {
    Credentials {
        username: config.remote_user_for(username),
        keyfile: config.keyfile_for(username),
        port: config.ssh_port,
    }
}

/// Environment exported before the server starts. Request overrides win over
/// the static config, and `PATH` from the config wins over both.
pub fn launch_environment(config: &SpawnerConfig, request: &SpawnRequest) -> BTreeMap<String, String> {
    let mut env = config.environment.clone();
    env.insert("JUPYTERHUB_USER".into(), request.username.clone());
    env.extend(request.environment.clone());
    if let Some(path) = &config.path {
        env.insert("PATH".into(), path.clone());
    }
    env
}

/// Substitute `{username}`, `{log_file}` and `{KEY}` for any exported
/// variable. Substituted values are shell-quoted; the template itself is
/// trusted shell text, so `${VAR}` is left for the remote shell to expand.
pub fn render_command(
    template: &str,
    config: &SpawnerConfig,
    request: &SpawnRequest,
    env: &BTreeMap<String, String>,
) -> Result<String> {
    let mut missing = Vec::new();
    let rendered = PLACEHOLDER_RE.replace_all(template, |caps: &regex::Captures| {
        if !caps[1].is_empty() {
            return caps[0].to_string();
        }
        let key = &caps[2];
        let value = match key {
            "username" => Some(request.username.as_str()),
            "log_file" => Some(config.log_file.as_str()),
            _ => env.get(key).map(String::as_str),
        };
        match value {
            Some(v) => shell_escape(v),
            None => {
                missing.push(key.to_string());
                String::new()
            }
        }
    });
    if !missing.is_empty() {
        return Err(SpawnerError::Launch {
            host: String::new(),
            message: format!("unknown template placeholder(s): {}", missing.join(", ")),
        });
    }
    let rendered = rendered.trim().to_string();
    if rendered.is_empty() {
        return Err(SpawnerError::Launch {
            host: String::new(),
            message: "launch command is empty".into(),
        });
    }
    Ok(rendered)
}

/// Bash script piped to `bash -s`: exports the environment, starts the server
/// in its own session with stdio detached so it outlives the ssh connection,
/// and prints its pid.
pub fn render_launch_script(config: &SpawnerConfig, request: &SpawnRequest) -> Result<String> {
    let env = launch_environment(config, request);
    if let Some(bad) = env.keys().find(|k| !ENV_KEY_RE.is_match(k)) {
        return Err(SpawnerError::Launch {
            host: String::new(),
            message: format!("invalid environment variable name {bad:?}"),
        });
    }
    let command = render_command(&request.command_template, config, request, &env)?;

    let mut script = String::from("#!/bin/bash\n");
    for (key, value) in &env {
        let _ = writeln!(script, "export {key}={}", shell_escape(value));
    }
    script.push_str("detach=nohup\n");
    script.push_str("command -v setsid >/dev/null 2>&1 && detach=\"setsid nohup\"\n");
    let _ = writeln!(
        script,
        "$detach {command} < /dev/null >> {} 2>&1 &",
        shell_escape(&config.log_file)
    );
    script.push_str("echo $!\n");
    Ok(script)
}

fn parse_pid(host: &str, stdout: &str) -> Result<u32> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.parse::<u32>().ok())
        .filter(|pid| *pid > 0)
        .ok_or_else(|| SpawnerError::Launch {
            host: host.to_string(),
            message: format!("launch script did not report a pid (stdout: {stdout:?})"),
        })
}

/// Start the server described by `request` on `host` and wait for it to
/// report its endpoint.
///
/// The session is closed before returning on every path. On success the
/// host's session counter is incremented.
pub async fn launch<C: SessionConnector>(
    connector: &C,
    config: &SpawnerConfig,
    request: &SpawnRequest,
    host: &HostRecord,
) -> Result<SpawnedServerRecord> {
    let script = render_launch_script(config, request).map_err(|e| with_host(e, host.hostname()))?;
    let credentials = credentials_for(config, &request.username);
    let exec_timeout = request.timeout.unwrap_or_else(|| config.exec_timeout());

    let mut session = connector
        .open(host.hostname(), &credentials, config.connect_timeout())
        .await?;
    let result = launch_on(&mut session, config, &request.username, &script, exec_timeout).await;
    session.close().await;

    let record = result?;
    let count = host.increment();
    tracing::info!(
        user = %request.username,
        host = %record.hostname,
        pid = record.pid,
        endpoint = ?record.endpoint,
        sessions = count,
        "server running"
    );
    Ok(record)
}

async fn launch_on<S: RemoteSession>(
    session: &mut S,
    config: &SpawnerConfig,
    username: &str,
    script: &str,
    exec_timeout: Duration,
) -> Result<SpawnedServerRecord> {
    let host = session.host().to_string();
    tracing::debug!(%host, script, "launching server");
    let output = session
        .run("bash -s", Some(script.as_bytes()), exec_timeout)
        .await?;
    if !output.success() {
        return Err(SpawnerError::Launch {
            host,
            message: format!("launch script exited {}: {}", output.exit_code, output.stderr_str()),
        });
    }
    let pid = parse_pid(&host, &output.stdout_str())?;

    let mut record = SpawnedServerRecord::new(host.clone(), username, pid);
    record.advance(ServerStatus::Discovering)?;
    tracing::info!(%host, pid, "server launched, discovering endpoint");

    match discovery::discover(session, config, pid, exec_timeout).await {
        Ok(endpoint) => {
            record.endpoint = Some(endpoint);
            record.advance(ServerStatus::Running)?;
            Ok(record)
        }
        Err(e) => {
            kill_orphan(session, pid, exec_timeout).await;
            Err(e)
        }
    }
}

/// Best effort; the launch has already failed.
async fn kill_orphan<S: RemoteSession>(session: &mut S, pid: u32, exec_timeout: Duration) {
    let command = signal_command(Signal::Kill, pid);
    match session.run(&command, None, exec_timeout).await {
        Ok(output) if output.success() => {
            tracing::warn!(host = %session.host(), pid, "killed server that never reported an endpoint")
        }
        Ok(output) => tracing::warn!(
            host = %session.host(),
            pid,
            stderr = %output.stderr_str(),
            "could not kill server that never reported an endpoint"
        ),
        Err(e) => tracing::warn!(host = %session.host(), pid, "could not kill orphaned server: {e}"),
    }
}

fn with_host(err: SpawnerError, hostname: &str) -> SpawnerError {
    match err {
        SpawnerError::Launch { host, message } if host.is_empty() => SpawnerError::Launch {
            host: hostname.to_string(),
            message,
        },
        other => other,
    }
}
