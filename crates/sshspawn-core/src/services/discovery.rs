use std::time::Duration;

use crate::error::{Result, SpawnerError};
use crate::models::{Endpoint, SpawnerConfig};

use super::session::RemoteSession;

/// Helper piped to `bash -s -- <pid>` when no discovery command is configured.
/// Prints `<ip> <port>` once the pid (or one of its children) has a listening
/// TCP socket, and exits 1 while it has none.
pub const BUILTIN_HELPER: &str = r#"#!/bin/bash
pid="$1"
if [ -z "$pid" ]; then
    echo "usage: discover <pid>" >&2
    exit 2
fi
if ! kill -0 "$pid" 2>/dev/null; then
    echo "process $pid is not running" >&2
    exit 3
fi
port=""
for p in "$pid" $(pgrep -P "$pid" 2>/dev/null); do
    port=$(ss -Hltnp 2>/dev/null | grep "pid=$p," | awk '{print $4}' | sed 's/.*://' | head -n 1)
    [ -n "$port" ] && break
done
if [ -z "$port" ]; then
    echo "process $pid is not listening yet" >&2
    exit 1
fi
ip=$(hostname -I 2>/dev/null | awk '{print $1}')
[ -n "$ip" ] || ip=$(hostname)
echo "$ip $port"
"#;

/// Parse the helper's stdout: exactly one line holding `<ip-or-host> <port>`.
pub fn parse_discovery_output(output: &str) -> Result<Endpoint> {
    let malformed = |reason: &str| SpawnerError::MalformedDiscoveryOutput {
        output: output.to_string(),
        reason: reason.to_string(),
    };

    let line = output.trim_end_matches(['\n', '\r']);
    if line.contains('\n') {
        return Err(malformed("expected a single line"));
    }
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let [ip, port] = tokens.as_slice() else {
        return Err(malformed(&format!(
            "expected 2 tokens, found {}",
            tokens.len()
        )));
    };
    let port: u16 = port
        .parse()
        .map_err(|_| malformed("port is not a number in 1-65535"))?;
    if port == 0 {
        return Err(malformed("port is not a number in 1-65535"));
    }
    Ok(Endpoint {
        ip: ip.to_string(),
        port,
    })
}

/// Remote command plus optional stdin payload for one discovery attempt.
/// A configured command is trusted shell text, like the launch template, so
/// an interpreter plus script path works as written.
pub fn discovery_command(config: &SpawnerConfig, pid: u32) -> (String, Option<&'static [u8]>) {
    match config.port_discovery_command.as_deref() {
        Some(command) => (format!("{} {pid} < /dev/null", command.trim()), None),
        None => (
            format!("bash -s -- {pid}"),
            Some(BUILTIN_HELPER.as_bytes()),
        ),
    }
}

/// Run the discovery helper once. A nonzero exit means the server is not
/// listening yet and is reported as `DiscoveryTimeout`, except 126/127: the
/// helper itself could not be run, which no amount of waiting fixes.
pub async fn discover_once<S: RemoteSession>(
    session: &mut S,
    config: &SpawnerConfig,
    pid: u32,
    exec_timeout: Duration,
) -> Result<Endpoint> {
    let (command, stdin) = discovery_command(config, pid);
    let output = session.run(&command, stdin, exec_timeout).await?;
    if matches!(output.exit_code, 126 | 127) {
        return Err(SpawnerError::RemoteExec {
            host: session.host().to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr_str(),
        });
    }
    if !output.success() {
        return Err(SpawnerError::DiscoveryTimeout {
            host: session.host().to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr_str(),
        });
    }
    parse_discovery_output(&String::from_utf8_lossy(&output.stdout))
}

/// Poll the helper at a fixed interval until it reports an endpoint or the
/// attempt budget runs out.
pub async fn discover<S: RemoteSession>(
    session: &mut S,
    config: &SpawnerConfig,
    pid: u32,
    exec_timeout: Duration,
) -> Result<Endpoint> {
    let max_attempts = config.discovery_max_attempts;
    for attempt in 1..=max_attempts {
        match discover_once(session, config, pid, exec_timeout).await {
            Ok(endpoint) => {
                tracing::debug!(host = %session.host(), pid, attempt, %endpoint, "endpoint discovered");
                return Ok(endpoint);
            }
            Err(SpawnerError::DiscoveryTimeout { exit_code, stderr, .. }) => {
                tracing::debug!(
                    host = %session.host(),
                    pid,
                    attempt,
                    max_attempts,
                    exit_code,
                    %stderr,
                    "server not listening yet"
                );
                if attempt < max_attempts {
                    tokio::time::sleep(config.discovery_poll_interval()).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(SpawnerError::Discovery {
        host: session.host().to_string(),
        pid,
        attempts: max_attempts,
    })
}
