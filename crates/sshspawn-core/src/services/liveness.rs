use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Result, SpawnerError};
use crate::models::{Liveness, Signal, SpawnedServerRecord, SpawnerConfig};

use super::launcher::credentials_for;
use super::pool::HostPool;
use super::session::{ExecOutput, RemoteSession, SessionConnector};

/// `kill -0` under the C locale, so "No such process" is never translated.
pub fn probe_command(pid: u32) -> String {
    format!("LC_ALL=C kill -0 {pid}")
}

pub fn signal_command(signal: Signal, pid: u32) -> String {
    format!("LC_ALL=C kill -s {} {pid}", signal.name())
}

fn no_such_process(output: &ExecOutput) -> bool {
    output
        .stderr_str()
        .to_ascii_lowercase()
        .contains("no such process")
}

/// Signal-0 probe over an open session.
pub async fn probe<S: RemoteSession>(
    session: &mut S,
    pid: u32,
    exec_timeout: Duration,
) -> Result<Liveness> {
    let output = session
        .run(&probe_command(pid), None, exec_timeout)
        .await?;
    if output.success() {
        Ok(Liveness::Alive)
    } else if no_such_process(&output) {
        Ok(Liveness::Dead)
    } else {
        Err(SpawnerError::Session {
            host: session.host().to_string(),
            message: format!(
                "liveness probe for pid {pid} exited {}: {}",
                output.exit_code,
                output.stderr_str()
            ),
        })
    }
}

/// Check whether the server behind `record` is still running.
pub async fn poll<C: SessionConnector>(
    connector: &C,
    config: &SpawnerConfig,
    record: &SpawnedServerRecord,
) -> Result<Liveness> {
    let credentials = credentials_for(config, &record.username);
    let mut session = connector
        .open(&record.hostname, &credentials, config.connect_timeout())
        .await?;
    let result = probe(&mut session, record.pid, config.exec_timeout()).await;
    session.close().await;
    let liveness = result?;
    tracing::debug!(host = %record.hostname, pid = record.pid, ?liveness, "polled server");
    Ok(liveness)
}

/// Signal the server and wait for it to exit.
///
/// On confirmed exit the host's session counter in `pool` is decremented.
/// If the process outlives `termination_timeout` this returns
/// `TerminationTimeout` and leaves the counter alone; escalating to a stronger
/// signal is the caller's decision.
pub async fn stop<C: SessionConnector>(
    connector: &C,
    config: &SpawnerConfig,
    pool: &HostPool,
    record: &SpawnedServerRecord,
    signal: Signal,
) -> Result<()> {
    let credentials = credentials_for(config, &record.username);
    let mut session = connector
        .open(&record.hostname, &credentials, config.connect_timeout())
        .await?;
    let result = terminate(&mut session, config, record.pid, signal).await;
    session.close().await;
    result?;

    match pool.host(&record.hostname) {
        Some(host) => match host.decrement() {
            Some(count) => tracing::info!(
                host = %record.hostname,
                pid = record.pid,
                sessions = count,
                "server stopped"
            ),
            None => tracing::warn!(
                host = %record.hostname,
                pid = record.pid,
                "server stopped but host session count was already zero"
            ),
        },
        None => tracing::warn!(
            host = %record.hostname,
            pid = record.pid,
            "server stopped on a host that is no longer in the pool"
        ),
    }
    Ok(())
}

async fn terminate<S: RemoteSession>(
    session: &mut S,
    config: &SpawnerConfig,
    pid: u32,
    signal: Signal,
) -> Result<()> {
    let exec_timeout = config.exec_timeout();
    let output = session
        .run(&signal_command(signal, pid), None, exec_timeout)
        .await?;
    if !output.success() {
        if no_such_process(&output) {
            tracing::debug!(host = %session.host(), pid, "server already gone");
            return Ok(());
        }
        return Err(SpawnerError::RemoteExec {
            host: session.host().to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr_str(),
        });
    }

    let timeout = config.termination_timeout();
    let deadline = Instant::now() + timeout;
    loop {
        if probe(session, pid, exec_timeout).await? == Liveness::Dead {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(SpawnerError::TerminationTimeout {
                host: session.host().to_string(),
                pid,
                waited: timeout,
            });
        }
        let wait = config.termination_poll_interval().min(deadline - now);
        tokio::time::sleep(wait).await;
    }
}
