mod cli;
mod state;

use std::path::Path;

use clap::Parser;
use color_eyre::eyre::{bail, eyre, WrapErr};
use sshspawn_core::models::ServerStatus;
use sshspawn_core::services::config_loader;
use sshspawn_core::{SpawnRequest, SpawnedServerRecord, SpawnerError, SshSpawner};

use crate::cli::{Action, Args};
use crate::state::ServerStateStore;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let _guard = if args.debug {
        Some(setup_debug_logging())
    } else {
        setup_stderr_logging();
        None
    };

    run(args).await
}

/// Configure file-based tracing to `.sshspawn-debug.log` in CWD.
/// Returns the guard that must be held alive for the duration of the program.
fn setup_debug_logging() -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::never(".", ".sshspawn-debug.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_ansi(false)
        .init();

    guard
}

fn setup_stderr_logging() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

async fn run(args: Args) -> color_eyre::Result<()> {
    let user = args
        .user
        .clone()
        .ok_or_else(|| eyre!("--user is required"))?;
    let config = match &args.config {
        Some(path) => config_loader::load(path)?,
        None => config_loader::load_from_dir(Path::new("."))?,
    };
    let spawner = SshSpawner::from_config(config);
    let store = ServerStateStore::new(&args.state_dir);

    let known = store.load_all().await?;
    spawner.pool().restore(&known);
    tracing::debug!(records = known.len(), "restored host counters");

    match args.action {
        Action::Start { env, timeout } => {
            let mut request = spawner.request_for(&user);
            for (key, value) in env {
                request = request.env(key, value);
            }
            if let Some(timeout) = timeout {
                request = request.with_timeout(timeout);
            }
            start(&spawner, &store, &request).await
        }
        Action::Poll => poll(&spawner, &store, &user).await,
        Action::Stop { signal } => {
            let Some(mut record) = store.load(&user).await? else {
                tracing::info!(user = %user, "no server on record");
                return Ok(());
            };
            let result = spawner.stop_with_signal(&mut record, signal).await;
            if record.status == ServerStatus::Stopped {
                store.remove(&user).await?;
            } else {
                store.save(&record).await?;
            }
            result.wrap_err_with(|| format!("failed to stop server for {user}"))
        }
    }
}

async fn start(
    spawner: &SshSpawner,
    store: &ServerStateStore,
    request: &SpawnRequest,
) -> color_eyre::Result<()> {
    let user = &request.username;
    if let Some(mut existing) = store.load(user).await? {
        if spawner.poll(&mut existing).await? {
            bail!(
                "{user} already has a server on {} (pid {})",
                existing.hostname,
                existing.pid
            );
        }
        // Releases the host counter held by the dead record.
        spawner.stop(&mut existing).await?;
        store.remove(user).await?;
    }

    let record = start_with_retry(spawner, request).await?;
    store.save(&record).await?;
    if let Some((ip, port)) = record.address() {
        println!("{ip} {port}");
    }
    Ok(())
}

/// Hosts that could not be reached are skipped in favour of the rest of the
/// pool until one succeeds or none are left.
async fn start_with_retry(
    spawner: &SshSpawner,
    request: &SpawnRequest,
) -> color_eyre::Result<SpawnedServerRecord> {
    let mut excluded = Vec::new();
    loop {
        match spawner.start_excluding(request, &excluded).await {
            Ok(record) => return Ok(record),
            Err(e) if e.is_retryable_on_other_host() => {
                let host = match &e {
                    SpawnerError::Unreachable { host, .. } | SpawnerError::Timeout { host, .. } => {
                        Some(host.clone())
                    }
                    _ => None,
                };
                let Some(host) = host else {
                    return Err(e.into());
                };
                tracing::warn!(host = %host, error = %e, "host unavailable, trying another");
                excluded.push(host);
            }
            Err(SpawnerError::NoHostsAvailable) if !excluded.is_empty() => {
                bail!("no reachable host (tried {})", excluded.join(", "));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn poll(
    spawner: &SshSpawner,
    store: &ServerStateStore,
    user: &str,
) -> color_eyre::Result<()> {
    let Some(mut record) = store.load(user).await? else {
        println!("{}", serde_json::json!({ "user": user, "running": false }));
        return Ok(());
    };
    let running = spawner.poll(&mut record).await?;
    store.save(&record).await?;
    println!(
        "{}",
        serde_json::json!({
            "user": user,
            "running": running,
            "host": record.hostname,
            "pid": record.pid,
            "status": record.status,
            "endpoint": record.endpoint.as_ref().map(|e| e.to_string()),
        })
    );
    Ok(())
}
