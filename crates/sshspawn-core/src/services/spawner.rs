use crate::error::Result;
use crate::models::{Liveness, ServerStatus, Signal, SpawnRequest, SpawnedServerRecord, SpawnerConfig};

use super::launcher;
use super::liveness;
use super::pool::HostPool;
use super::session::SessionConnector;
use super::ssh::OpenSshConnector;

/// The surface the hub calls: `start`, `poll` and `stop` for one user's
/// server at a time.
///
/// Calls for different records are independent and may run concurrently on
/// a shared `SshSpawner`; the only shared mutable state is the per-host
/// session counters inside the pool.
pub struct SshSpawner<C = OpenSshConnector> {
    config: SpawnerConfig,
    pool: HostPool,
    connector: C,
}

impl SshSpawner<OpenSshConnector> {
    pub fn from_config(config: SpawnerConfig) -> Self {
        let connector = OpenSshConnector::from_config(&config);
        let pool = HostPool::with_kind(config.hosts.clone(), config.load_balancer);
        Self::new(config, pool, connector)
    }
}

impl<C: SessionConnector> SshSpawner<C> {
    pub fn new(config: SpawnerConfig, pool: HostPool, connector: C) -> Self {
        Self {
            config,
            pool,
            connector,
        }
    }

    pub fn config(&self) -> &SpawnerConfig {
        &self.config
    }

    pub fn pool(&self) -> &HostPool {
        &self.pool
    }

    /// A request for `username` using the configured launch template.
    pub fn request_for(&self, username: &str) -> SpawnRequest {
        SpawnRequest::new(username, self.config.remote_launch_command_template.clone())
    }

    /// Pick a host and launch the server there. The returned record is ready
    /// (`is_ready()`); persist it with [`SpawnedServerRecord::to_state`].
    pub async fn start(&self, request: &SpawnRequest) -> Result<SpawnedServerRecord> {
        self.start_excluding(request, &[]).await
    }

    /// Like [`start`](Self::start) but never selects a host in `excluded`.
    pub async fn start_excluding(
        &self,
        request: &SpawnRequest,
        excluded: &[String],
    ) -> Result<SpawnedServerRecord> {
        let host = self.pool.select_excluding(excluded)?;
        tracing::info!(user = %request.username, host = host.hostname(), "starting server");
        launcher::launch(&self.connector, &self.config, request, &host).await
    }

    /// `true` while the server is running. A running record whose process
    /// has vanished is marked `Failed`.
    pub async fn poll(&self, record: &mut SpawnedServerRecord) -> Result<bool> {
        if record.status == ServerStatus::Stopped {
            return Ok(false);
        }
        match liveness::poll(&self.connector, &self.config, record).await? {
            Liveness::Alive => Ok(true),
            Liveness::Dead => {
                if record.status == ServerStatus::Running {
                    tracing::warn!(
                        user = %record.username,
                        host = %record.hostname,
                        pid = record.pid,
                        "server exited without being stopped"
                    );
                    record.advance(ServerStatus::Failed)?;
                }
                Ok(false)
            }
        }
    }

    /// Stop with `SIGTERM`.
    pub async fn stop(&self, record: &mut SpawnedServerRecord) -> Result<()> {
        self.stop_with_signal(record, Signal::Terminate).await
    }

    /// Signal the server and wait for it to exit. On `TerminationTimeout`
    /// the record stays `Stopping` so the caller can retry with
    /// [`Signal::Kill`].
    pub async fn stop_with_signal(
        &self,
        record: &mut SpawnedServerRecord,
        signal: Signal,
    ) -> Result<()> {
        if record.status == ServerStatus::Stopped {
            return Ok(());
        }
        record.advance(ServerStatus::Stopping)?;
        tracing::info!(
            user = %record.username,
            host = %record.hostname,
            pid = record.pid,
            signal = signal.name(),
            "stopping server"
        );
        liveness::stop(&self.connector, &self.config, &self.pool, record, signal).await?;
        record.advance(ServerStatus::Stopped)
    }
}
