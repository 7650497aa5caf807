use std::path::{Path, PathBuf};

use sshspawn_core::error::{Result, SpawnerError};
use sshspawn_core::SpawnedServerRecord;

/// One JSON file per user under the state directory, holding the record
/// returned by `start`.
pub struct ServerStateStore {
    state_directory: PathBuf,
}

impl ServerStateStore {
    pub fn new(state_directory: &Path) -> Self {
        Self {
            state_directory: state_directory.to_path_buf(),
        }
    }

    fn path_for(&self, username: &str) -> PathBuf {
        self.state_directory.join(format!("{username}.json"))
    }

    pub async fn load(&self, username: &str) -> Result<Option<SpawnedServerRecord>> {
        let path = self.path_for(username);
        if !path.exists() {
            return Ok(None);
        }
        let json = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| SpawnerError::State(format!("failed to read {}: {e}", path.display())))?;
        SpawnedServerRecord::from_state(&json).map(Some)
    }

    /// Every stored record. Unreadable files are skipped with a warning so one
    /// corrupt entry does not hide the others from the pool counters.
    pub async fn load_all(&self) -> Result<Vec<SpawnedServerRecord>> {
        if !self.state_directory.exists() {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&self.state_directory)
            .await
            .map_err(|e| SpawnerError::State(format!("failed to list state dir: {e}")))?;
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = match tokio::fs::read_to_string(&path).await {
                Ok(json) => SpawnedServerRecord::from_state(&json),
                Err(e) => Err(e.into()),
            };
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping state file"),
            }
        }
        records.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(records)
    }

    pub async fn save(&self, record: &SpawnedServerRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.state_directory)
            .await
            .map_err(|e| SpawnerError::State(format!("failed to create state dir: {e}")))?;
        let json = record.to_state()?;
        let path = self.path_for(&record.username);
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| SpawnerError::State(format!("failed to write {}: {e}", path.display())))?;
        Ok(())
    }

    pub async fn remove(&self, username: &str) -> Result<()> {
        let path = self.path_for(username);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SpawnerError::State(format!(
                "failed to remove {}: {e}",
                path.display()
            ))),
        }
    }
}
