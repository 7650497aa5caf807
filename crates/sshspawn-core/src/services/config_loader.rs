use std::path::Path;

use crate::error::{Result, SpawnerError};
use crate::models::SpawnerConfig;

const CONFIG_FILENAME: &str = ".sshspawn.yaml";

/// Load `.sshspawn.yaml` from `dir`.
pub fn load_from_dir(dir: &Path) -> Result<SpawnerConfig> {
    load(&dir.join(CONFIG_FILENAME))
}

pub fn load(config_path: &Path) -> Result<SpawnerConfig> {
    if !config_path.exists() {
        return Err(SpawnerError::ConfigNotFound(config_path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(config_path)?;
    parse(&contents)
}

pub fn parse(contents: &str) -> Result<SpawnerConfig> {
    let config: SpawnerConfig =
        serde_yaml::from_str(contents).map_err(|e| SpawnerError::InvalidConfig(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &SpawnerConfig) -> Result<()> {
    if config.hosts.is_empty() {
        return Err(SpawnerError::InvalidConfig(
            "hosts must name at least one host".into(),
        ));
    }
    if let Some(index) = config.hosts.iter().position(|h| h.trim().is_empty()) {
        return Err(SpawnerError::InvalidConfig(format!(
            "hosts[{index}] is blank"
        )));
    }
    if config.remote_launch_command_template.trim().is_empty() {
        return Err(SpawnerError::InvalidConfig(
            "remote_launch_command_template is required".into(),
        ));
    }
    if config.discovery_max_attempts == 0 {
        return Err(SpawnerError::InvalidConfig(
            "discovery_max_attempts must be at least 1".into(),
        ));
    }
    for (name, value) in [
        ("connect_timeout", config.connect_timeout),
        ("exec_timeout", config.exec_timeout),
        ("discovery_poll_interval", config.discovery_poll_interval),
        ("termination_timeout", config.termination_timeout),
        ("termination_poll_interval", config.termination_poll_interval),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(SpawnerError::InvalidConfig(format!(
                "{name} must be a non-negative number of seconds"
            )));
        }
    }
    if matches!(&config.port_discovery_command, Some(c) if c.trim().is_empty()) {
        return Err(SpawnerError::InvalidConfig(
            "port_discovery_command must not be empty when set".into(),
        ));
    }
    Ok(())
}
