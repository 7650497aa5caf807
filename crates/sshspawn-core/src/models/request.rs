use std::collections::BTreeMap;
use std::time::Duration;

/// One orchestrator call to start a server. Built per call and never mutated.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub username: String,
    pub command_template: String,
    pub environment: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl SpawnRequest {
    pub fn new(username: impl Into<String>, command_template: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            command_template: command_template.into(),
            environment: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
