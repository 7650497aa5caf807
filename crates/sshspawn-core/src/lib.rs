//! Launch single-user servers on remote hosts over SSH and track them.
//!
//! [`SshSpawner`] is the entry point: it selects a host from a [`HostPool`],
//! starts the server detached from the SSH connection, learns its endpoint
//! through a one-line discovery helper, and later polls or stops it.

pub mod error;
pub mod models;
pub mod services;

pub use error::{Result, SpawnerError};
pub use models::{SpawnRequest, SpawnedServerRecord, SpawnerConfig};
pub use services::{HostPool, SshSpawner};
